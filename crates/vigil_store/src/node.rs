//! Node assembly: shared state, the write path, and startup recovery.
//!
//! Startup order matters: replay the local oplog first so the dedup ledger
//! knows every locally-durable write, then pull the lost tail back from a
//! witness. Witness-replayed writes are re-appended to the oplog so a second
//! crash recovers them locally.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use vigil_witness::witness::{
    self, ClientId, CommandHandle, CommandRegistry, DedupLedger, RecoveryError, RecoveryOutcome,
    ReplayContext, RequestId, WitnessLink,
};

use crate::command::{BoundCommand, CommandOutput, CommandTable};
use crate::dedup::InMemoryLedger;
use crate::durability::DurabilityWorker;
use crate::kv::{KvEngine, MemoryEngine};
use crate::oplog::OpLog;
use crate::tracker::WitnessTracker;

const NODE_META_FILE: &str = "node_meta.json";
const OPLOG_FILE: &str = "oplog";

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub db_id: u64,
    pub requester_index: String,
    pub gc_batch_capacity: usize,
}

/// Identity of this node's database, persisted in the data directory so a
/// restart against the wrong directory fails fast.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
struct NodeMeta {
    db_id: u64,
    requester_index: String,
}

fn load_or_init_meta(dir: &Path, db_id: u64, requester_index: &str) -> anyhow::Result<NodeMeta> {
    let path = dir.join(NODE_META_FILE);
    if path.exists() {
        let bytes = fs::read(&path).context("read node metadata")?;
        let meta: NodeMeta = serde_json::from_slice(&bytes).context("parse node metadata")?;
        anyhow::ensure!(
            meta.db_id == db_id,
            "data dir belongs to database {} but --db-id is {}",
            meta.db_id,
            db_id
        );
        anyhow::ensure!(
            meta.requester_index == requester_index,
            "data dir registered requester index {:?} but --requester-index is {:?}",
            meta.requester_index,
            requester_index
        );
        return Ok(meta);
    }
    let meta = NodeMeta {
        db_id,
        requester_index: requester_index.to_string(),
    };
    let bytes = serde_json::to_vec_pretty(&meta).context("encode node metadata")?;
    fs::write(&path, bytes).context("write node metadata")?;
    Ok(meta)
}

pub struct NodeState {
    pub kv: Arc<dyn KvEngine>,
    pub ledger: Arc<InMemoryLedger>,
    pub commands: CommandTable,
    pub oplog: Arc<OpLog>,
    pub tracker: WitnessTracker,
    /// One logical writer: ledger check, apply, oplog append and GC tracking
    /// stay a single unit.
    write_lock: Mutex<()>,
}

impl NodeState {
    /// Open storage and wire the engine, ledger, command table, durability
    /// worker and tracker together.
    pub fn assemble(
        config: &NodeConfig,
        links: Vec<Arc<dyn WitnessLink>>,
    ) -> anyhow::Result<Arc<Self>> {
        fs::create_dir_all(&config.data_dir).context("create data dir")?;
        load_or_init_meta(&config.data_dir, config.db_id, &config.requester_index)?;

        let oplog = Arc::new(OpLog::open(config.data_dir.join(OPLOG_FILE))?);
        let kv: Arc<dyn KvEngine> = Arc::new(MemoryEngine::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let commands = CommandTable::new(kv.clone(), ledger.clone());
        let worker = DurabilityWorker::spawn(oplog.clone(), links)?;
        let tracker = WitnessTracker::new(config.gc_batch_capacity, config.db_id, worker);

        Ok(Arc::new(Self {
            kv,
            ledger,
            commands,
            oplog,
            tracker,
            write_lock: Mutex::new(()),
        }))
    }

    /// Execute one client command. Reads bypass the write path; at-most-once
    /// writes go through ledger check, apply, oplog append and GC tracking
    /// under the write lock.
    pub fn dispatch(&self, args: Vec<Vec<u8>>) -> anyhow::Result<CommandOutput> {
        anyhow::ensure!(!args.is_empty(), "empty command");
        let Some(cmd) = self.commands.resolve(&args[0]) else {
            anyhow::bail!("unknown command {:?}", String::from_utf8_lossy(&args[0]));
        };

        let mut ctx = ReplayContext::new(args);
        if !cmd.at_most_once() {
            return cmd.run(&mut ctx);
        }

        let (client_id, request_id) = identity_arguments(&ctx.args)
            .ok_or_else(|| anyhow::anyhow!("client id and request id must be integers"))?;
        ctx.client_id = Some(client_id);
        ctx.request_id = Some(request_id);

        let _guard = self.write_lock.lock().expect("write path lock");
        anyhow::ensure!(
            self.ledger.collision_check(client_id),
            "client identity {client_id} collides with a retired issuer"
        );
        if self.ledger.is_duplicate(client_id, request_id) {
            // Acknowledge without re-applying. Result memoization belongs to
            // the RIFL system; this core only suppresses the side effects.
            return Ok(CommandOutput::Ok);
        }

        let out = cmd.run(&mut ctx)?;
        let seq = self.oplog.append(&ctx.args)?;
        self.tracker.record(client_id, request_id, &ctx.args[1], seq);
        Ok(out)
    }

    /// Replay the local oplog into the engine and ledger. Runs before
    /// witness recovery so already-durable writes are filtered there.
    pub fn replay_local_log(&self) -> anyhow::Result<usize> {
        let entries = self.oplog.load()?;
        let count = entries.len();
        for args in entries {
            anyhow::ensure!(!args.is_empty(), "empty oplog entry");
            let Some(cmd) = self.commands.resolve(&args[0]) else {
                anyhow::bail!(
                    "unknown command {:?} in oplog",
                    String::from_utf8_lossy(&args[0])
                );
            };
            let mut ctx = ReplayContext::new(args);
            if cmd.at_most_once() {
                let (client_id, request_id) = identity_arguments(&ctx.args)
                    .ok_or_else(|| anyhow::anyhow!("malformed identity in oplog entry"))?;
                ctx.client_id = Some(client_id);
                ctx.request_id = Some(request_id);
            }
            cmd.run(&mut ctx)?;
        }
        Ok(count)
    }

    /// Pull writes lost in the crash back from witnesses. Replayed commands
    /// also land in the oplog via the re-appending command view.
    pub fn recover_from_witnesses(
        &self,
        witnesses: &[Arc<dyn WitnessLink>],
        requester_index: &str,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let view = RecoveringCommands::new(&self.commands, &self.oplog);
        witness::recover_from_witnesses(witnesses, requester_index, &view, self.ledger.as_ref())
    }

    /// Flush any partial GC batch, e.g. on clean shutdown.
    pub fn flush_gc(&self) {
        self.tracker.flush_now(self.oplog.sequence());
    }
}

/// Interpret the last two arguments as (client id, request id).
fn identity_arguments(args: &[Vec<u8>]) -> Option<(ClientId, RequestId)> {
    if args.len() < 3 {
        return None;
    }
    let parse = |bytes: &[u8]| std::str::from_utf8(bytes).ok()?.parse::<u64>().ok();
    Some((
        parse(&args[args.len() - 2])?,
        parse(&args[args.len() - 1])?,
    ))
}

/// Command view used during witness recovery: executes through the normal
/// table, then re-appends at-most-once commands to the oplog so the
/// recovered writes become locally durable too.
struct RecoveringCommands<'a> {
    handles: HashMap<&'static str, RecoveringHandle<'a>>,
}

struct RecoveringHandle<'a> {
    cmd: &'a BoundCommand,
    oplog: &'a OpLog,
}

impl<'a> RecoveringCommands<'a> {
    fn new(table: &'a CommandTable, oplog: &'a OpLog) -> Self {
        let handles = table
            .commands()
            .map(|cmd| (cmd.name(), RecoveringHandle { cmd, oplog }))
            .collect();
        Self { handles }
    }
}

impl CommandRegistry for RecoveringCommands<'_> {
    fn lookup(&self, name: &[u8]) -> Option<&dyn CommandHandle> {
        let upper = std::str::from_utf8(name).ok()?.to_ascii_uppercase();
        self.handles
            .get(upper.as_str())
            .map(|handle| handle as &dyn CommandHandle)
    }
}

impl CommandHandle for RecoveringHandle<'_> {
    fn at_most_once(&self) -> bool {
        self.cmd.at_most_once()
    }

    fn execute(&self, ctx: &mut ReplayContext) -> anyhow::Result<()> {
        self.cmd.execute(ctx)?;
        if self.cmd.at_most_once() {
            self.oplog.append(&ctx.args).context("append recovered write")?;
        }
        Ok(())
    }
}
