//! Command table and handlers.
//!
//! The same table serves both paths: the RESP server resolves and runs
//! commands for live clients, and the witness replay engine resolves them
//! through the `CommandRegistry` contract during recovery. At-most-once
//! handlers record their identity pair in the dedup ledger as part of
//! execution, so replay and the live path stay idempotent under the same
//! rules.

use std::collections::HashMap;
use std::sync::Arc;

use vigil_witness::witness::{CommandHandle, CommandRegistry, ReplayContext};

use crate::dedup::InMemoryLedger;
use crate::kv::KvEngine;

/// Result of running a command on the live path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutput {
    Ok,
    Int(i64),
    Value(Option<Vec<u8>>),
}

#[derive(Clone, Copy, Debug)]
enum CommandKind {
    Get,
    Set,
    Del,
    Incr,
}

#[derive(Clone, Copy, Debug)]
struct CommandSpec {
    name: &'static str,
    kind: CommandKind,
    at_most_once: bool,
    /// Total argument count including the name and, for at-most-once
    /// commands, the trailing client/request identities.
    arity: usize,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "GET",
        kind: CommandKind::Get,
        at_most_once: false,
        arity: 2,
    },
    CommandSpec {
        name: "SET",
        kind: CommandKind::Set,
        at_most_once: true,
        arity: 5,
    },
    CommandSpec {
        name: "DEL",
        kind: CommandKind::Del,
        at_most_once: true,
        arity: 4,
    },
    CommandSpec {
        name: "INCR",
        kind: CommandKind::Incr,
        at_most_once: true,
        arity: 4,
    },
];

/// One command bound to the node's engine and ledger.
pub struct BoundCommand {
    spec: CommandSpec,
    kv: Arc<dyn KvEngine>,
    ledger: Arc<InMemoryLedger>,
}

impl BoundCommand {
    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn at_most_once(&self) -> bool {
        self.spec.at_most_once
    }

    /// Apply the command to the store and return its client-visible output.
    pub fn run(&self, ctx: &mut ReplayContext) -> anyhow::Result<CommandOutput> {
        anyhow::ensure!(
            ctx.args.len() == self.spec.arity,
            "{} expects {} arguments, got {}",
            self.spec.name,
            self.spec.arity - 1,
            ctx.args.len().saturating_sub(1)
        );

        let out = match self.spec.kind {
            CommandKind::Get => CommandOutput::Value(self.kv.get(&ctx.args[1])),
            CommandKind::Set => {
                self.kv.set(ctx.args[1].clone(), ctx.args[2].clone());
                CommandOutput::Ok
            }
            CommandKind::Del => CommandOutput::Int(i64::from(self.kv.del(&ctx.args[1]))),
            CommandKind::Incr => {
                let key = &ctx.args[1];
                let current = match self.kv.get(key) {
                    None => 0i64,
                    Some(raw) => std::str::from_utf8(&raw)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| {
                            anyhow::anyhow!("value at key is not an integer")
                        })?,
                };
                let next = current
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("increment overflows"))?;
                self.kv.set(key.clone(), next.to_string().into_bytes());
                CommandOutput::Int(next)
            }
        };

        if self.spec.at_most_once {
            if let (Some(client_id), Some(request_id)) = (ctx.client_id, ctx.request_id) {
                self.ledger.record_applied(client_id, request_id);
            }
        }
        Ok(out)
    }
}

impl CommandHandle for BoundCommand {
    fn at_most_once(&self) -> bool {
        self.spec.at_most_once
    }

    fn execute(&self, ctx: &mut ReplayContext) -> anyhow::Result<()> {
        self.run(ctx).map(|_| ())
    }
}

/// Command dispatch table shared by the live path and witness replay.
pub struct CommandTable {
    commands: HashMap<&'static str, BoundCommand>,
}

impl CommandTable {
    pub fn new(kv: Arc<dyn KvEngine>, ledger: Arc<InMemoryLedger>) -> Self {
        let mut commands = HashMap::with_capacity(COMMANDS.len());
        for spec in COMMANDS {
            commands.insert(
                spec.name,
                BoundCommand {
                    spec: *spec,
                    kv: kv.clone(),
                    ledger: ledger.clone(),
                },
            );
        }
        Self { commands }
    }

    /// Resolve a command by name, case-insensitively.
    pub fn resolve(&self, name: &[u8]) -> Option<&BoundCommand> {
        let upper = std::str::from_utf8(name).ok()?.to_ascii_uppercase();
        self.commands.get(upper.as_str())
    }

    /// All registered commands.
    pub fn commands(&self) -> impl Iterator<Item = &BoundCommand> {
        self.commands.values()
    }
}

impl CommandRegistry for CommandTable {
    fn lookup(&self, name: &[u8]) -> Option<&dyn CommandHandle> {
        self.resolve(name).map(|cmd| cmd as &dyn CommandHandle)
    }
}
