// VigilStore node binary entry point.
//
// This file wires together the KV engine, oplog, durability worker, witness
// links, and the RESP server, and runs witness recovery before the node
// starts serving clients.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use vigil_store::node::{NodeConfig, NodeState};
use vigil_store::resp_server;
use vigil_store::transport::{parse_witness_list, TcpWitnessLink};
use vigil_witness::witness::{RecoveryOutcome, WitnessLink, DEFAULT_GC_BATCH_CAPACITY};

#[derive(Debug, Parser)]
#[command(name = "vigil-store", about = "Witness-backed key-value store node")]
struct NodeArgs {
    /// Address for the RESP client listener.
    #[arg(long, default_value = "127.0.0.1:6479")]
    listen: SocketAddr,

    /// Data directory holding the oplog and node metadata.
    #[arg(long)]
    data_dir: PathBuf,

    /// Logical database id; seeds the witness key-bucket hash.
    #[arg(long, default_value_t = 0)]
    db_id: u64,

    /// Index identifying this primary in recovery requests to witnesses.
    #[arg(long, default_value = "1")]
    requester_index: String,

    /// Comma-separated witness endpoints, consulted in this order during
    /// recovery.
    #[arg(long, default_value = "")]
    witnesses: String,

    /// GC records accumulated before an fsync+GC flush.
    #[arg(long, default_value_t = DEFAULT_GC_BATCH_CAPACITY)]
    gc_batch_size: usize,

    /// Witness connect/read/write timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    witness_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = NodeArgs::parse();
    run_node(args).await
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let gc_batch_size = read_env_usize("VIGIL_GC_BATCH_SIZE", args.gc_batch_size).max(1);
    let timeout = Duration::from_millis(args.witness_timeout_ms.max(1));
    let links: Vec<Arc<dyn WitnessLink>> = parse_witness_list(&args.witnesses)?
        .into_iter()
        .map(|addr| Arc::new(TcpWitnessLink::with_timeout(addr, timeout)) as Arc<dyn WitnessLink>)
        .collect();

    let config = NodeConfig {
        data_dir: args.data_dir.clone(),
        db_id: args.db_id,
        requester_index: args.requester_index.clone(),
        gc_batch_capacity: gc_batch_size,
    };
    let state = NodeState::assemble(&config, links.clone())?;

    let replayed = state.replay_local_log().context("replay local oplog")?;
    tracing::info!(replayed, "replayed local oplog");

    if links.is_empty() {
        tracing::warn!("no witnesses configured; running with local durability only");
    } else {
        // Witness recovery is synchronous and runs to completion before the
        // node serves clients. An unrecoverable data fault ends the process
        // here rather than risking an inconsistent store.
        match state.recover_from_witnesses(&links, &args.requester_index) {
            Ok(RecoveryOutcome::Recovered(report)) => tracing::info!(
                declared = report.declared,
                processed = report.processed,
                executed = report.executed,
                filtered = report.filtered,
                collisions = report.collisions,
                "witness recovery complete"
            ),
            Ok(RecoveryOutcome::NoWitnessData) => {
                tracing::warn!("no witness yielded recovery data; proceeding with local state only");
            }
            Err(err) => {
                tracing::error!(error = %err, "unrecoverable fault in witness recovery data");
                return Err(err.into());
            }
        }
    }

    tokio::select! {
        res = resp_server::run(args.listen, state.clone()) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            // Hand any partial GC batch to the durability worker so
            // witnesses are not left holding already-durable records.
            state.flush_gc();
            Ok(())
        }
    }
}

fn read_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
