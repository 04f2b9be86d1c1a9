//! Witness recovery driver and idempotent replay engine.
//!
//! On startup the primary asks each configured witness, in order, for the
//! write records it still holds, then replays them through the command table
//! with at-most-once filtering. Recovery is synchronous and sequential:
//! replay order must match wire order because later records may depend on
//! dedup state set by earlier ones.

use std::io::BufReader;
use std::sync::Arc;

use crate::witness::stream::{RecordReader, StreamFault};
use crate::witness::types::{
    ClientId, CommandHandle, CommandRegistry, DedupLedger, RecoveryRecord, ReplayContext,
    RequestId, WitnessLink,
};

/// Unrecoverable recovery faults. The caller must terminate the process
/// rather than continue with a possibly inconsistent store.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("witness {endpoint}: {fault}")]
    Stream {
        endpoint: String,
        #[source]
        fault: StreamFault,
    },
    #[error("witness {endpoint}: unknown command {name:?} in recovery data")]
    UnknownCommand { endpoint: String, name: String },
    #[error("witness {endpoint}: malformed identity argument for {name:?}")]
    InvalidIdentity { endpoint: String, name: String },
    #[error("witness {endpoint}: replaying {name:?} failed")]
    CommandFailed {
        endpoint: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Result of a full recovery pass over the configured witnesses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// One witness produced a complete stream; recovery stops there.
    Recovered(RecoveryReport),
    /// No witness could be reached and no state was restored. The caller
    /// decides whether to proceed with whatever local state it has.
    NoWitnessData,
}

/// Counters for one successful per-witness recovery attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Record count the witness declared in its stream header.
    pub declared: usize,
    /// Records actually processed; fewer than `declared` on clean early
    /// end-of-stream.
    pub processed: usize,
    /// Records executed against the store.
    pub executed: usize,
    /// Records suppressed because the ledger already saw their identity.
    pub filtered: usize,
    /// Records skipped after a client identity collision.
    pub collisions: usize,
}

/// Per-witness replay session states.
enum SessionState {
    AwaitingHeader,
    AwaitingRecord { declared: usize, processed: usize },
    Done,
}

/// Attempt recovery from each witness in the given fixed order.
///
/// Connection faults skip to the next witness. Faults on an opened stream
/// (format, read, unknown command, bad identity) are unrecoverable unless a
/// later witness completes recovery; the first such fault is returned if
/// none does. The first witness that yields a complete stream wins and no
/// further witnesses are consulted.
pub fn recover_from_witnesses(
    witnesses: &[Arc<dyn WitnessLink>],
    requester_index: &str,
    commands: &dyn CommandRegistry,
    ledger: &dyn DedupLedger,
) -> Result<RecoveryOutcome, RecoveryError> {
    let mut deferred: Option<RecoveryError> = None;

    for link in witnesses {
        let endpoint = link.endpoint();
        let stream = match link.fetch_recovery_stream(requester_index) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    error = ?err,
                    "recovery request failed; trying next witness"
                );
                continue;
            }
        };

        match replay_stream(&endpoint, BufReader::new(stream), commands, ledger) {
            Ok(report) => {
                tracing::info!(
                    endpoint = %endpoint,
                    declared = report.declared,
                    processed = report.processed,
                    executed = report.executed,
                    filtered = report.filtered,
                    collisions = report.collisions,
                    "recovered state from witness data"
                );
                return Ok(RecoveryOutcome::Recovered(report));
            }
            Err(err) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    error = %err,
                    "witness recovery data fault; trying next witness"
                );
                deferred.get_or_insert(err);
            }
        }
    }

    match deferred {
        // A corrupt stream with no later witness to supersede it is fatal.
        Some(err) => Err(err),
        None => {
            tracing::warn!("could not find and recover from any witness");
            Ok(RecoveryOutcome::NoWitnessData)
        }
    }
}

/// Replay one witness's response stream to completion.
fn replay_stream<R: std::io::BufRead>(
    endpoint: &str,
    stream: R,
    commands: &dyn CommandRegistry,
    ledger: &dyn DedupLedger,
) -> Result<RecoveryReport, RecoveryError> {
    let mut reader = RecordReader::new(stream);
    let mut report = RecoveryReport::default();
    let mut state = SessionState::AwaitingHeader;

    loop {
        state = match state {
            SessionState::AwaitingHeader => {
                let declared = reader
                    .read_record_count()
                    .map_err(|fault| RecoveryError::Stream {
                        endpoint: endpoint.to_string(),
                        fault,
                    })?;
                report.declared = declared;
                SessionState::AwaitingRecord {
                    declared,
                    processed: 0,
                }
            }
            SessionState::AwaitingRecord { declared, processed } if processed < declared => {
                match reader.read_record().map_err(|fault| RecoveryError::Stream {
                    endpoint: endpoint.to_string(),
                    fault,
                })? {
                    // Clean end-of-stream before the declared count: normal
                    // end of this witness's recovery data.
                    None => SessionState::Done,
                    Some(record) => {
                        replay_record(endpoint, record, commands, ledger, &mut report)?;
                        report.processed = processed + 1;
                        SessionState::AwaitingRecord {
                            declared,
                            processed: processed + 1,
                        }
                    }
                }
            }
            SessionState::AwaitingRecord { .. } => SessionState::Done,
            SessionState::Done => return Ok(report),
        };
    }
}

/// Replay a single record: resolve the command, filter duplicates and
/// identity collisions, execute against a fresh context.
fn replay_record(
    endpoint: &str,
    record: RecoveryRecord,
    commands: &dyn CommandRegistry,
    ledger: &dyn DedupLedger,
    report: &mut RecoveryReport,
) -> Result<(), RecoveryError> {
    let name = String::from_utf8_lossy(record.name()).into_owned();
    let Some(command) = commands.lookup(record.name()) else {
        return Err(RecoveryError::UnknownCommand {
            endpoint: endpoint.to_string(),
            name,
        });
    };

    let mut ctx = ReplayContext::new(record.args);
    if command.at_most_once() {
        let (client_id, request_id) =
            identity_arguments(&ctx.args).ok_or_else(|| RecoveryError::InvalidIdentity {
                endpoint: endpoint.to_string(),
                name: name.clone(),
            })?;
        ctx.client_id = Some(client_id);
        ctx.request_id = Some(request_id);

        if !ledger.collision_check(client_id) {
            tracing::warn!(client_id, "client identity collision in witness record; skipping");
            report.collisions += 1;
            return Ok(());
        }
        if ledger.is_duplicate(client_id, request_id) {
            report.filtered += 1;
            return Ok(());
        }
    }

    command
        .execute(&mut ctx)
        .map_err(|source| RecoveryError::CommandFailed {
            endpoint: endpoint.to_string(),
            name,
            source,
        })?;

    // Replay is a closed, synchronous computation: a replayed command must
    // not stage client output or suspend. A violation is a programming
    // error in the command implementation, not a data problem.
    assert!(
        ctx.reply_is_empty(),
        "replayed command staged a client reply"
    );
    assert!(!ctx.is_blocked(), "replayed command entered a blocked state");

    report.executed += 1;
    Ok(())
}

/// Interpret the last two arguments as (client id, request id), both ASCII
/// base-10. At-most-once commands always carry them after the payload
/// arguments, so fewer than three arguments cannot be well-formed.
fn identity_arguments(args: &[Vec<u8>]) -> Option<(ClientId, RequestId)> {
    if args.len() < 3 {
        return None;
    }
    let client_id = parse_u64(&args[args.len() - 2])?;
    let request_id = parse_u64(&args[args.len() - 1])?;
    Some((client_id, request_id))
}

fn parse_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse::<u64>().ok()
}
