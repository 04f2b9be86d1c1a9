//! Background durability worker.
//!
//! The write path hands finished GC batches to a dedicated thread that
//! fsyncs the oplog and then tells witnesses which held records are now
//! safe to discard. Submission is a strict handoff: the caller never blocks
//! on witness I/O or the fsync, and never reads the payload back.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use vigil_witness::witness::{GcPayload, WitnessLink};

use crate::oplog::OpLog;

/// Target of the worker's fsync. Split out from `OpLog` so ordering can be
/// observed in tests.
pub trait FsyncTarget: Send + Sync + 'static {
    fn sync(&self) -> std::io::Result<()>;
}

impl FsyncTarget for OpLog {
    fn sync(&self) -> std::io::Result<()> {
        OpLog::sync(self)
    }
}

/// Work items accepted by the durability worker.
pub enum DurabilityJob {
    /// Fsync the local log through `durable_seq`, then dispatch the GC
    /// payload to witnesses.
    FsyncAndWitnessGc {
        payload: GcPayload,
        durable_seq: u64,
    },
}

/// Handle to the worker thread. Cloneable; dropping every handle stops the
/// worker once its queue drains.
#[derive(Clone)]
pub struct DurabilityWorker {
    tx: mpsc::Sender<DurabilityJob>,
}

impl DurabilityWorker {
    pub fn spawn(
        target: Arc<dyn FsyncTarget>,
        links: Vec<Arc<dyn WitnessLink>>,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("durability".to_string())
            .spawn(move || worker_loop(target, links, rx))
            .context("spawn durability thread")?;
        Ok(Self { tx })
    }

    /// Fire-and-forget handoff of a job to the worker.
    pub fn submit(&self, job: DurabilityJob) {
        if self.tx.send(job).is_err() {
            tracing::error!("durability worker is gone; dropping job");
        }
    }
}

fn worker_loop(
    target: Arc<dyn FsyncTarget>,
    links: Vec<Arc<dyn WitnessLink>>,
    rx: mpsc::Receiver<DurabilityJob>,
) {
    while let Ok(job) = rx.recv() {
        match job {
            DurabilityJob::FsyncAndWitnessGc {
                payload,
                durable_seq,
            } => {
                // The fsync must land before witnesses are told to discard:
                // a record dropped from a witness without a durable local
                // copy would be unrecoverable.
                if let Err(err) = target.sync() {
                    tracing::error!(error = ?err, durable_seq, "oplog fsync failed; keeping witness records");
                    continue;
                }
                for link in &links {
                    if let Err(err) = link.send_gc(payload.bytes()) {
                        // Witnesses just hold the records a while longer.
                        tracing::warn!(
                            endpoint = %link.endpoint(),
                            error = ?err,
                            "witness gc dispatch failed"
                        );
                    }
                }
                tracing::debug!(
                    records = payload.record_count(),
                    durable_seq,
                    "fsynced and dispatched witness gc"
                );
            }
        }
    }
}
