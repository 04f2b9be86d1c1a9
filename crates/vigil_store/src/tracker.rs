//! Write-path witness GC tracking.
//!
//! Every acknowledged at-most-once write leaves a GC record here. When the
//! batch fills, the payload is built and handed to the durability worker in
//! the same call, together with the write sequence number the fsync must
//! reach before witnesses may discard.

use std::sync::Mutex;

use vigil_witness::witness::{ClientId, GcBatch, GcRecord, RequestId};

use crate::durability::{DurabilityJob, DurabilityWorker};
use crate::kv::key_bucket;

pub struct WitnessTracker {
    batch: Mutex<GcBatch>,
    db_id: u64,
    worker: DurabilityWorker,
}

impl WitnessTracker {
    pub fn new(capacity: usize, db_id: u64, worker: DurabilityWorker) -> Self {
        Self {
            batch: Mutex::new(GcBatch::with_capacity(capacity)),
            db_id,
            worker,
        }
    }

    /// Track one acknowledged write. If this record fills the batch, the
    /// flush is triggered before returning.
    pub fn record(&self, client_id: ClientId, request_id: RequestId, key: &[u8], seq: u64) {
        let record = GcRecord {
            client_id,
            request_id,
            key_bucket: key_bucket(self.db_id, key),
        };
        let mut batch = self.batch.lock().expect("witness tracker lock");
        if let Some(payload) = batch.push(record) {
            self.worker.submit(DurabilityJob::FsyncAndWitnessGc {
                payload,
                durable_seq: seq,
            });
        }
    }

    /// Flush whatever is accumulated, e.g. at shutdown, so witnesses are not
    /// left holding records for writes that are already durable.
    pub fn flush_now(&self, seq: u64) {
        let mut batch = self.batch.lock().expect("witness tracker lock");
        if batch.is_empty() {
            return;
        }
        let payload = batch.flush();
        self.worker.submit(DurabilityJob::FsyncAndWitnessGc {
            payload,
            durable_seq: seq,
        });
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.batch.lock().expect("witness tracker lock").len()
    }
}
