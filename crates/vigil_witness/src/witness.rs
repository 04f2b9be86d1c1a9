//! Witness module wiring.
//!
//! `gc` holds the batch accumulator and GC payload builder, `stream` the
//! recovery wire reader, `recovery` the replay driver, and `types` the shared
//! identifiers and trait contracts (command table, dedup ledger, witness
//! link).

mod gc;
mod recovery;
mod stream;
mod types;

pub use gc::{GcBatch, GcPayload, GcRecord, DEFAULT_GC_BATCH_CAPACITY, GC_RECORD_WIRE_BYTES};
pub use recovery::{recover_from_witnesses, RecoveryError, RecoveryOutcome, RecoveryReport};
pub use stream::{RecordReader, StreamFault};
pub use types::{
    ClientId, CommandHandle, CommandRegistry, DedupLedger, RecoveryRecord, ReplayContext,
    RequestId, WitnessLink, KEY_BUCKET_COUNT,
};
