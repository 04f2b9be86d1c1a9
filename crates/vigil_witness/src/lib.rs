//! Witness durability protocol crate.
//!
//! This crate provides the witness-facing half of VigilStore's durability
//! story. The API surface is intentionally small: higher layers supply a
//! `CommandRegistry`, a `DedupLedger`, and one `WitnessLink` per configured
//! witness, then drive crash recovery through `recover_from_witnesses` and
//! write-path garbage collection through `GcBatch`.

pub mod witness;
