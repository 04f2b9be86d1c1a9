//! VigilStore node library.
//!
//! A key-value store node that offloads write durability to witness
//! replicas: `tracker` batches GC records for writes the local `oplog` will
//! fsync, `durability` runs the fsync+GC background worker, and `node` wires
//! the witness recovery protocol from `vigil_witness` into startup.

pub mod command;
pub mod dedup;
pub mod durability;
pub mod kv;
pub mod node;
pub mod oplog;
pub mod resp_server;
pub mod tracker;
pub mod transport;
