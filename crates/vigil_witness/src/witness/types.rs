//! Shared types and trait contracts for the witness protocol.
//!
//! These are kept in a small, dependency-light module because they sit on
//! the seam between this crate's recovery/GC logic and the node that
//! supplies the command table, dedup ledger, and transport.

use std::io::Read;

/// Identity of the client that issued a write.
pub type ClientId = u64;
/// Per-client request identity; the (client, request) pair names one write.
pub type RequestId = u64;

/// Number of per-witness GC shard buckets. Bucket values are always in
/// `[0, KEY_BUCKET_COUNT)`; witnesses use them to shard held records.
pub const KEY_BUCKET_COUNT: u32 = 1024;

/// One write record pulled back from a witness during recovery: a command
/// invocation as an ordered argument list, `args[0]` being the command name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub args: Vec<Vec<u8>>,
}

impl RecoveryRecord {
    /// Command name argument. The stream reader guarantees at least one
    /// argument per record.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }
}

/// Throwaway stand-in for a client connection, used to run command logic
/// without a network peer. One is constructed per replayed record and owned
/// solely by that iteration.
#[derive(Debug, Default)]
pub struct ReplayContext {
    pub args: Vec<Vec<u8>>,
    pub client_id: Option<ClientId>,
    pub request_id: Option<RequestId>,
    reply: Vec<u8>,
    blocked: bool,
}

impl ReplayContext {
    pub fn new(args: Vec<Vec<u8>>) -> Self {
        Self {
            args,
            client_id: None,
            request_id: None,
            reply: Vec::new(),
            blocked: false,
        }
    }

    /// Stage outbound reply bytes. Replay asserts that no command does this.
    pub fn push_reply(&mut self, bytes: &[u8]) {
        self.reply.extend_from_slice(bytes);
    }

    /// Mark the context as waiting on a condition. Replay asserts that no
    /// command does this; recovery must be a closed, synchronous computation.
    pub fn mark_blocked(&mut self) {
        self.blocked = true;
    }

    pub fn reply_is_empty(&self) -> bool {
        self.reply.is_empty()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }
}

/// Handle to one command resolved from the command table.
pub trait CommandHandle {
    /// Whether the command carries trailing (client id, request id)
    /// arguments and must be applied at most once.
    fn at_most_once(&self) -> bool;

    /// Execute the command against the context. During replay an error here
    /// is treated as unrecoverable data corruption.
    fn execute(&self, ctx: &mut ReplayContext) -> anyhow::Result<()>;
}

/// Command-table contract consumed by the replay engine.
pub trait CommandRegistry {
    fn lookup(&self, name: &[u8]) -> Option<&dyn CommandHandle>;
}

/// Dedup ledger contract consumed by the replay engine.
pub trait DedupLedger: Send + Sync {
    /// Whether the client identity is internally consistent. `false` means
    /// the id collides with a different issuer and its records are skipped.
    fn collision_check(&self, client_id: ClientId) -> bool;

    /// Whether the (client, request) pair has already been applied.
    fn is_duplicate(&self, client_id: ClientId, request_id: RequestId) -> bool;
}

/// Transport seam to one witness replica.
///
/// Recovery is synchronous and blocking by design, so the link is a blocking
/// interface; connection handling and timeouts belong to the implementation.
pub trait WitnessLink: Send + Sync {
    /// Human-readable endpoint label used in diagnostics.
    fn endpoint(&self) -> String;

    /// Send the recovery-data request identifying this primary by
    /// `requester_index` and open the response as a readable stream. An
    /// error here is a connection fault: the caller skips to the next
    /// witness.
    fn fetch_recovery_stream(&self, requester_index: &str) -> std::io::Result<Box<dyn Read>>;

    /// Dispatch a GC payload telling the witness which held records may be
    /// discarded.
    fn send_gc(&self, payload: &[u8]) -> std::io::Result<()>;
}
