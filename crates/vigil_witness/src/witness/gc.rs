//! GC batch accumulator and request payload builder.
//!
//! Witnesses hold one copy of every acknowledged write until the primary has
//! made it durable locally. The write path accumulates per-write GC records
//! here and, when the batch fills, builds a single payload the durability
//! worker dispatches to witnesses after the local fsync.

use crate::witness::types::{ClientId, RequestId, KEY_BUCKET_COUNT};

/// Byte width of one GC record on the wire: client id + request id + bucket.
pub const GC_RECORD_WIRE_BYTES: usize = 2 * 8 + 4;

/// Default number of records accumulated before a flush.
pub const DEFAULT_GC_BATCH_CAPACITY: usize = 20;

/// One acknowledged write whose witness-held copy is eligible for deletion
/// once the primary has fsynced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcRecord {
    pub client_id: ClientId,
    pub request_id: RequestId,
    pub key_bucket: u32,
}

/// Serialized GC request addressed to witnesses. Ownership passes to the
/// durability worker on handoff; the producing side never reads it back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcPayload {
    bytes: Vec<u8>,
    record_count: usize,
}

impl GcPayload {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }
}

/// Fixed-capacity accumulator of GC records. Insertion order is significant:
/// it determines serialization order in the outbound payload.
#[derive(Debug)]
pub struct GcBatch {
    records: Vec<GcRecord>,
    capacity: usize,
}

impl GcBatch {
    /// Create an empty batch. `capacity` must be non-zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "gc batch capacity must be non-zero");
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record. When the append fills the batch, the payload is
    /// built and the batch resets to empty before this returns, so a record
    /// is never silently dropped and size never exceeds capacity.
    pub fn push(&mut self, record: GcRecord) -> Option<GcPayload> {
        debug_assert!(record.key_bucket < KEY_BUCKET_COUNT);
        debug_assert!(self.records.len() < self.capacity);
        self.records.push(record);
        if self.records.len() == self.capacity {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Build a payload from the accumulated records and reset to empty.
    /// The payload byte length is `GC_RECORD_WIRE_BYTES * record_count`.
    pub fn flush(&mut self) -> GcPayload {
        let mut bytes = Vec::with_capacity(GC_RECORD_WIRE_BYTES * self.records.len());
        for record in &self.records {
            bytes.extend_from_slice(&record.client_id.to_be_bytes());
            bytes.extend_from_slice(&record.request_id.to_be_bytes());
            bytes.extend_from_slice(&record.key_bucket.to_be_bytes());
        }
        let record_count = self.records.len();
        self.records.clear();
        GcPayload {
            bytes,
            record_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(i: u64) -> GcRecord {
        GcRecord {
            client_id: 100 + i,
            request_id: 200 + i,
            key_bucket: (i as u32) % KEY_BUCKET_COUNT,
        }
    }

    #[test]
    fn below_capacity_accumulates_in_order_without_flush() {
        let mut batch = GcBatch::with_capacity(20);
        for i in 0..19 {
            assert!(batch.push(record(i)).is_none());
            assert_eq!(batch.len(), (i + 1) as usize);
        }
        assert_eq!(batch.records[3], record(3));
        assert_eq!(batch.records[18], record(18));
    }

    #[test]
    fn filling_push_flushes_all_records_in_insertion_order() {
        let mut batch = GcBatch::with_capacity(20);
        let mut payload = None;
        for i in 0..20 {
            payload = batch.push(record(i));
        }
        let payload = payload.expect("capacity push must flush");
        assert!(batch.is_empty());
        assert_eq!(payload.record_count(), 20);

        // Decode the payload and confirm order and field layout.
        let bytes = payload.bytes();
        assert_eq!(bytes.len(), GC_RECORD_WIRE_BYTES * 20);
        for i in 0..20u64 {
            let base = GC_RECORD_WIRE_BYTES * i as usize;
            let client = u64::from_be_bytes(bytes[base..base + 8].try_into().unwrap());
            let request = u64::from_be_bytes(bytes[base + 8..base + 16].try_into().unwrap());
            let bucket = u32::from_be_bytes(bytes[base + 16..base + 20].try_into().unwrap());
            assert_eq!(client, 100 + i);
            assert_eq!(request, 200 + i);
            assert_eq!(bucket, (i as u32) % KEY_BUCKET_COUNT);
        }
    }

    #[test]
    fn payload_length_matches_record_count() {
        for count in [0usize, 1, 7, 20] {
            let mut batch = GcBatch::with_capacity(32);
            for i in 0..count {
                batch.push(record(i as u64));
            }
            let payload = batch.flush();
            assert_eq!(payload.record_count(), count);
            assert_eq!(payload.bytes().len(), GC_RECORD_WIRE_BYTES * count);
        }
    }

    #[test]
    fn batch_is_reusable_after_flush() {
        let mut batch = GcBatch::with_capacity(2);
        assert!(batch.push(record(0)).is_none());
        assert!(batch.push(record(1)).is_some());
        assert!(batch.push(record(2)).is_none());
        assert_eq!(batch.len(), 1);
    }
}
