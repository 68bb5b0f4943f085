use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{self, Record, Terminator};
use crate::core::{Region, ShmemConfig, ShmemRegion};
use crate::errors::QueueError;
use crate::ring::{RingStatus, SlotRing};

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    // Plain values precede the `[shmem]` table in TOML.
    pub terminator: Terminator,
    pub shmem: ShmemConfig,
}

/// Producer end of the queue. At most one may push into a queue at a time.
pub struct RecordWriter<R: Region = ShmemRegion> {
    ring: SlotRing<R>,
    terminator: Terminator,
    scratch: Vec<u8>,
}

impl RecordWriter<ShmemRegion> {
    pub fn new(cfg: &WriterConfig) -> Result<RecordWriter<ShmemRegion>, QueueError> {
        let ring = SlotRing::<ShmemRegion>::open(&cfg.shmem)?;
        Ok(RecordWriter::from_ring(ring, cfg.terminator))
    }
}

impl<R: Region> RecordWriter<R> {
    pub fn from_ring(ring: SlotRing<R>, terminator: Terminator) -> RecordWriter<R> {
        let scratch = vec![0u8; ring.slot_size()];
        RecordWriter {
            ring,
            terminator,
            scratch,
        }
    }

    /// Encodes `record` and appends it to the queue.
    ///
    /// Nothing is enqueued unless the whole record fits one slot.
    pub fn push(&mut self, record: &Record) -> Result<(), QueueError> {
        push_record(&mut self.ring, &mut self.scratch, self.terminator, record)
    }

    pub fn status(&self) -> RingStatus {
        self.ring.status()
    }

    pub fn close(self) {
        debug!(status = ?self.ring.status(), "writer closed");
    }
}

pub(crate) fn push_record<R: Region>(
    ring: &mut SlotRing<R>,
    scratch: &mut [u8],
    terminator: Terminator,
    record: &Record,
) -> Result<(), QueueError> {
    let len = match codec::encode_into(record, scratch, terminator) {
        Ok(len) => len,
        Err(e) => {
            warn!(error = %e, "record rejected by encoder");
            return Err(e.into());
        }
    };
    match ring.enqueue(&scratch[..len]) {
        Err(e @ QueueError::Full { .. }) => {
            debug!(len, "queue full");
            Err(e)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HeapRegion;
    use crate::errors::CodecError;

    fn writer(capacity: u32, slot_size: usize) -> RecordWriter<HeapRegion> {
        let ring = SlotRing::<HeapRegion>::in_memory(capacity, slot_size).expect("ring");
        RecordWriter::from_ring(ring, Terminator::Explicit)
    }

    #[test]
    fn push_advances_write_cursor() -> Result<(), QueueError> {
        let mut writer = writer(4, 64);
        writer.push(&Record::new().with("n", 1))?;
        writer.push(&Record::new())?;
        assert_eq!(writer.status().write_cursor, 2);
        Ok(())
    }

    #[test]
    fn oversized_record_is_rejected_without_side_effects() -> Result<(), QueueError> {
        let mut writer = writer(4, 64);
        writer.push(&Record::new().with("n", 1))?;
        let before = writer.status();

        let big = Record::new().with("s", "x".repeat(64));
        assert!(matches!(
            writer.push(&big),
            Err(QueueError::Codec(CodecError::Overflow { capacity: 64, .. }))
        ));
        assert_eq!(writer.status(), before);
        Ok(())
    }

    #[test]
    fn full_queue_is_retryable() -> Result<(), QueueError> {
        let mut writer = writer(2, 32);
        writer.push(&Record::new())?;
        writer.push(&Record::new())?;
        let err = writer.push(&Record::new()).unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);
        Ok(())
    }
}
