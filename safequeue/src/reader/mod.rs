use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{self, Record};
use crate::core::{Region, ShmemConfig, ShmemRegion};
use crate::errors::QueueError;
use crate::ring::{RingStatus, SlotRing};

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub shmem: ShmemConfig,
}

/// Consumer end of the queue. At most one may pop from a queue at a time.
pub struct RecordReader<R: Region = ShmemRegion> {
    ring: SlotRing<R>,
}

impl RecordReader<ShmemRegion> {
    pub fn new(cfg: &ReaderConfig) -> Result<RecordReader<ShmemRegion>, QueueError> {
        let ring = SlotRing::<ShmemRegion>::open(&cfg.shmem)?;
        Ok(RecordReader { ring })
    }
}

impl<R: Region> RecordReader<R> {
    pub fn from_ring(ring: SlotRing<R>) -> RecordReader<R> {
        RecordReader { ring }
    }

    /// Takes the oldest record off the queue; `Ok(None)` when there is none.
    ///
    /// A slot that fails to decode is still consumed: the error is returned
    /// and the next call moves on to the following record.
    pub fn pop(&mut self) -> Result<Option<Record>, QueueError> {
        pop_record(&mut self.ring)
    }

    pub fn status(&self) -> RingStatus {
        self.ring.status()
    }

    pub fn close(self) {
        debug!(status = ?self.ring.status(), "reader closed");
    }
}

pub(crate) fn pop_record<R: Region>(ring: &mut SlotRing<R>) -> Result<Option<Record>, QueueError> {
    match ring.dequeue_with(codec::decode) {
        None => Ok(None),
        Some(Ok(record)) => Ok(Some(record)),
        Some(Err(e)) => {
            warn!(error = %e, status = ?ring.status(), "dropped undecodable record");
            Err(e.into())
        }
    }
}
