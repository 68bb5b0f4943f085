use tracing::warn;

use crate::codec::{Record, Terminator};
use crate::core::{HeapRegion, Region, ShmemRegion};
use crate::errors::QueueError;
use crate::reader::pop_record;
use crate::ring::{RingStatus, SlotRing};
use crate::writer::{push_record, WriterConfig};

/// Both ends of a queue behind one handle, the surface a host-language
/// binding exposes.
///
/// The single-producer/single-consumer contract holds across handles: of all
/// handles on the same regions, only one may push and only one may pop.
pub struct SafeQueue<R: Region = ShmemRegion> {
    ring: SlotRing<R>,
    terminator: Terminator,
    scratch: Vec<u8>,
}

impl SafeQueue<ShmemRegion> {
    pub fn open(cfg: &WriterConfig) -> Result<SafeQueue<ShmemRegion>, QueueError> {
        let ring = SlotRing::<ShmemRegion>::open(&cfg.shmem)?;
        Ok(SafeQueue::from_ring(ring, cfg.terminator))
    }
}

impl SafeQueue<HeapRegion> {
    pub fn in_memory(capacity: u32, slot_size: usize) -> Result<SafeQueue<HeapRegion>, QueueError> {
        let ring = SlotRing::<HeapRegion>::in_memory(capacity, slot_size)?;
        Ok(SafeQueue::from_ring(ring, Terminator::default()))
    }
}

impl<R: Region> SafeQueue<R> {
    pub fn from_ring(ring: SlotRing<R>, terminator: Terminator) -> SafeQueue<R> {
        let scratch = vec![0u8; ring.slot_size()];
        SafeQueue {
            ring,
            terminator,
            scratch,
        }
    }

    pub fn try_push(&mut self, record: &Record) -> Result<(), QueueError> {
        push_record(&mut self.ring, &mut self.scratch, self.terminator, record)
    }

    pub fn try_pop(&mut self) -> Result<Option<Record>, QueueError> {
        pop_record(&mut self.ring)
    }

    /// `false` when the record was not enqueued: too large, unencodable, or
    /// the queue is full.
    pub fn push(&mut self, record: &Record) -> bool {
        match self.try_push(record) {
            Ok(()) => true,
            // a full queue is routine for a caller that retries
            Err(e) if e.is_retryable() => false,
            Err(e) => {
                warn!(error = %e, "push failed");
                false
            }
        }
    }

    /// `None` when nothing is available. An undecodable record is logged and
    /// skipped.
    pub fn pop(&mut self) -> Option<Record> {
        match self.try_pop() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "pop failed");
                None
            }
        }
    }

    pub fn status(&self) -> RingStatus {
        self.ring.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    fn sample(i: i32) -> Record {
        Record::new()
            .with("a", i)
            .with("b", Record::new().with("c", "x").with("d", true))
    }

    #[test]
    fn fifo_order() {
        let mut queue = SafeQueue::<HeapRegion>::in_memory(8, 128).expect("queue");
        for i in 0..5 {
            assert!(queue.push(&sample(i)));
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(sample(i)));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn push_reports_failure_as_false() {
        let mut queue = SafeQueue::<HeapRegion>::in_memory(2, 64).expect("queue");
        assert!(!queue.push(&Record::new().with("s", "x".repeat(100))));
        assert!(!queue.push(&Record::new().with(f64::NAN, 1)));
        assert!(queue.status().is_empty());

        assert!(queue.push(&Record::new()));
        assert!(queue.push(&Record::new()));
        assert!(!queue.push(&Record::new()), "third push must hit a full queue");
        assert!(queue.status().is_full());
    }

    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn full_queue_is_not_warned_about() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(Arc::clone(&warnings)));
        tracing::subscriber::with_default(subscriber, || {
            let mut queue = SafeQueue::<HeapRegion>::in_memory(1, 64).expect("queue");
            assert!(queue.push(&sample(0)));
            for i in 1..100 {
                assert!(!queue.push(&sample(i)));
            }
            assert_eq!(warnings.load(Ordering::SeqCst), 0);

            queue.pop().expect("first record");
            assert!(!queue.push(&Record::new().with("s", "x".repeat(100))));
            assert!(warnings.load(Ordering::SeqCst) > 0);
        });
    }

    #[test]
    fn empty_nested_record_survives_the_ring() -> Result<(), QueueError> {
        let mut queue = SafeQueue::<HeapRegion>::in_memory(2, 64)?;
        queue.try_push(&Record::new().with("e", Record::new()))?;
        let got = queue.try_pop()?.expect("record");
        assert_eq!(got.get("e"), Some(&Value::Record(Record::new())));
        Ok(())
    }
}
