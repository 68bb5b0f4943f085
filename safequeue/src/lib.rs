//! Crash-durable record queue over shared memory.
//!
//! A producer process pushes nested key/value [`Record`]s and a consumer
//! process pops them, in order, through a fixed ring of slots mapped from
//! file-linked shared memory. Either process may crash and come back: the
//! ring and everything not yet popped stay in memory until reboot.

pub mod codec;
pub mod core;
mod errors;
pub mod queue;
pub mod reader;
pub mod ring;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::codec::{Key, Record, Terminator, Value};
pub use crate::core::ShmemConfig;
pub use crate::errors::{CodecError, QueueError};
pub use crate::queue::SafeQueue;
pub use crate::reader::{ReaderConfig, RecordReader};
pub use crate::ring::{RingStatus, SlotRing};
pub use crate::writer::{RecordWriter, WriterConfig};

pub const DEFAULT_CAPACITY: u32 = crate::core::DEFAULT_CAPACITY;
pub const DEFAULT_SLOT_SIZE: usize = crate::core::DEFAULT_SLOT_SIZE;
