use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of the record codec.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// The encoding needs at least `needed` bytes but the slot holds `capacity`.
    #[error("encoded record needs at least {needed} bytes, slot holds {capacity}")]
    Overflow { needed: usize, capacity: usize },
    #[error("unsupported key: {0}")]
    InvalidKey(String),
    #[error("string of {len} bytes does not fit a u16 length prefix")]
    StringTooLong { len: usize },
    #[error("record nesting deeper than {limit} levels")]
    TooDeep { limit: usize },
    #[error("record truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("malformed record: unexpected tag {tag} at offset {offset}")]
    Malformed { offset: usize, tag: i32 },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("payload of {len} bytes exceeds slot size {slot_size}")]
    TooLarge { len: usize, slot_size: usize },
    #[error("queue is full ({capacity} slots)")]
    Full { capacity: u32 },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("region {path:?} was created concurrently and never became openable")]
    InitializationRace { path: PathBuf },
    #[error("control region holds read={read} write={write}, outside capacity {capacity}")]
    CorruptControl { read: u32, write: u32, capacity: u32 },
    #[error("region {path:?} maps {actual} bytes, expected {expected}")]
    RegionSize { path: PathBuf, expected: usize, actual: usize },
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    /// Transient failures a caller may retry without changing the record.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Full { .. })
    }
}
