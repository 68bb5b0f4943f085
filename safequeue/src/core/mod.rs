use std::alloc::{self, Layout};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::QueueError;

pub const DEFAULT_CAPACITY: u32 = 1024;
pub const DEFAULT_SLOT_SIZE: usize = 1024;
pub const MAX_CAPACITY: u32 = 1 << 31;
/// read cursor (u32) + write cursor (u32)
pub const CONTROL_SIZE: usize = 8;
/// Smallest slot that can hold a tag.
pub const MIN_SLOT_SIZE: usize = 4;

pub static CONTROL_FILE_NAME: &str = "safequeue.ctrl";
pub static DATA_FILE_NAME: &str = "safequeue.data";

const REGION_ALIGNMENT: usize = 64;
const OPEN_ATTEMPTS: usize = 100;
const OPEN_BACKOFF: Duration = Duration::from_millis(1);

/// Where the two regions of a queue live and how the data region is sliced.
///
/// Every process attached to a queue must use the same `capacity` and
/// `slot_size`. The regions carry no record of their shape: attaching checks
/// only that the data region holds `capacity * slot_size` bytes and that the
/// cursors fit `capacity`, so a layout with the same footprint (8 x 64 against
/// 4 x 128) attaches and then reads garbage. Use distinct file names per
/// layout, or [`remove_regions`] before changing it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Directory holding the file links of both regions.
    pub data_dir: String,
    pub control_file_name: String,
    pub data_file_name: String,
    /// Number of slots; a power of two.
    pub capacity: u32,
    /// Bytes per slot.
    pub slot_size: usize,
}

impl Default for ShmemConfig {
    fn default() -> ShmemConfig {
        ShmemConfig {
            data_dir: "/dev/shm".to_string(),
            control_file_name: CONTROL_FILE_NAME.to_string(),
            data_file_name: DATA_FILE_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder {
            cfg: ShmemConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.capacity == 0 || !self.capacity.is_power_of_two() || self.capacity > MAX_CAPACITY {
            return Err(QueueError::Config(format!(
                "capacity {} must be a power of two between 1 and {}",
                self.capacity, MAX_CAPACITY
            )));
        }
        if self.slot_size < MIN_SLOT_SIZE {
            return Err(QueueError::Config(format!(
                "slot_size {} is below the minimum of {}",
                self.slot_size, MIN_SLOT_SIZE
            )));
        }
        if self.control_file_name.is_empty() || self.data_file_name.is_empty() {
            return Err(QueueError::Config("region file names must not be empty".to_string()));
        }
        if self.control_file_name == self.data_file_name {
            return Err(QueueError::Config(format!(
                "control and data regions share the file name {:?}",
                self.data_file_name
            )));
        }
        self.data_len()?;
        Ok(())
    }

    pub fn control_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.control_file_name)
    }

    pub fn data_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.data_file_name)
    }

    /// Size of the data region in bytes.
    pub fn data_len(&self) -> Result<usize, QueueError> {
        (self.capacity as usize).checked_mul(self.slot_size).ok_or_else(|| {
            QueueError::Config(format!(
                "{} slots of {} bytes overflow the address space",
                self.capacity, self.slot_size
            ))
        })
    }
}

pub struct ShmemConfigBuilder {
    cfg: ShmemConfig,
}

impl ShmemConfigBuilder {
    pub fn data_dir<S: Into<String>>(mut self, data_dir: S) -> Self {
        self.cfg.data_dir = data_dir.into();
        self
    }

    pub fn control_file_name<S: Into<String>>(mut self, name: S) -> Self {
        self.cfg.control_file_name = name.into();
        self
    }

    pub fn data_file_name<S: Into<String>>(mut self, name: S) -> Self {
        self.cfg.data_file_name = name.into();
        self
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.cfg.capacity = capacity;
        self
    }

    pub fn slot_size(mut self, slot_size: usize) -> Self {
        self.cfg.slot_size = slot_size;
        self
    }

    pub fn build(self) -> Result<ShmemConfig, QueueError> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// Fixed-size byte region the ring is laid over.
///
/// # Safety
///
/// `as_ptr` must return a pointer to `len()` bytes, aligned to at least 8,
/// that stays valid and at the same address for the lifetime of the value.
/// The bytes may be changed at any time by another mapping of the same
/// memory, so implementors must not hand out references to them.
pub unsafe trait Region {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// A file-linked shared memory mapping.
///
/// Mappings are never unlinked when the handle drops, so the memory outlives
/// every process using it until reboot or [`remove_regions`].
pub struct ShmemRegion {
    shmem: Shmem,
    path: PathBuf,
    created: bool,
}

impl ShmemRegion {
    /// Maps the region linked at `path`, creating it with `len` zeroed bytes
    /// if no process has done so yet.
    ///
    /// Creation is exclusive: of several processes racing here, exactly one
    /// sees `created() == true`, the others map the winner's memory.
    pub fn open_or_create(path: &Path, len: usize) -> Result<ShmemRegion, QueueError> {
        match ShmemConf::new().size(len).flink(path).create() {
            Ok(mut shmem) => {
                shmem.set_owner(false);
                info!(path = %path.display(), len, os_id = shmem.get_os_id(), "created shared region");
                Ok(ShmemRegion {
                    shmem,
                    path: path.to_path_buf(),
                    created: true,
                })
            }
            Err(ShmemError::LinkExists) => {
                debug!(path = %path.display(), "region already linked, opening");
                ShmemRegion::open(path, len)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Maps an existing region that must hold at least `len` bytes.
    pub fn open(path: &Path, len: usize) -> Result<ShmemRegion, QueueError> {
        let mut last_err = None;
        for _ in 0..OPEN_ATTEMPTS {
            match ShmemConf::new().flink(path).open() {
                Ok(shmem) => {
                    if shmem.len() < len {
                        return Err(QueueError::RegionSize {
                            path: path.to_path_buf(),
                            expected: len,
                            actual: shmem.len(),
                        });
                    }
                    debug!(path = %path.display(), len = shmem.len(), "opened shared region");
                    return Ok(ShmemRegion {
                        shmem,
                        path: path.to_path_buf(),
                        created: false,
                    });
                }
                Err(e) => {
                    // The creator links the file before writing the mapping id into it.
                    last_err = Some(e);
                    thread::sleep(OPEN_BACKOFF);
                }
            }
        }
        let link_len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        match last_err {
            Some(e) if link_len > 0 => Err(e.into()),
            last => {
                warn!(path = %path.display(), error = ?last, "region link never became openable");
                Err(QueueError::InitializationRace {
                    path: path.to_path_buf(),
                })
            }
        }
    }

    /// Whether this handle created the region (and so must initialise it).
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlinks the mapping and its link file when this handle drops.
    pub fn unlink_on_drop(&mut self) {
        self.shmem.set_owner(true);
    }
}

// The mapping is valid process-wide; the handle has no thread affinity.
unsafe impl Send for ShmemRegion {}

unsafe impl Region for ShmemRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    fn len(&self) -> usize {
        self.shmem.len()
    }
}

/// Zeroed, process-private region for single-process queues and tests.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapRegion {
    pub fn zeroed(len: usize) -> Result<HeapRegion, QueueError> {
        let layout = Layout::from_size_align(len.max(1), REGION_ALIGNMENT)
            .map_err(|e| QueueError::Config(format!("cannot lay out {} bytes: {}", len, e)))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            QueueError::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("failed to allocate {} bytes", len),
            ))
        })?;
        Ok(HeapRegion { ptr, layout })
    }
}

// Owns its allocation like a `Box<[u8]>`.
unsafe impl Send for HeapRegion {}

unsafe impl Region for HeapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

pub fn data_context(cfg: &ShmemConfig) -> Result<ShmemRegion, QueueError> {
    cfg.validate()?;
    ShmemRegion::open_or_create(&cfg.data_path(), cfg.data_len()?)
}

pub fn control_context(cfg: &ShmemConfig) -> Result<ShmemRegion, QueueError> {
    cfg.validate()?;
    ShmemRegion::open_or_create(&cfg.control_path(), CONTROL_SIZE)
}

/// Unlinks both regions of `cfg`. Processes still mapping them keep their
/// memory; the next open creates fresh regions.
pub fn remove_regions(cfg: &ShmemConfig) -> Result<(), QueueError> {
    for path in [cfg.control_path(), cfg.data_path()] {
        match ShmemConf::new().flink(&path).open() {
            Ok(mut shmem) => {
                shmem.set_owner(true);
                drop(shmem);
                info!(path = %path.display(), "removed shared region");
            }
            Err(e) => debug!(path = %path.display(), error = %e, "no region to unmap"),
        }
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
    }
    Ok(())
}
