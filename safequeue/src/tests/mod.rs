use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::{tempdir, TempDir};

use crate::core::{remove_regions, ShmemConfig};
use crate::errors::QueueError;


/// Regions linked from a private temp dir, unlinked when dropped.
pub(crate) struct TestRegions {
    pub cfg: ShmemConfig,
    _dir: TempDir,
}

impl Drop for TestRegions {
    fn drop(&mut self) {
        if let Err(e) = remove_regions(&self.cfg) {
            eprintln!("failed to remove test regions: {}", e);
        }
    }
}

pub(crate) fn setup_regions(capacity: u32, slot_size: usize) -> Result<TestRegions, QueueError> {
    static REGION_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
    init_logging();
    let dir = tempdir()?;
    let id = format!(
        "{}_{}",
        std::process::id(),
        REGION_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    let cfg = ShmemConfig::builder()
        .data_dir(dir.path().to_string_lossy())
        .control_file_name(format!("test_{}.ctrl", id))
        .data_file_name(format!("test_{}.data", id))
        .capacity(capacity)
        .slot_size(slot_size)
        .build()?;
    Ok(TestRegions { cfg, _dir: dir })
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
