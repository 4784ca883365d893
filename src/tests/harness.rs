use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::config::Options;

pub fn test_options(dir: &TempDir) -> Options {
    Options::new(dir.path()).unwrap()
}

/// Options with a small SSTable target so a test can force rotations and
/// flushes with little data.
pub fn small_sst_options(dir: &TempDir, sst_size: usize) -> Options {
    let mut opts = Options::new(dir.path()).unwrap();
    opts.sst_size = sst_size;
    opts.sst_data_block_size = 512;
    opts
}

/// Recursive copy tolerant of files vanishing mid-walk (a live background
/// worker may be retiring wal files while we copy).
pub fn copy_dir(from: &std::path::Path, to: &std::path::Path) {
    std::fs::create_dir_all(to).unwrap();
    let entries = match std::fs::read_dir(from) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if src.is_dir() {
            copy_dir(&src, &dst);
        } else {
            let _ = std::fs::copy(&src, &dst);
        }
    }
}

/// Poll `cond` until it holds or `timeout` elapses; returns whether it held.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
