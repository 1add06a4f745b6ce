// src/store/lock.rs

//! Cross-process advisory lock around manifest read-modify-write cycles

use crate::error::{Error, Result};
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Interval between lock attempts while another process holds it
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exclusive lock on the store, released on drop or process exit
#[derive(Debug)]
pub struct StoreLock {
    file: File,
}

impl StoreLock {
    /// Acquire the lock, waiting up to `timeout`
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired store lock {}", path.display());
                    return Ok(Self { file });
                }
                Err(err) if is_contended(&err) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(Error::ManifestLocked {
                            path: path.to_path_buf(),
                            waited,
                        });
                    }
                    thread::sleep(POLL_INTERVAL.min(timeout - waited));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".syrviscore.lock");

        let held = StoreLock::acquire(&path, Duration::from_secs(1)).unwrap();
        let second = StoreLock::acquire(&path, Duration::from_millis(250));
        match second {
            Err(Error::ManifestLocked { waited, .. }) => {
                assert!(waited >= Duration::from_millis(250));
            }
            other => panic!("expected ManifestLocked, got {:?}", other),
        }

        drop(held);
        assert!(StoreLock::acquire(&path, Duration::from_millis(250)).is_ok());
    }

    #[test]
    fn test_lock_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".syrviscore.lock");

        let held = StoreLock::acquire(&path, Duration::from_secs(1)).unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            drop(held);
        });

        let acquired = StoreLock::acquire(&path, Duration::from_secs(5));
        releaser.join().unwrap();
        assert!(acquired.is_ok());
    }
}
