//! Host-local serialization of provisioning runs.
//!
//! An OS-level exclusive advisory lock on a well-known file keeps two runs on
//! the same host from interleaving writes to the same config files. It makes
//! no promise across hosts; that is the cluster lock's job.

use crate::error::StevedoreResult;
use fs4::fs_std::FileExt;
use log::{error, info};
use std::fs::{self, OpenOptions};
use std::path::Path;

const LOCK_FILE_NAME: &str = "setup.lock";

/// Run `body` while holding the exclusive host lock under `lock_dir`.
///
/// Creation of the lock directory is best-effort: a failure is logged and we
/// proceed, since an earlier run may have created it already and the open
/// below gives the authoritative error. Acquisition blocks until the lock is
/// free; release happens on every exit path, including errors from `body`.
pub fn with_node_lock<T>(
    lock_dir: &Path,
    body: impl FnOnce() -> StevedoreResult<T>,
) -> StevedoreResult<T> {
    if !lock_dir.is_dir() {
        if let Err(err) = fs::create_dir_all(lock_dir) {
            error!("unable to create lock directory {}: {err}", lock_dir.display());
        }
    }

    let lock_path = lock_dir.join(LOCK_FILE_NAME);
    info!("acquiring the node lock at {}", lock_path.display());
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    file.lock_exclusive()?;
    info!("acquired the node lock at {}", lock_path.display());

    let result = body();

    let _ = FileExt::unlock(&file);
    info!("released the node lock at {}", lock_path.display());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StevedoreError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn lock_is_released_after_body_error() {
        let dir = tempdir().unwrap();

        let outcome: StevedoreResult<()> = with_node_lock(dir.path(), || {
            Err(StevedoreError::InvalidConfig("boom".into()))
        });
        assert!(outcome.is_err());

        // A second run can still take the lock.
        let reacquired = with_node_lock(dir.path(), || Ok(42)).unwrap();
        assert_eq!(reacquired, 42);
    }

    #[test]
    fn concurrent_runs_on_one_host_never_overlap() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let in_section = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let path = path.clone();
            let in_section = Arc::clone(&in_section);
            handles.push(thread::spawn(move || {
                with_node_lock(&path, || {
                    assert!(
                        !in_section.swap(true, Ordering::SeqCst),
                        "two runs entered the locked section at once"
                    );
                    thread::sleep(Duration::from_millis(20));
                    in_section.store(false, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn lock_directory_is_created_when_missing() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("etc/ostor/setup");
        with_node_lock(&nested, || Ok(())).unwrap();
        assert!(nested.join(LOCK_FILE_NAME).is_file());
    }
}
