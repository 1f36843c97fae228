//! Queue directory management.
//!
//! ```text
//! <queue_path>/
//! ├─ LOCK                 # Advisory lock for single-writer
//! ├─ queue.log            # Framed entry snapshots
//! └─ queue.log.compact    # Present only while compacting
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "queue.log";
const COMPACT_TEMP: &str = "queue.log.compact";

/// An opened queue directory holding the exclusive lock.
///
/// Only one `QueueDir` can exist per directory at a time, across
/// processes. The lock is released on drop.
#[derive(Debug)]
pub struct QueueDir {
    path: PathBuf,
    _lock_file: File,
}

impl QueueDir {
    /// Opens or creates a queue directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidDirectory`] if the path is missing (and
    ///   `create_if_missing` is false) or is not a directory
    /// - [`CoreError::QueueLocked`] if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::InvalidDirectory {
                    message: format!("{} does not exist", path.display()),
                });
            }
        }

        if !path.is_dir() {
            return Err(CoreError::InvalidDirectory {
                message: format!("{} is not a directory", path.display()),
            });
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::QueueLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// The directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the queue log.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Path of the temporary log written during compaction.
    #[must_use]
    pub fn compact_temp_path(&self) -> PathBuf {
        self.path.join(COMPACT_TEMP)
    }

    /// Syncs the directory so a rename inside it survives a crash.
    #[cfg(unix)]
    pub fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    /// Directory fsync is not available on this platform; NTFS journals
    /// metadata updates.
    #[cfg(not(unix))]
    pub fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }

    /// Removes a compaction temp file left behind by a crash.
    pub fn remove_stale_temp(&self) -> CoreResult<bool> {
        let temp = self.compact_temp_path();
        if temp.exists() {
            fs::remove_file(temp)?;
            return Ok(true);
        }
        Ok(false)
    }
}
