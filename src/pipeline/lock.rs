use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

use crate::LibrarianError;

/// Name of the lock file inside the database root
pub const LOCK_FILE: &str = ".build.lock";

static BUILD_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

// A status check holds a shared lock for a moment; builds wait this long for it
const LOCK_ATTEMPTS: u32 = 5;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Whether a build currently holds the lock on a database root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    /// Held, with the `pid timestamp` line the holder wrote when it took the lock
    Held { holder: Option<String> },
}

/// Held for the duration of one build.
///
/// Only one build may run at a time, both inside this process (guarded by a
/// flag) and across processes sharing a database root (guarded by an
/// exclusive advisory lock on [`LOCK_FILE`]). Dropping the guard releases both.
#[derive(Debug)]
pub struct BuildLock {
    file: File,
    path: PathBuf,
}

impl BuildLock {
    #[inline]
    pub fn acquire(db_root: &Path) -> Result<Self> {
        if BUILD_IN_PROGRESS
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LibrarianError::ConcurrentBuildRejected.into());
        }

        match Self::lock_file(db_root) {
            Ok(lock) => Ok(lock),
            Err(e) => {
                BUILD_IN_PROGRESS.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Whether a build holds the lock in this process
    #[inline]
    pub fn is_held() -> bool {
        BUILD_IN_PROGRESS.load(Ordering::Acquire)
    }

    /// Report whether a build holds the lock on `db_root` without claiming it.
    ///
    /// Never creates the root or the lock file and leaves the in-process flag alone.
    #[inline]
    pub fn status(db_root: &Path) -> Result<LockStatus> {
        let path = db_root.join(LOCK_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockStatus::Free),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open lock file {}", path.display()));
            }
        };

        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                FileExt::unlock(&file)
                    .with_context(|| format!("Failed to release {}", path.display()))?;
                Ok(LockStatus::Free)
            }
            Err(e) if is_contended(&e) => {
                let holder = fs::read_to_string(&path)
                    .ok()
                    .map(|contents| contents.trim().to_string())
                    .filter(|line| !line.is_empty());
                Ok(LockStatus::Held { holder })
            }
            Err(e) => Err(e).with_context(|| format!("Failed to check {}", path.display())),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(db_root: &Path) -> Result<Self> {
        fs::create_dir_all(db_root)
            .with_context(|| format!("Failed to create directory: {}", db_root.display()))?;

        let path = db_root.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        let mut attempt = 1;
        while let Err(e) = file.try_lock_exclusive() {
            if !is_contended(&e) {
                return Err(e).with_context(|| format!("Failed to lock {}", path.display()));
            }
            if attempt == LOCK_ATTEMPTS {
                debug!("Build lock {} is held by another process", path.display());
                return Err(LibrarianError::ConcurrentBuildRejected.into());
            }
            attempt += 1;
            thread::sleep(LOCK_RETRY_DELAY);
        }

        // Informational only; the advisory lock is what excludes other builds
        file.set_len(0)?;
        writeln!(file, "{} {}", std::process::id(), chrono::Utc::now().to_rfc3339())?;

        debug!("Acquired build lock {}", path.display());
        Ok(Self { file, path })
    }
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock || error.kind() == fs2::lock_contended_error().kind()
}

impl Drop for BuildLock {
    #[inline]
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release build lock {}: {}", self.path.display(), e);
        }
        BUILD_IN_PROGRESS.store(false, Ordering::Release);
    }
}
