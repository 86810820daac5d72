//! Crash-safe file primitives for the registry.
//!
//! `AtomicFileWriter` replaces files via a temp file in the same directory
//! followed by a rename, so readers only ever see the old or the new content.
//! `FileLock` is an advisory, cross-process exclusive lock on a sentinel file.

use crate::error::{RegistryError, RegistryResult};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Writes whole files atomically (temp file + rename)
pub struct AtomicFileWriter;

impl AtomicFileWriter {
    /// Start an atomic write to `target`.
    ///
    /// Nothing is visible at `target` until [`PendingWrite::commit`]; dropping
    /// the pending write discards the temp file.
    pub fn begin(target: impl AsRef<Path>) -> RegistryResult<PendingWrite> {
        let target = target.as_ref().to_path_buf();
        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        fs::create_dir_all(&parent).map_err(|e| RegistryError::io(&parent, e))?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registry".to_string());

        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| RegistryError::io(&parent, e))?;

        Ok(PendingWrite { target, temp })
    }

    /// Atomically replace `target` with `bytes`
    pub fn write(target: impl AsRef<Path>, bytes: &[u8]) -> RegistryResult<()> {
        let mut pending = Self::begin(target)?;
        pending.write_all(bytes)?;
        pending.commit()
    }

    /// Atomically replace `target` with pretty-printed JSON
    pub fn write_json<T: Serialize + ?Sized>(
        target: impl AsRef<Path>,
        value: &T,
    ) -> RegistryResult<()> {
        let target = target.as_ref();
        let content =
            serde_json::to_vec_pretty(value).map_err(|e| RegistryError::json(target, e))?;
        Self::write(target, &content)
    }
}

/// An in-progress atomic write
pub struct PendingWrite {
    target: PathBuf,
    temp: NamedTempFile,
}

impl PendingWrite {
    pub fn write_all(&mut self, bytes: &[u8]) -> RegistryResult<()> {
        self.temp
            .write_all(bytes)
            .map_err(|e| RegistryError::io(self.temp.path(), e))
    }

    /// Flush to disk and rename over the target
    pub fn commit(mut self) -> RegistryResult<()> {
        self.temp
            .flush()
            .and_then(|_| self.temp.as_file().sync_all())
            .map_err(|e| RegistryError::io(self.temp.path(), e))?;

        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| RegistryError::io(&target, e.error))?;

        debug!(path = %target.display(), "Wrote file atomically");
        Ok(())
    }
}

/// Advisory exclusive lock backed by a lock file
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    stale_after: Duration,
}

impl FileLock {
    /// Create a lock handle; nothing is touched until [`FileLock::acquire`]
    pub fn new(path: impl AsRef<Path>, timeout: Duration, stale_after: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout,
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held or the timeout expires.
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn acquire(&self) -> RegistryResult<FileLockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| RegistryError::io(&self.path, e))?;

        let start = Instant::now();
        let mut warned_stale = false;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if start.elapsed() >= self.timeout {
                        return Err(RegistryError::LockTimeout {
                            path: self.path.clone(),
                            waited_secs: start.elapsed().as_secs(),
                        });
                    }

                    if !warned_stale {
                        if let Some(held_for) = self.holder_age(&mut file) {
                            if held_for > self.stale_after {
                                warn!(
                                    path = %self.path.display(),
                                    held_secs = held_for.as_secs(),
                                    "Registry lock has been held for an unusually long time"
                                );
                                warned_stale = true;
                            }
                        }
                    }

                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(RegistryError::io(&self.path, e)),
            }
        }

        // Record the holder for diagnostics
        let stamp = format!("{}\n{}", std::process::id(), unix_now_secs());
        let recorded = file
            .set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(stamp.as_bytes()));
        if let Err(e) = recorded {
            debug!(path = %self.path.display(), error = %e, "Failed to record lock holder");
        }

        debug!(path = %self.path.display(), pid = std::process::id(), "Lock acquired");
        Ok(FileLockGuard {
            file,
            path: self.path.clone(),
        })
    }

    /// How long the current holder has held the lock, from its stamp
    fn holder_age(&self, file: &mut File) -> Option<Duration> {
        let mut content = String::new();
        file.seek(SeekFrom::Start(0)).ok()?;
        file.read_to_string(&mut content).ok()?;
        let locked_at: u64 = content.lines().nth(1)?.trim().parse().ok()?;
        Some(Duration::from_secs(unix_now_secs().saturating_sub(locked_at)))
    }
}

/// Modification time of `path`, or `None` when it cannot be read
pub fn file_mtime(path: impl AsRef<Path>) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Held registry lock; released on drop
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        } else {
            debug!(path = %self.path.display(), "Lock released");
        }
    }
}
