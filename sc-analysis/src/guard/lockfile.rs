use crate::error::AnalysisError;
use crate::params::LockConfig;
use anyhow::{bail, Context, Error};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use snoop::Progress;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    token: String,
    acquired_at: u64,
}

/// Advisory cross-process lock held as long as the value lives. Acquisition never waits:
/// a held lock fails with `AnalysisError::LockHeld`. A lock file whose modification time
/// is older than `stale_after` is assumed abandoned and taken over.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    token: String,
    refresh_every: Duration,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn is_stale(path: &Path, config: &LockConfig) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map_or(false, |age| age >= config.stale_after)
}

impl LockFile {
    pub fn acquire(path: impl Into<PathBuf>, config: &LockConfig) -> Result<LockFile, Error> {
        let path = path.into();
        let token = format!(
            "{}-{}-{}",
            std::process::id(),
            SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos()),
            NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
        );
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    let record = LockRecord {
                        pid: std::process::id(),
                        token: token.clone(),
                        acquired_at: now_secs(),
                    };
                    serde_json::to_writer(&mut f, &record)?;
                    f.flush()?;
                    info!("acquired lock {}", path.display());
                    return Ok(LockFile {
                        path,
                        token,
                        refresh_every: config.stale_after / 2,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 && is_stale(&path, config) {
                        warn!("breaking stale lock {}", path.display());
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e).with_context(|| path.display().to_string()),
                        }
                    }
                    bail!(AnalysisError::LockHeld {
                        path: path.display().to_string(),
                    });
                }
                Err(e) => return Err(e).with_context(|| format!("creating lock {}", path.display())),
            }
        }
        bail!(AnalysisError::LockHeld {
            path: path.display().to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the lock record so it is not taken for abandoned.
    pub fn refresh(&self) -> Result<(), Error> {
        if !self.owned() {
            bail!(AnalysisError::LockHeld {
                path: self.path.display().to_string(),
            });
        }
        let record = LockRecord {
            pid: std::process::id(),
            token: self.token.clone(),
            acquired_at: now_secs(),
        };
        fs::write(&self.path, serde_json::to_vec(&record)?).with_context(|| self.path.display().to_string())?;
        Ok(())
    }

    fn owned(&self) -> bool {
        fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok())
            .map_or(false, |r| r.token == self.token)
    }

    /// Progress sink for the computation run under this lock. Refreshes the lock at most
    /// every half `stale_after`, so a long computation keeps it.
    pub fn heartbeat(&self) -> LockHeartbeat<'_> {
        LockHeartbeat {
            lock: self,
            last: Instant::now(),
        }
    }

    pub fn release(self) {}
}

#[derive(Clone, Debug)]
pub struct LockHeartbeat<'a> {
    lock: &'a LockFile,
    last: Instant,
}

impl Progress for LockHeartbeat<'_> {
    fn set_progress(&mut self, _fraction: f64) {
        if self.last.elapsed() < self.lock.refresh_every {
            return;
        }
        if let Err(e) = self.lock.refresh() {
            warn!("could not refresh lock {}: {:#}", self.lock.path.display(), e);
        }
        self.last = Instant::now();
    }

    fn get_subsnoop(&mut self, _fraction: f64) -> Self {
        self.clone()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // another process may have broken a stale lock and taken it over
        if !self.owned() {
            warn!("lock {} no longer ours, leaving it", self.path.display());
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => info!("released lock {}", self.path.display()),
            Err(e) => warn!("could not release lock {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster_writing_diffexp");
        let config = LockConfig::default();
        let lock = LockFile::acquire(&path, &config).unwrap();
        let err = LockFile::acquire(&path, &config).unwrap_err();
        assert!(matches!(crate::error::kind(&err), Some(AnalysisError::LockHeld { .. })));
        lock.refresh().unwrap();
        drop(lock);
        assert!(!path.exists());
        LockFile::acquire(&path, &config).unwrap().release();
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sel_writing_diffexp");
        fs::write(&path, "{}").unwrap();
        let fresh = LockConfig {
            stale_after: Duration::from_secs(3600),
        };
        assert!(LockFile::acquire(&path, &fresh).is_err());
        let stale = LockConfig {
            stale_after: Duration::ZERO,
        };
        let lock = LockFile::acquire(&path, &stale).unwrap();
        assert!(lock.owned());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_taken_over_lock_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t_writing_diffexp");
        let stale = LockConfig {
            stale_after: Duration::ZERO,
        };
        let first = LockFile::acquire(&path, &stale).unwrap();
        let second = LockFile::acquire(&path, &stale).unwrap();
        assert!(first.refresh().is_err());
        drop(first);
        assert!(path.exists());
        drop(second);
        assert!(!path.exists());
    }

    #[test]
    fn test_heartbeat_keeps_long_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow_writing_diffexp");
        let config = LockConfig {
            stale_after: Duration::from_millis(400),
        };
        let lock = LockFile::acquire(&path, &config).unwrap();
        let mut beat = lock.heartbeat();
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(1000) {
            std::thread::sleep(Duration::from_millis(10));
            beat.set_progress(0.5);
        }
        // held well past stale_after, but refreshed all along
        let err = LockFile::acquire(&path, &config).unwrap_err();
        assert!(matches!(crate::error::kind(&err), Some(AnalysisError::LockHeld { .. })));
        assert!(lock.owned());

        // without refreshes the same wait gives the lock away
        std::thread::sleep(Duration::from_millis(500));
        let taker = LockFile::acquire(&path, &config).unwrap();
        assert!(!lock.owned());
        drop(lock);
        drop(taker);
        assert!(!path.exists());
    }
}
