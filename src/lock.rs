//! Run-scoped exclusivity lock
//!
//! A small JSON file created with exclusive-create semantics. Only one
//! collector may hold it at a time; a lock older than the configured
//! maximum age is presumed abandoned by a crashed holder and reclaimed.
//!
//! ```text
//! acquire ──create_new──► held ──release / drop──► removed
//!    │
//!    └─ exists ─► age ≤ max_age ─► LockError::Held
//!               └ age > max_age ─► rename aside ─► same content ─► delete, retry once
//!                                              └─ changed ──────► put back, LockError::Held
//! ```
//!
//! The stale file is moved aside with a rename before it is deleted, so two
//! collectors reclaiming the same stale lock cannot both end up holding it:
//! whoever renames second either finds nothing or finds the winner's fresh
//! record and restores it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LockError;

/// Content of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,

    /// Acquisition time in unix seconds
    pub timestamp: i64,

    /// Acquisition time, RFC 3339
    pub started_at: String,
}

impl LockRecord {
    fn current() -> Self {
        let now = Utc::now();
        Self {
            pid: std::process::id(),
            timestamp: now.timestamp(),
            started_at: now.to_rfc3339(),
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        Duration::from_secs(now.timestamp().saturating_sub(self.timestamp).max(0) as u64)
    }
}

/// File-based advisory lock with age-based staleness
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    max_age: Duration,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock, reclaiming it if the current holder is stale
    pub fn acquire(&self) -> Result<RunLockGuard, LockError> {
        match self.try_create() {
            Ok(guard) => return Ok(guard),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(self.io_error(e)),
        }

        let stale = match Snapshot::read(&self.path) {
            Ok(snapshot) => Some(snapshot),
            // released in the meantime
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(self.io_error(e)),
        };

        if let Some(snapshot) = &stale {
            if snapshot.age <= self.max_age {
                debug!("lock held by pid {} for {:?}", snapshot.holder.pid, snapshot.age);
                return Err(snapshot.held());
            }

            warn!(
                "reclaiming stale lock of pid {} (age {:?} > {:?})",
                snapshot.holder.pid, snapshot.age, self.max_age
            );
            self.set_aside(snapshot)?;
        }

        match self.try_create() {
            Ok(mut guard) => {
                guard.reclaimed = stale.map(|snapshot| snapshot.holder);
                Ok(guard)
            }
            // somebody else got there between our check and create
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(self.current_holder()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Move the stale lock out of the way and delete it
    ///
    /// The rename is atomic, so only one contender takes a given file. If the
    /// file it took is no longer the stale one, another collector already
    /// reclaimed the lock; the file is put back and the lock reported held.
    fn set_aside(&self, stale: &Snapshot) -> Result<(), LockError> {
        let aside = self.aside_path();

        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.io_error(e)),
        }

        let moved = Snapshot::read(&aside);
        if moved.as_ref().is_ok_and(|moved| moved.content == stale.content) {
            fs::remove_file(&aside).map_err(|e| self.io_error(e))?;
            return Ok(());
        }

        let restored = fs::hard_link(&aside, &self.path);
        if let Err(e) = fs::remove_file(&aside) {
            warn!("failed to remove {}: {e}", aside.display());
        }
        match restored {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(self.io_error(e)),
        }

        let moved = moved.map_err(|e| self.io_error(e))?;
        debug!("lock was reclaimed by pid {} first", moved.holder.pid);
        Err(moved.held())
    }

    /// Unique sibling path for a lock file being set aside
    fn aside_path(&self) -> PathBuf {
        static ASIDE_COUNTER: AtomicU64 = AtomicU64::new(0);

        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let n = ASIDE_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_file_name(format!(".{name}.{}.{n}.stale", std::process::id()))
    }

    fn current_holder(&self) -> LockError {
        match Snapshot::read(&self.path) {
            Ok(snapshot) => snapshot.held(),
            Err(e) if e.kind() == ErrorKind::NotFound => LockError::Held {
                pid: 0,
                age: Duration::ZERO,
            },
            Err(e) => self.io_error(e),
        }
    }

    fn try_create(&self) -> std::io::Result<RunLockGuard> {
        let record = LockRecord::current();
        let content = serde_json::to_vec(&record)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;

        if let Err(e) = file.write_all(&content).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }

        debug!("acquired lock {}", self.path.display());

        Ok(RunLockGuard {
            path: self.path.clone(),
            record,
            reclaimed: None,
            released: false,
        })
    }

    fn io_error(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// An existing lock file as read from disk
#[derive(Debug)]
struct Snapshot {
    holder: LockRecord,
    age: Duration,
    content: Vec<u8>,
}

impl Snapshot {
    /// Read a lock file; an unreadable record is aged by its modification time
    fn read(path: &Path) -> std::io::Result<Self> {
        let content = fs::read(path)?;

        if let Ok(holder) = serde_json::from_slice::<LockRecord>(&content) {
            let age = holder.age(Utc::now());
            return Ok(Self {
                holder,
                age,
                content,
            });
        }

        let modified = fs::metadata(path)?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();

        Ok(Self {
            holder: unknown_holder(),
            age,
            content,
        })
    }

    fn held(&self) -> LockError {
        LockError::Held {
            pid: self.holder.pid,
            age: self.age,
        }
    }
}

fn unknown_holder() -> LockRecord {
    LockRecord {
        pid: 0,
        timestamp: 0,
        started_at: String::new(),
    }
}

/// Proof of holding the lock; releases it when dropped
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    record: LockRecord,
    reclaimed: Option<LockRecord>,
    released: bool,
}

impl RunLockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// The stale holder this lock was taken over from, if any
    pub fn reclaimed(&self) -> Option<&LockRecord> {
        self.reclaimed.as_ref()
    }

    /// Release the lock explicitly, reporting failures
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.remove_if_owned().map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Remove the lock file unless another process has taken it over
    fn remove_if_owned(&self) -> std::io::Result<()> {
        let owned = match fs::read(&self.path) {
            Ok(content) => serde_json::from_slice::<LockRecord>(&content)
                .is_ok_and(|record| record == self.record),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        if !owned {
            warn!(
                "lock {} was taken over by another process, leaving it in place",
                self.path.display()
            );
            return Ok(());
        }

        fs::remove_file(&self.path)?;
        debug!("released lock {}", self.path.display());
        Ok(())
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove_if_owned() {
            warn!("failed to release lock {}: {e}", self.path.display());
        }
    }
}
