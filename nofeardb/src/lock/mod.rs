//! Advisory per-document locks.
//!
//! A lock is a two-line marker file `<id>.lock` next to the document it guards: the owner's
//! random token, then the UTC time the lease was last renewed. A lock whose timestamp is older
//! than the expiration window is stale and may be taken over by anyone. While a lock is held,
//! a background heartbeat thread rewrites the timestamp so long writes do not go stale.

use crate::config::clamp_interval;
use crate::error::{NoFearDbError, Result};
use chrono::{NaiveDateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

const WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parsed contents of a lock file.
#[derive(Debug, Clone, PartialEq)]
pub struct LockInfo {
    pub path: PathBuf,
    pub token: String,
    /// Last renewal time. `None` when the timestamp line is missing or malformed.
    pub created: Option<NaiveDateTime>,
}

impl LockInfo {
    /// Read a lock file. Returns `Ok(None)` when it does not exist. Undecodable content reads
    /// as a malformed, and therefore stale, lock.
    pub fn read(path: &Path) -> Result<Option<LockInfo>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(LockInfo::parse(path, &String::from_utf8_lossy(&bytes)))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(path: &Path, content: &str) -> LockInfo {
        let mut lines = content.lines();
        let token = lines.next().unwrap_or_default().trim().to_string();
        let created = lines
            .next()
            .and_then(|line| NaiveDateTime::parse_from_str(line.trim(), PARSE_FORMAT).ok());
        LockInfo {
            path: path.to_path_buf(),
            token,
            created,
        }
    }

    /// Time since the last renewal. A timestamp in the future counts as zero.
    pub fn age(&self) -> Option<Duration> {
        let created = self.created?;
        let elapsed = Utc::now().naive_utc() - created;
        Some(elapsed.to_std().unwrap_or(Duration::ZERO))
    }

    /// A lock without a readable timestamp is always expired.
    pub fn is_expired(&self, expiration: Duration) -> bool {
        match self.age() {
            Some(age) => age >= expiration,
            None => true,
        }
    }

    fn is_owned_by(&self, token: Uuid) -> bool {
        self.token == token.to_string()
    }
}

fn lock_content(token: Uuid) -> String {
    format!("{}\n{}", token, Utc::now().naive_utc().format(WRITE_FORMAT))
}

struct Heartbeat {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Lease over a single document.
pub struct DocumentLock {
    path: PathBuf,
    token: Uuid,
    expiration: Duration,
    heartbeat_interval: Duration,
    heartbeat: Option<Heartbeat>,
}

impl DocumentLock {
    /// Lock for the document `id` stored in `dir`. Nothing touches the disk until [`lock`].
    ///
    /// [`lock`]: DocumentLock::lock
    pub fn new(dir: &Path, id: Uuid, expiration: Duration) -> Self {
        DocumentLock {
            path: dir.join(format!("{id}.lock")),
            token: Uuid::new_v4(),
            expiration,
            heartbeat_interval: expiration / 2,
            heartbeat: None,
        }
    }

    /// Override the renewal interval. Values not below the expiration fall back to half of it.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = clamp_interval(interval, self.expiration);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Whether a live lock file exists, regardless of who owns it.
    pub fn is_locked(&self) -> bool {
        match LockInfo::read(&self.path) {
            Ok(Some(info)) => !info.is_expired(self.expiration),
            Ok(None) => false,
            Err(e) => {
                log::warn!("Failed to read lock {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Acquire the lock and start renewing it.
    pub fn lock(&mut self) -> Result<()> {
        if let Some(info) = LockInfo::read(&self.path)? {
            if !info.is_expired(self.expiration) {
                if info.is_owned_by(self.token) && self.heartbeat.is_some() {
                    return Ok(());
                }
                return Err(self.conflict());
            }
            log::debug!("Removing stale lock {}", self.path.display());
            remove_if_exists(&self.path)?;
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(self.conflict()),
            Err(e) => return Err(e.into()),
        };
        file.write_all(lock_content(self.token).as_bytes())?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = self.start_heartbeat() {
            remove_if_exists(&self.path)?;
            return Err(e);
        }
        log::debug!("Acquired lock {}", self.path.display());
        Ok(())
    }

    /// Give the lock up. Removing someone else's live lock is a conflict and leaves the file.
    pub fn release(&mut self) -> Result<()> {
        self.stop_heartbeat();

        let Some(info) = LockInfo::read(&self.path)? else {
            return Ok(());
        };
        if !info.is_owned_by(self.token) && !info.is_expired(self.expiration) {
            return Err(self.conflict());
        }
        remove_if_exists(&self.path)?;
        log::debug!("Released lock {}", self.path.display());
        Ok(())
    }

    fn conflict(&self) -> NoFearDbError {
        NoFearDbError::LockConflict {
            path: self.path.display().to_string(),
        }
    }

    fn start_heartbeat(&mut self) -> Result<()> {
        self.stop_heartbeat();

        let (stop, stop_rx) = mpsc::channel::<()>();
        let path = self.path.clone();
        let token = self.token;
        let interval = self.heartbeat_interval;

        let thread = std::thread::Builder::new()
            .name("nofeardb-heartbeat".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match renew(&path, token) {
                        Ok(true) => log::debug!("Renewed lock {}", path.display()),
                        Ok(false) => {
                            log::warn!("Lock {} is no longer ours; heartbeat stopped", path.display());
                            break;
                        }
                        Err(e) => log::warn!("Failed to renew lock {}: {}", path.display(), e),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        self.heartbeat = Some(Heartbeat { stop, thread });
        Ok(())
    }

    /// Signal the renewal thread and wait for it, so no renewal lands after this returns.
    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.stop.send(());
            if heartbeat.thread.join().is_err() {
                log::warn!("Heartbeat thread for {} panicked", self.path.display());
            }
        }
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

impl std::fmt::Debug for DocumentLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentLock")
            .field("path", &self.path)
            .field("token", &self.token)
            .field("expiration", &self.expiration)
            .field("heartbeat", &self.heartbeat.is_some())
            .finish()
    }
}

/// Rewrite the timestamp of a lock we still own. Returns false once ownership is lost.
fn renew(path: &Path, token: Uuid) -> Result<bool> {
    match LockInfo::read(path)? {
        Some(info) if info.is_owned_by(token) => {}
        _ => return Ok(false),
    }
    let tmp = path.with_extension("lock.tmp");
    fs::write(&tmp, lock_content(token))?;
    fs::rename(&tmp, path)?;
    Ok(true)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
