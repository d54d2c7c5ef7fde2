//! Operation Lock System
//!
//! File locks that keep one server per data directory and one install per
//! device, across processes. A lock left behind by a dead process is stale
//! and gets reclaimed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Serve,
    Update,
}

impl LockType {
    pub fn filename(&self) -> &'static str {
        match self {
            LockType::Serve => "serve.lock",
            LockType::Update => "update.lock",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            LockType::Serve => "Update server running",
            LockType::Update => "Device update in progress",
        }
    }
}

/// Information stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_type: LockType,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub description: String,
}

impl LockInfo {
    pub fn new(lock_type: LockType) -> Self {
        Self {
            lock_type,
            pid: std::process::id(),
            started_at: Utc::now(),
            description: lock_type.description().to_string(),
        }
    }

    pub fn is_process_alive(&self) -> bool {
        self.pid == std::process::id() || pid_alive(self.pid)
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .is_ok_and(|status| status.success())
}

// No portable liveness check; never reclaim
#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("{lock_type:?} lock held by PID {pid}: {description}")]
    AlreadyLocked {
        lock_type: LockType,
        pid: u32,
        description: String,
    },
    #[error("Lock IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Lock serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Operation lock manager
pub struct OperationLock {
    locks_dir: PathBuf,
}

impl OperationLock {
    pub fn new(dir: &Path) -> Self {
        Self {
            locks_dir: dir.join("locks"),
        }
    }

    fn lock_path(&self, lock_type: LockType) -> PathBuf {
        self.locks_dir.join(lock_type.filename())
    }

    /// Acquire a lock, reclaiming it if its owner is gone
    pub fn acquire(&self, lock_type: LockType) -> Result<LockGuard, LockError> {
        fs::create_dir_all(&self.locks_dir)?;
        let lock_path = self.lock_path(lock_type);
        let info = LockInfo::new(lock_type);
        let content = serde_json::to_string_pretty(&info)?;

        // Second pass only runs after a stale lock was removed
        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    file.write_all(content.as_bytes())?;
                    return Ok(LockGuard {
                        lock_path,
                        lock_type,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match self.read_lock(&lock_path) {
                        Some(existing) if existing.is_process_alive() => {
                            return Err(LockError::AlreadyLocked {
                                lock_type,
                                pid: existing.pid,
                                description: existing.description,
                            });
                        }
                        stale => {
                            tracing::warn!(
                                lock = lock_type.filename(),
                                pid = stale.map(|s| s.pid),
                                "reclaiming stale lock"
                            );
                            let _ = fs::remove_file(&lock_path);
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let holder = self.read_lock(&lock_path);
        Err(LockError::AlreadyLocked {
            lock_type,
            pid: holder.as_ref().map(|h| h.pid).unwrap_or_default(),
            description: holder
                .map(|h| h.description)
                .unwrap_or_else(|| lock_type.description().to_string()),
        })
    }

    fn read_lock(&self, path: &Path) -> Option<LockInfo> {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    }

    /// The live holder of a lock, if any
    pub fn holder(&self, lock_type: LockType) -> Option<LockInfo> {
        self.read_lock(&self.lock_path(lock_type))
            .filter(LockInfo::is_process_alive)
    }
}

/// RAII guard that releases lock on drop
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    lock_type: LockType,
}

impl LockGuard {
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}
