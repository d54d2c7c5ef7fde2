//! Append-only, line-delimited JSON audit log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const AUDIT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit log {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("audit entry encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    UpdatePublished,
    DeviceRegistered,
    DeviceDeactivated,
    DeviceReactivated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Format version for compatibility
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Version string or device uuid
    pub subject: String,
    /// Operator key name, when the action was authenticated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, subject: &str) -> Self {
        Self {
            version: AUDIT_VERSION,
            timestamp: Utc::now(),
            action,
            subject: subject.to_string(),
            actor: None,
            details: None,
        }
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub struct AuditLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl AuditLog {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        let log = Self {
            path: path.to_path_buf(),
            append_lock: Mutex::new(()),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| log.io_error(e))?;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One entry per line, written with a single `write_all`
    pub fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .map_err(|e| self.io_error(e))
    }

    /// Append, logging instead of failing. Audit trouble never fails a request.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.append(&entry) {
            tracing::warn!(
                action = ?entry.action,
                subject = %entry.subject,
                error = %e,
                "failed to write audit entry"
            );
        }
    }

    /// Every readable entry in append order. Lines that do not parse (a torn
    /// final write) and entries from newer formats are skipped.
    pub fn query_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) if entry.version <= AUDIT_VERSION => entries.push(entry),
                Ok(_) => {}
                Err(e) => tracing::warn!(line = index + 1, error = %e, "skipping unreadable audit line"),
            }
        }
        Ok(entries)
    }

    pub fn query_by_subject(&self, subject: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let mut entries = self.query_all()?;
        entries.retain(|e| e.subject == subject);
        Ok(entries)
    }

    fn io_error(&self, source: std::io::Error) -> AuditError {
        AuditError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
