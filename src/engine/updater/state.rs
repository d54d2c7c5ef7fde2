//! Agent State Machine
//!
//! Persisted lifecycle of the device update agent. Phases follow
//! `Idle -> CheckingForUpdate -> UpToDate | UpdateAvailable -> Downloading ->
//! Verifying -> Installing -> Restarting -> Idle`, with `Error` returning to
//! `Idle` once the backoff has elapsed.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::engine::version::Version;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum AgentPhase {
    #[default]
    Idle,
    CheckingForUpdate,
    UpToDate,
    UpdateAvailable {
        version: Version,
    },
    Downloading {
        version: Version,
        attempt: u32,
        bytes_downloaded: u64,
        total_bytes: u64,
    },
    Verifying {
        version: Version,
    },
    Installing {
        version: Version,
    },
    Restarting {
        version: Version,
    },
    Error {
        reason: String,
    },
}

impl AgentPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingForUpdate => "checking_for_update",
            Self::UpToDate => "up_to_date",
            Self::UpdateAvailable { .. } => "update_available",
            Self::Downloading { .. } => "downloading",
            Self::Verifying { .. } => "verifying",
            Self::Installing { .. } => "installing",
            Self::Restarting { .. } => "restarting",
            Self::Error { .. } => "error",
        }
    }
}

/// Complete agent state persisted to disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    #[serde(flatten)]
    pub phase: AgentPhase,
    /// Version last seen in the app's marker
    pub current_version: Version,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            phase: AgentPhase::Idle,
            current_version: Version::SENTINEL,
            last_check: None,
            last_error: None,
            consecutive_failures: 0,
            backoff_until: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse state: {0}")]
    Parse(#[from] serde_json::Error),
}

impl AgentState {
    /// Load state from disk, or create default if not exists
    pub fn load(state_path: &Path) -> Result<Self, StateError> {
        if state_path.exists() {
            let content = fs::read_to_string(state_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Like [`AgentState::load`], but an unreadable or corrupt file yields a
    /// fresh state. The installed version lives in the `VERSION` marker, so
    /// nothing is lost beyond backoff bookkeeping.
    pub fn load_or_default(state_path: &Path) -> Self {
        match Self::load(state_path) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    path = %state_path.display(),
                    error = %e,
                    "agent state unreadable, starting fresh"
                );
                Self::default()
            }
        }
    }

    /// Save state to disk atomically
    pub fn save(&self, state_path: &Path) -> Result<(), StateError> {
        let content = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = state_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = state_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
        fs::rename(&temp_path, state_path)?;
        Ok(())
    }

    pub fn start_checking(&mut self, now: DateTime<Utc>) {
        self.phase = AgentPhase::CheckingForUpdate;
        self.last_check = Some(now);
    }

    pub fn start_downloading(&mut self, version: Version, attempt: u32) {
        self.phase = AgentPhase::Downloading {
            version,
            attempt,
            bytes_downloaded: 0,
            total_bytes: 0,
        };
    }

    pub fn update_progress(&mut self, downloaded: u64, total: u64) {
        if let AgentPhase::Downloading {
            bytes_downloaded,
            total_bytes,
            ..
        } = &mut self.phase
        {
            *bytes_downloaded = downloaded;
            *total_bytes = total;
        }
    }

    /// A cycle finished cleanly; clears failure tracking
    pub fn mark_settled(&mut self, phase: AgentPhase) {
        self.phase = phase;
        self.last_error = None;
        self.consecutive_failures = 0;
        self.backoff_until = None;
    }

    /// Record a failed cycle and schedule the next attempt with exponential backoff
    pub fn mark_failed(
        &mut self,
        reason: String,
        now: DateTime<Utc>,
        base: TimeDelta,
        max: TimeDelta,
    ) -> DateTime<Utc> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let exponent = (self.consecutive_failures - 1).min(20);
        let delay = base
            .checked_mul(1i32 << exponent)
            .map_or(max, |d| d.min(max));
        let until = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.phase = AgentPhase::Error {
            reason: reason.clone(),
        };
        self.last_error = Some(reason);
        self.backoff_until = Some(until);
        until
    }

    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }
}
