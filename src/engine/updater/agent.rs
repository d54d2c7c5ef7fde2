//! Device Update Agent
//!
//! One control loop per device. A cycle checks the server for a newer
//! version, applies the update's timing policy, downloads and verifies the
//! package, installs it and asks the supervisor to restart the app. Failures
//! end the current cycle only and push the next attempt out with exponential
//! backoff.

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::activity::IdleTracker;
use super::client::{HttpUpdateSource, SourceError, UpdateSource};
use super::download::{CancelToken, DownloadError};
use super::identity::{DeviceIdentity, IdentityError};
use super::install::{CommandPackageManager, InstallError, Installer, PackageManager};
use super::manifest::{ManifestError, ProtectedManifest};
use super::policy::{Decision, DeferReason, TimingPolicy};
use super::restart::{CommandRestarter, MarkerRestarter, Restarter};
use super::state::{AgentPhase, AgentState, StateError};
use super::verify::verify_package;
use super::version_manager::{VersionError, VersionManager};
use crate::engine::config::Config;
use crate::engine::error::ErrorKind;
use crate::engine::locks::{LockError, LockType, OperationLock};
use crate::engine::models::{Device, DeviceStatus, HeartbeatRequest, RegisterRequest, UpdateRecord};
use crate::engine::version::Version;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Transfer failed after {attempts} attempt(s): {last}")]
    Transfer { attempts: u32, last: String },
    #[error("Install failed: {0}")]
    Install(#[from] InstallError),
    #[error("Package rejected: {0}")]
    Package(#[from] VersionError),
    #[error("Agent state error: {0}")]
    State(#[from] StateError),
    #[error("Another update is in progress: {0}")]
    Lock(#[from] LockError),
    #[error("Protected-path manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("Device identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Invalid agent configuration: {0}")]
    Config(String),
    #[error("Update cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Source(SourceError::Forbidden) => ErrorKind::Authorization,
            Self::Source(_) | Self::Transfer { .. } | Self::Cancelled => ErrorKind::Transfer,
            Self::Install(_) | Self::Package(_) => ErrorKind::Install,
            Self::Config(_) => ErrorKind::Validation,
            Self::State(_) | Self::Lock(_) | Self::Manifest(_) | Self::Identity(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Inputs a cycle is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct CycleContext {
    pub now: DateTime<Utc>,
    pub idle_for: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckResult {
    UpToDate { local: Version },
    UpdateAvailable { local: Version, update: UpdateRecord },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    UpToDate { version: Version },
    Deferred { version: Version, reason: DeferReason },
    Installed { from: Version, to: Version },
    BackingOff { until: DateTime<Utc> },
    Cancelled,
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub uuid: String,
    pub display_name: String,
    pub timezone: String,
    pub timing: TimingPolicy,
    pub transfer_attempts: u32,
    pub backoff_base: TimeDelta,
    pub backoff_max: TimeDelta,
    pub poll_interval: Duration,
}

pub struct UpdateAgent {
    settings: AgentSettings,
    source: Arc<dyn UpdateSource>,
    layout: VersionManager,
    installer: Installer,
    packages: Box<dyn PackageManager>,
    restarter: Box<dyn Restarter>,
    locks: OperationLock,
    cancel: CancelToken,
    state: AgentState,
}

impl UpdateAgent {
    pub fn new(
        settings: AgentSettings,
        source: Arc<dyn UpdateSource>,
        layout: VersionManager,
        installer: Installer,
        packages: Box<dyn PackageManager>,
        restarter: Box<dyn Restarter>,
    ) -> Result<Self, AgentError> {
        layout.init()?;
        // Whatever an interrupted cycle left behind is never resumed
        layout.cleanup_temp()?;
        let state = AgentState::load_or_default(&layout.state_path());
        let locks = OperationLock::new(layout.state_dir());
        Ok(Self {
            settings,
            source,
            layout,
            installer,
            packages,
            restarter,
            locks,
            cancel: CancelToken::new(),
            state,
        })
    }

    /// Build an agent talking HTTP to the configured server
    pub fn from_config(config: &Config) -> Result<Self, AgentError> {
        let agent = config
            .agent()
            .map_err(|e| AgentError::Config(e.to_string()))?;
        let app_dir = config.resolve(&agent.app_dir);
        let state_dir = config.resolve(&agent.state_dir);

        let identity = DeviceIdentity::resolve(agent.device_uuid.as_deref(), &state_dir)?;
        let timezone: Tz = agent
            .timezone
            .parse()
            .map_err(|_| AgentError::Config(format!("unknown timezone {}", agent.timezone)))?;

        let mut manifest = match &agent.protected_manifest {
            Some(path) => ProtectedManifest::load(&config.resolve(path))?,
            None => ProtectedManifest::default(),
        };
        if let Some(relative) = relative_inside(&state_dir, &app_dir) {
            manifest = manifest.with_path(&relative)?;
        }

        let restarter: Box<dyn Restarter> = match &agent.restart_command {
            Some(command) if !command.is_empty() => {
                Box::new(CommandRestarter::new(command.clone()))
            }
            _ => Box::new(MarkerRestarter::new(&state_dir.join("restart.requested"))),
        };

        let settings = AgentSettings {
            uuid: identity.uuid,
            display_name: agent.display_name.clone(),
            timezone: agent.timezone.clone(),
            timing: TimingPolicy {
                timezone,
                window: agent.maintenance_window.into(),
                urgent_idle: Duration::from_secs(agent.urgent_idle_minutes * 60),
            },
            transfer_attempts: agent.transfer_attempts.max(1),
            backoff_base: secs(agent.backoff_base_secs),
            backoff_max: secs(agent.backoff_max_secs),
            poll_interval: Duration::from_secs(agent.poll_interval_secs.max(1)),
        };

        Self::new(
            settings,
            Arc::new(HttpUpdateSource::new(&agent.server_url)?),
            VersionManager::new(&app_dir, &state_dir),
            Installer::new(&app_dir, manifest),
            Box::new(CommandPackageManager::new(
                agent.package_install_command.clone(),
            )),
            restarter,
        )
    }

    pub fn uuid(&self) -> &str {
        &self.settings.uuid
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn layout(&self) -> &VersionManager {
        &self.layout
    }

    /// Handle for cancelling an in-flight download from another task
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Register with the server. Safe to repeat.
    ///
    /// Registration is first-write-wins, so the stored record may carry a
    /// different timezone than the local config. The maintenance window is
    /// evaluated in the registered one.
    pub async fn register(&mut self) -> Result<Device, AgentError> {
        let request = RegisterRequest {
            uuid: self.settings.uuid.clone(),
            display_name: self.settings.display_name.clone(),
            timezone: self.settings.timezone.clone(),
            metadata: self.report_metadata(),
        };
        let device = self.source.register(&request).await?;
        tracing::info!(uuid = %device.uuid, name = %device.display_name, "device registered");
        self.adopt_timezone(&device.timezone);
        Ok(device)
    }

    pub fn timezone(&self) -> Tz {
        self.settings.timing.timezone
    }

    fn adopt_timezone(&mut self, registered: &str) {
        if registered == self.settings.timezone {
            return;
        }
        match registered.parse::<Tz>() {
            Ok(tz) => {
                tracing::warn!(
                    uuid = %self.settings.uuid,
                    configured = %self.settings.timezone,
                    registered,
                    "configured timezone differs from the registered one, using registered"
                );
                self.settings.timezone = registered.to_string();
                self.settings.timing.timezone = tz;
            }
            Err(_) => {
                tracing::warn!(
                    uuid = %self.settings.uuid,
                    registered,
                    "registered timezone is not a known zone, keeping configured"
                );
            }
        }
    }

    /// Compare the installed version with the latest published one
    pub async fn check(&self) -> Result<CheckResult, AgentError> {
        let local = self.layout.local_version()?;
        match self.source.latest(&self.settings.uuid).await? {
            Some(update) if update.version.is_newer_than(&local) => {
                Ok(CheckResult::UpdateAvailable { local, update })
            }
            _ => Ok(CheckResult::UpToDate { local }),
        }
    }

    /// Check immediately before a unit of device work, then count the work as activity
    pub async fn before_work(&mut self, activity: &IdleTracker) -> CycleOutcome {
        let now = Utc::now();
        let outcome = self
            .run_cycle(CycleContext {
                now,
                idle_for: activity.idle_for(now),
            })
            .await;
        activity.mark_active(Utc::now());
        outcome
    }

    /// Poll on the idle timer until `shutdown` resolves.
    ///
    /// Shutdown during a cycle cancels it: a check or download in flight is
    /// abandoned, while an install that already started runs to completion.
    pub async fn run<F>(&mut self, activity: &IdleTracker, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            registered = self.register() => {
                if let Err(e) = registered {
                    tracing::warn!(uuid = %self.settings.uuid, error = %e, "registration failed, will retry via heartbeat");
                }
            }
            _ = &mut shutdown => {
                tracing::info!(uuid = %self.settings.uuid, "agent stopped before registering");
                return;
            }
        }

        let cancel = self.cancel.clone();
        loop {
            let now = Utc::now();
            let (outcome, stopping) = {
                let cycle = self.run_cycle(CycleContext {
                    now,
                    idle_for: activity.idle_for(now),
                });
                tokio::pin!(cycle);
                tokio::select! {
                    outcome = &mut cycle => (outcome, false),
                    _ = &mut shutdown => {
                        cancel.cancel();
                        (cycle.await, true)
                    }
                }
            };
            tracing::debug!(uuid = %self.settings.uuid, outcome = ?outcome, "cycle finished");
            if stopping {
                break;
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        tracing::info!(uuid = %self.settings.uuid, "agent stopped");
    }

    /// Run one update cycle. Never fails; failures become `CycleOutcome::Failed`.
    pub async fn run_cycle(&mut self, ctx: CycleContext) -> CycleOutcome {
        if self.state.in_backoff(ctx.now) {
            if let Some(until) = self.state.backoff_until {
                return CycleOutcome::BackingOff { until };
            }
        }

        let outcome = match self.try_cycle(&ctx).await {
            Ok(outcome) => outcome,
            Err(AgentError::Cancelled) => {
                tracing::info!(uuid = %self.settings.uuid, "update cancelled");
                self.cancel.reset();
                self.state.phase = AgentPhase::Idle;
                CycleOutcome::Cancelled
            }
            Err(e) => {
                let kind = e.kind();
                let until = self.state.mark_failed(
                    e.to_string(),
                    ctx.now,
                    self.settings.backoff_base,
                    self.settings.backoff_max,
                );
                tracing::error!(
                    uuid = %self.settings.uuid,
                    version = %self.state.current_version,
                    kind = ?kind,
                    retry_at = %until,
                    error = %e,
                    "update cycle failed"
                );
                CycleOutcome::Failed {
                    kind,
                    message: e.to_string(),
                }
            }
        };

        if let Err(e) = self.state.save(&self.layout.state_path()) {
            tracing::warn!(uuid = %self.settings.uuid, error = %e, "failed to persist agent state");
        }

        let refused = matches!(
            outcome,
            CycleOutcome::Failed {
                kind: ErrorKind::Authorization,
                ..
            }
        );
        if !refused {
            if let Err(e) = self.heartbeat(DeviceStatus::Online).await {
                tracing::warn!(uuid = %self.settings.uuid, error = %e, "heartbeat failed");
            }
        }
        outcome
    }

    async fn try_cycle(&mut self, ctx: &CycleContext) -> Result<CycleOutcome, AgentError> {
        self.state.start_checking(ctx.now);
        self.save_state()?;

        let checked = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            checked = self.check() => checked?,
        };
        let (local, update) = match checked {
            CheckResult::UpToDate { local } => {
                self.state.current_version = local;
                self.state.mark_settled(AgentPhase::UpToDate);
                tracing::debug!(uuid = %self.settings.uuid, version = %local, "up to date");
                return Ok(CycleOutcome::UpToDate { version: local });
            }
            CheckResult::UpdateAvailable { local, update } => (local, update),
        };
        let version = update.version;
        self.state.current_version = local;
        self.state.phase = AgentPhase::UpdateAvailable { version };
        self.save_state()?;
        tracing::info!(
            uuid = %self.settings.uuid,
            version = %version,
            local = %local,
            policy = %update.policy,
            "update available"
        );

        if let Decision::Defer(reason) =
            self.settings
                .timing
                .evaluate(update.policy, ctx.now, ctx.idle_for)
        {
            tracing::info!(uuid = %self.settings.uuid, version = %version, reason = %reason, "install deferred");
            self.state.mark_settled(AgentPhase::UpdateAvailable { version });
            return Ok(CycleOutcome::Deferred { version, reason });
        }

        let _lock = self.locks.acquire(LockType::Update)?;

        let package = self.fetch_verified(&update).await?;
        if self.cancel.is_cancelled() {
            self.layout.remove_package(&version);
            return Err(AgentError::Cancelled);
        }

        // From here on the cancel flag is ignored
        self.state.phase = AgentPhase::Installing { version };
        self.save_state()?;
        match self.heartbeat(DeviceStatus::Updating).await {
            Err(SourceError::Forbidden) => {
                self.layout.remove_package(&version);
                return Err(SourceError::Forbidden.into());
            }
            Err(e) => {
                tracing::warn!(uuid = %self.settings.uuid, error = %e, "updating heartbeat failed");
            }
            Ok(()) => {}
        }

        let installed = self.install(&package, &update);
        if let Err(e) = self.layout.cleanup_temp() {
            tracing::warn!(uuid = %self.settings.uuid, error = %e, "failed to clean up staging");
        }
        installed?;

        self.state.phase = AgentPhase::Restarting { version };
        self.save_state()?;
        self.restarter.request_restart(&version)?;

        self.state.current_version = version;
        self.state.mark_settled(AgentPhase::Idle);
        tracing::info!(uuid = %self.settings.uuid, from = %local, to = %version, "update installed");
        Ok(CycleOutcome::Installed {
            from: local,
            to: version,
        })
    }

    /// Download and checksum the package, retrying up to the attempt bound.
    /// A package that fails verification is deleted before the next attempt.
    async fn fetch_verified(&mut self, update: &UpdateRecord) -> Result<PathBuf, AgentError> {
        let version = update.version;
        let dest = self.layout.package_path(&version);
        let attempts = self.settings.transfer_attempts;
        let mut last = String::new();

        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            self.state.start_downloading(version, attempt);
            self.save_state()?;

            let result = self
                .source
                .download(&self.settings.uuid, &version, &dest, &self.cancel)
                .await;
            match result {
                Ok(downloaded) => {
                    self.state
                        .update_progress(downloaded.bytes_downloaded, update.package_size);
                    self.state.phase = AgentPhase::Verifying { version };
                    self.save_state()?;
                    match verify_package(&dest, &update.package_checksum, update.package_size) {
                        Ok(()) => return Ok(dest),
                        Err(e) => {
                            self.layout.remove_package(&version);
                            tracing::warn!(
                                uuid = %self.settings.uuid,
                                version = %version,
                                attempt,
                                error = %e,
                                "package failed verification, discarded"
                            );
                            last = e.to_string();
                        }
                    }
                }
                Err(SourceError::Forbidden) => return Err(SourceError::Forbidden.into()),
                Err(SourceError::Download(DownloadError::Cancelled)) => {
                    return Err(AgentError::Cancelled)
                }
                Err(e) => {
                    tracing::warn!(
                        uuid = %self.settings.uuid,
                        version = %version,
                        attempt,
                        error = %e,
                        "package download failed"
                    );
                    last = e.to_string();
                }
            }
        }

        Err(AgentError::Transfer { attempts, last })
    }

    fn install(&self, package: &Path, update: &UpdateRecord) -> Result<(), AgentError> {
        let staged = self.layout.stage(package, &update.version)?;
        let system_packages: &[String] = if update.requires_system_packages {
            &update.system_packages
        } else {
            &[]
        };
        let report = self
            .installer
            .install(&staged, system_packages, self.packages.as_ref())?;
        tracing::info!(
            uuid = %self.settings.uuid,
            version = %update.version,
            packages = report.packages_installed,
            written = report.files_written,
            removed = report.files_removed,
            protected = report.files_protected,
            "files replaced"
        );
        Ok(())
    }

    async fn heartbeat(&self, status: DeviceStatus) -> Result<(), SourceError> {
        let version = self
            .layout
            .local_version()
            .unwrap_or(self.state.current_version);
        let report = HeartbeatRequest {
            current_version: version.to_string(),
            status,
            metadata: self.report_metadata(),
        };
        self.source.heartbeat(&self.settings.uuid, &report).await
    }

    fn report_metadata(&self) -> BTreeMap<String, serde_json::Value> {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "agent_version".to_string(),
            serde_json::Value::from(env!("CARGO_PKG_VERSION")),
        );
        metadata.insert(
            "agent_phase".to_string(),
            serde_json::Value::from(self.state.phase.name()),
        );
        if let Some(error) = &self.state.last_error {
            metadata.insert("last_error".to_string(), serde_json::Value::from(error.as_str()));
        }
        metadata
    }

    fn save_state(&self) -> Result<(), StateError> {
        self.state.save(&self.layout.state_path())
    }
}

fn secs(value: u64) -> TimeDelta {
    TimeDelta::try_seconds(i64::try_from(value).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

/// `inner` relative to `outer`, when `inner` lives inside it
fn relative_inside(inner: &Path, outer: &Path) -> Option<String> {
    let inner = inner.canonicalize().unwrap_or_else(|_| inner.to_path_buf());
    let outer = outer.canonicalize().unwrap_or_else(|_| outer.to_path_buf());
    inner
        .strip_prefix(&outer)
        .ok()
        .filter(|r| !r.as_os_str().is_empty())
        .map(|r| r.to_string_lossy().to_string())
}
