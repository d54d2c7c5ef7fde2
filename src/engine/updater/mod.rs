//! Device Update Agent
//!
//! Keeps one device's application tree on the latest published version.
//!
//! Components:
//! - `agent` - Control loop and cycle logic
//! - `state` - Persisted agent state machine
//! - `client` - Device-side view of the update server
//! - `download` - Cancellable package download
//! - `verify` - Checksum verification
//! - `version_manager` - On-device layout, version marker and staging
//! - `policy` - Scheduled and urgent install timing
//! - `activity` - Idle tracking for urgent updates
//! - `install` - System packages and file replacement
//! - `manifest` - Protected paths that updates never touch
//! - `restart` - Restart signalling
//! - `identity` - Persistent device uuid

pub mod activity;
pub mod agent;
pub mod client;
pub mod download;
pub mod identity;
pub mod install;
pub mod manifest;
pub mod policy;
pub mod restart;
pub mod state;
pub mod verify;
pub mod version_manager;

pub use agent::{AgentError, CheckResult, CycleContext, CycleOutcome, UpdateAgent};
pub use manifest::ProtectedManifest;
pub use state::{AgentPhase, AgentState};
pub use version_manager::VersionManager;
