//! Error classification shared by every subsystem.

use serde::Serialize;

/// The policy bucket an error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input, rejected before any side effect
    Validation,
    /// Duplicate of existing immutable state
    Conflict,
    /// Unknown, malformed or disabled caller
    Authorization,
    NotFound,
    /// Checksum mismatch or network failure, retried locally
    Transfer,
    /// OS package or file-swap failure, fatal for the attempt
    Install,
    Internal,
}
