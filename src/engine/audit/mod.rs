//! Audit Module
//!
//! Append-only record of operator-relevant server events

pub mod log;

pub use log::{AuditAction, AuditEntry, AuditError, AuditLog};
