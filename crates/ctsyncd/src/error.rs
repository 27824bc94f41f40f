//! Error types for ctsyncd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors include sufficient detail for audit

use crate::types::L4Protocol;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in ctsyncd
///
/// Per-record problems (unsupported family, full dispatch queue) are never
/// raised through this type to a supervisor; they are resolved where they
/// occur by releasing the record.
#[derive(Debug, Error)]
pub enum CtsyncError {
    /// A local address required for an exclusion rule could not be determined
    /// NIST: CM-8 (System Component Inventory) - Interface lookup
    #[error("Cannot resolve IPv4 address of interface {interface}: {reason}")]
    Resolution { interface: String, reason: String },

    /// Filter logic for an attribute kind could not be set
    #[error("Filter configuration error: {0}")]
    FilterConfig(String),

    /// Subscription to the connection tracking subsystem failed
    /// NIST: AC-3 (Access Enforcement) - Requires CAP_NET_ADMIN
    #[error("Failed to open {protocol} conntrack session: {reason}")]
    SessionOpen { protocol: L4Protocol, reason: String },

    /// The rule set could not be bound to an open handle
    #[error("Failed to attach {protocol} filter: {reason}")]
    FilterAttach { protocol: L4Protocol, reason: String },

    /// Unrecoverable receive failure on a capture session
    /// NIST: SI-4 (System Monitoring) - Monitoring interruption
    #[error("{protocol} capture failed: {reason}")]
    Capture { protocol: L4Protocol, reason: String },

    /// A timeout file could not be opened or read
    #[error("Cannot read timeout file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The filesystem notification subsystem failed
    #[error("Timeout watch error: {0}")]
    Watch(String),

    /// The dispatch gateway rejected a message
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Daemon configuration error
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation attempted in the wrong session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CtsyncError {
    /// Whether this error ends the capture session it was raised on.
    ///
    /// Resolution and dispatch failures only cost a single rule or record.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            CtsyncError::SessionOpen { .. }
                | CtsyncError::FilterAttach { .. }
                | CtsyncError::FilterConfig(_)
                | CtsyncError::Capture { .. }
        )
    }
}

/// Result type alias for ctsyncd operations
pub type Result<T> = std::result::Result<T, CtsyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CtsyncError::Resolution {
            interface: "bridge0".to_string(),
            reason: "no IPv4 address".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot resolve IPv4 address of interface bridge0: no IPv4 address"
        );

        let err = CtsyncError::Capture {
            protocol: L4Protocol::Udp,
            reason: "recv failed".to_string(),
        };
        assert_eq!(err.to_string(), "UDP capture failed: recv failed");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(
            CtsyncError::SessionOpen {
                protocol: L4Protocol::Tcp,
                reason: "EPERM".to_string(),
            }
            .is_fatal_to_session()
        );
        assert!(!CtsyncError::Dispatch("queue full".to_string()).is_fatal_to_session());
        assert!(
            !CtsyncError::Resolution {
                interface: "bridge0".to_string(),
                reason: "absent".to_string(),
            }
            .is_fatal_to_session()
        );
    }
}
