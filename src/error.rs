//! Error types for the Smart LB Operator
//!
//! One error enum shared by the cloud adapters, the cluster store and the
//! reconcilers. Cloud adapters normalize every provider "missing resource"
//! shape into [`Error::NotFound`], so reconcilers only ever match on that.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Invalid revision annotation on {object}: {value}")]
    InvalidRevision { object: String, value: String },

    #[error("Credentials unavailable for {secret}: {reason}")]
    Credentials { secret: String, reason: String },

    // =========================================================================
    // Cloud Resource Errors
    // =========================================================================
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} was created without an id")]
    EmptyResourceId { kind: &'static str },

    #[error("Existing floating IP {address} not found")]
    ExistingFloatingIpNotFound { address: String },

    #[error("Port id not set in LoadBalancer status")]
    PortNotSet,

    #[error("OpenStack API error: {service} - {reason}")]
    CloudApi { service: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Http(_)
            | Error::CloudApi { .. }
            | Error::Timeout(_)
            | Error::NotFound { .. } => ErrorAction::RequeueWithBackoff,

            // User has to fix the reference, keep polling without hammering
            Error::ExistingFloatingIpNotFound { .. } | Error::Credentials { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // Configuration errors - don't retry automatically
            Error::Configuration(_) | Error::Metrics(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Http(_) | Error::CloudApi { .. } | Error::Timeout(_)
        )
    }

    /// Normalized cloud not-found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Optimistic-concurrency conflict from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::ExistingFloatingIpNotFound {
            address: "1.2.3.4".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::EmptyResourceId { kind: "port" };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::CloudApi {
            service: "neutron".into(),
            reason: "503 Service Unavailable".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());

        // user input errors keep retrying
        let user_err = Error::ExistingFloatingIpNotFound {
            address: "1.2.3.4".into(),
        };
        assert!(user_err.is_retryable());
    }

    #[test]
    fn test_not_found_and_conflict() {
        let err = Error::NotFound {
            kind: "port",
            id: "p-1".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_conflict());

        let conflict = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        }));
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());
    }
}
