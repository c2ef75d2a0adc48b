//! Error types for the kappa operator
//!
//! Errors carry enough context (App name, resource kind, field path) to be
//! useful in a log line without a stack trace. Every error also maps onto one
//! of three handling classes, see [`ErrorClass`].

use thiserror::Error;

use crate::kube_utils::is_not_found;

/// How the caller of a reconciliation pass should treat an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The object does not exist. Expected; drives the create path.
    NotFound,
    /// A store write or read failed in a way that may succeed later
    /// (optimistic-concurrency conflict, timeout, connection reset, 5xx).
    ConflictOrTransient,
    /// Malformed input or a rejected request. Retrying without a spec
    /// change will fail the same way.
    Fatal,
}

/// Main error type for kappa operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The App spec cannot be turned into a desired object
    #[error("validation error for {app}: {message}")]
    Validation {
        /// Name of the App with invalid configuration
        app: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.port")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error for {kind}: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized
        kind: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "startup")
        context: String,
    },
}

impl Error {
    /// Create a validation error with App context and field path
    pub fn validation_for_field(
        app: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            app: app.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: kind.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify this error for the reconcile loop.
    ///
    /// API errors are split by status code: 404 is NotFound, 409 (conflict),
    /// 429 (throttled) and 5xx are transient, any other 4xx is Fatal.
    /// Transport-level kube errors are transient.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Kube { source } => match source {
                err if is_not_found(err) => ErrorClass::NotFound,
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => {
                    ErrorClass::ConflictOrTransient
                }
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => ErrorClass::Fatal,
                _ => ErrorClass::ConflictOrTransient,
            },
            Error::Validation { .. } => ErrorClass::Fatal,
            Error::Serialization { .. } => ErrorClass::Fatal,
            Error::Internal { .. } => ErrorClass::ConflictOrTransient,
        }
    }

    /// Check if this error is retryable
    ///
    /// NotFound counts as retryable: an object vanishing mid-pass is resolved
    /// by running the pass again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.class(), ErrorClass::Fatal)
    }
}
