//! Error types for the multiarch placement operator
//!
//! Variants carry structured fields rather than preformatted strings.
//! Inspection errors carry the image reference that failed so the message
//! written onto a pod points at the culprit.

use std::time::Duration;

use thiserror::Error;

/// Main error type for placement operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// Source error from the client
        #[from]
        source: kube::Error,
    },

    /// Validation error for configuration resources
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// What is wrong with it
        message: String,
        /// The invalid field path (e.g., "spec.plugins.nodeAffinityScoring.platforms")
        field: Option<String>,
    },

    /// Image inspection failed (registry unreachable, auth failure, bad manifest)
    #[error("failed to inspect image {image}: {message}")]
    Inspection {
        /// Image reference that could not be inspected
        image: String,
        /// Underlying failure
        message: String,
    },

    /// An operation did not finish within its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that was abandoned
        operation: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Payload could not be encoded or decoded
    #[error("serialization error: {message}")]
    Serialization {
        /// Underlying failure
        message: String,
        /// Kind of the resource involved, when known
        kind: Option<String>,
    },

    /// Failure in the operator's own plumbing
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Underlying failure
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "watcher")
        context: String,
    },
}

impl Error {
    /// Invalid `field` on `resource`
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an inspection error for an image
    pub fn inspection(image: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Inspection {
            image: image.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Serialization failure without a known resource kind
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Serialization failure while handling a `kind` resource
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Operational failure inside `context` (e.g. "webhook")
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether a later attempt can succeed without a config change
    ///
    /// Validation and serialization errors need a config fix.
    /// Inspection errors are retried a bounded number of times by the pod
    /// controller, so they count as retryable here.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::Inspection { .. } => true,
            Error::Timeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the image reference if this error is tied to one
    pub fn image(&self) -> Option<&str> {
        match self {
            Error::Inspection { image, .. } => Some(image),
            _ => None,
        }
    }
}
