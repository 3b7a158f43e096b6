//! Error types for the mesh federation controller

use thiserror::Error;

/// Main error type for reconciliation, style effects and the discovery bridge
#[derive(Error, Debug)]
pub enum Error {
    /// Any Kubernetes API failure that is not one of the classified cases below
    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    /// The object does not exist (HTTP 404)
    #[error("Object not found: {0}")]
    NotFound(String),

    /// A create collided with an existing object (HTTP 409, AlreadyExists)
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency violation (HTTP 409, Conflict)
    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A dependency exists but is not usable yet (no load balancer address, no TLS secret)
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The selected style does not support the requested combination
    #[error("Not implemented: {0}")]
    Unimplemented(String),

    #[error("Invalid endpoint {0:?}, expected ip:port")]
    InvalidEndpoint(String),

    #[error("Discovery transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Discovery stream error: {0}")]
    Stream(String),
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::AlreadyExists(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(resp.message.clone()),
            _ => Error::KubeError(e),
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Stream(format!("{:?}: {}", status.code(), status.message()))
    }
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// Check if this error is retriable
    ///
    /// Retriable errors clear up on their own (concurrent writers, missing
    /// dependencies, flaky API server); the rest need a spec change.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::NotFound(_)
            | Error::AlreadyExists(_)
            | Error::Conflict(_)
            | Error::NotReady(_)
            | Error::Transport(_)
            | Error::Stream(_) => true,
            Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::Unimplemented(_)
            | Error::InvalidEndpoint(_) => false,
        }
    }

    /// Short label used for the reconcile error metric
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Conflict(_) => "conflict",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::NotReady(_) => "not_ready",
            Error::Unimplemented(_) => "unimplemented",
            Error::InvalidEndpoint(_) => "invalid_endpoint",
            Error::Transport(_) | Error::Stream(_) => "discovery",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
