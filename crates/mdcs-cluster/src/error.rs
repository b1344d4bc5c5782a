//! Error types for the cluster runtime.

use crate::transport::TransportError;
use thiserror::Error;

/// Errors that can occur while hosting or dispatching to replicated services.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Unknown service kind: {0}")]
    UnknownServiceKind(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Service {service} cannot handle message {message_type}")]
    ServiceTypeMismatch {
        service: String,
        message_type: String,
    },

    #[error("Message {0} is a request and expects a reply")]
    NotAnOperation(String),

    #[error("Message {0} is an operation and produces no reply")]
    NotARequest(String),

    #[error("Handler for {0} dropped its reply")]
    ReplyDropped(String),

    #[error("No replicas responded for service {0}")]
    NoReplicasResponded(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cluster has shut down")]
    ClusterShutDown,
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
