// src/core/errors.rs

//! Defines the primary error type for the entire controller.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the controller.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Authentication failure: {0}")]
    Unauthenticated(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Too few nodes: {0}")]
    ResourceLimit(String),

    #[error("Repeated operation: {0}")]
    OperationRepeat(String),

    #[error("Call failed: {0}")]
    Call(String),

    #[error("Parse failure: {0}")]
    Exception(String),
}

impl From<std::io::Error> for ControlError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ControlError::NotFound(e.to_string()),
            _ => ControlError::Io(Arc::new(e)),
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Exception(e.to_string())
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ControlError::Unreachable(e.to_string())
        } else {
            ControlError::Call(e.to_string())
        }
    }
}

impl From<tonic::Status> for ControlError {
    fn from(s: tonic::Status) -> Self {
        match s.code() {
            tonic::Code::Unavailable => ControlError::Unreachable(s.message().to_string()),
            tonic::Code::Unauthenticated => ControlError::Unauthenticated(s.message().to_string()),
            _ => ControlError::Call(s.message().to_string()),
        }
    }
}

impl From<tonic::transport::Error> for ControlError {
    fn from(e: tonic::transport::Error) -> Self {
        ControlError::Unreachable(e.to_string())
    }
}
