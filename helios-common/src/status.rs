// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Status/error types. Operations return `Result<T, HeliosError>`; the
//! `StatusCode` carries the machine-readable kind.

use std::fmt;

/// Machine-readable error kinds surfaced by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// A structural invariant was violated (duplicate initialization,
    /// unexpected storage type, counter underflow). Usually fatal.
    Invalid,
    /// Persistence or filesystem failure.
    IOError,
    /// A deadline expired without fulfillment. Non-fatal; `Wait` treats it
    /// as a partial result.
    TimedOut,
    /// A signal check failed during a blocking get.
    Interrupted,
    /// Lookup miss. KV reads report this as `Ok(None)` instead.
    NotFound,
    /// The remote peer is gone.
    Disconnected,
    /// An insert found the key already present.
    AlreadyExists,
    /// Redis-backed persistence failure.
    RedisError,
    /// Transport-level RPC failure.
    RpcError,
    /// Caller passed a malformed argument.
    InvalidArgument,
    /// Anything else.
    UnknownError,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::IOError => "IOError",
            Self::TimedOut => "TimedOut",
            Self::Interrupted => "Interrupted",
            Self::NotFound => "NotFound",
            Self::Disconnected => "Disconnected",
            Self::AlreadyExists => "AlreadyExists",
            Self::RedisError => "RedisError",
            Self::RpcError => "RpcError",
            Self::InvalidArgument => "InvalidArgument",
            Self::UnknownError => "UnknownError",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The primary error type for Helios operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HeliosError {
    pub code: StatusCode,
    pub message: String,
    /// For RpcError, the transport status code.
    pub rpc_code: Option<i32>,
}

impl HeliosError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            rpc_code: None,
        }
    }

    // Convenience constructors
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Invalid, msg)
    }
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::IOError, msg)
    }
    pub fn timed_out(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::TimedOut, msg)
    }
    pub fn interrupted(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Interrupted, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, msg)
    }
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::Disconnected, msg)
    }
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::AlreadyExists, msg)
    }
    pub fn redis_error(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::RedisError, msg)
    }
    pub fn rpc_error(msg: impl Into<String>, rpc_code: i32) -> Self {
        Self {
            code: StatusCode::RpcError,
            message: msg.into(),
            rpc_code: Some(rpc_code),
        }
    }
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, msg)
    }

    // Predicates
    pub fn is_timed_out(&self) -> bool {
        self.code == StatusCode::TimedOut
    }
    pub fn is_interrupted(&self) -> bool {
        self.code == StatusCode::Interrupted
    }
    pub fn is_not_found(&self) -> bool {
        self.code == StatusCode::NotFound
    }
    pub fn is_disconnected(&self) -> bool {
        self.code == StatusCode::Disconnected
    }
    pub fn is_rpc_error(&self) -> bool {
        self.code == StatusCode::RpcError
    }
    pub fn is_invalid(&self) -> bool {
        self.code == StatusCode::Invalid
    }
}

/// Convenience alias used across the workspace.
pub type HeliosResult<T> = Result<T, HeliosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HeliosError::io_error("disk full");
        assert_eq!(err.to_string(), "IOError: disk full");
    }

    #[test]
    fn test_predicates() {
        assert!(HeliosError::timed_out("t").is_timed_out());
        assert!(HeliosError::interrupted("i").is_interrupted());
        assert!(!HeliosError::not_found("n").is_timed_out());
    }

    #[test]
    fn test_rpc_error_code() {
        let err = HeliosError::rpc_error("connection refused", 14);
        assert!(err.is_rpc_error());
        assert_eq!(err.rpc_code, Some(14));
    }

    #[test]
    fn test_result_alias() {
        let err: HeliosResult<i32> = Err(HeliosError::not_found("item"));
        assert!(err.unwrap_err().is_not_found());
    }
}
