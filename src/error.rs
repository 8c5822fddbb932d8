//! Error types for the link engine.
//!
//! Errors are split by the layer that produces them.  [`LinkError`] is
//! the typed error that travels on the wire inside a response and is
//! handed to requester callbacks.  [`FrameError`] is produced by the
//! framers and knows whether the framing state survived the problem.
//! [`SessionError`] is what callers of the requester API see, and
//! [`ConfigError`] covers loading configuration files.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error `type` strings understood by both peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    PermissionDenied,
    InvalidMethod,
    NotImplemented,
    InvalidPath,
    InvalidParameter,
    InvalidValue,
    Disconnected,
    Failed,
}

/// Broad grouping of [`ErrorType`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol,
    Permission,
    BadRequest,
    NotSupported,
    Internal,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::PermissionDenied => "permissionDenied",
            ErrorType::InvalidMethod => "invalidMethod",
            ErrorType::NotImplemented => "notImplemented",
            ErrorType::InvalidPath => "invalidPath",
            ErrorType::InvalidParameter => "invalidParameter",
            ErrorType::InvalidValue => "invalidValue",
            ErrorType::Disconnected => "disconnected",
            ErrorType::Failed => "failed",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorType::InvalidMethod => ErrorCategory::Protocol,
            ErrorType::PermissionDenied => ErrorCategory::Permission,
            ErrorType::InvalidPath | ErrorType::InvalidParameter | ErrorType::InvalidValue => {
                ErrorCategory::BadRequest
            }
            ErrorType::NotImplemented => ErrorCategory::NotSupported,
            ErrorType::Disconnected | ErrorType::Failed => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed protocol error as carried in the `error` field of a
/// response.  Requester handlers receive this value instead of a raw
/// failure crossing the connection boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error)]
#[error("{error_type}: {msg}")]
pub struct LinkError {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LinkError {
    pub fn new(error_type: ErrorType, msg: impl Into<String>) -> Self {
        Self {
            error_type,
            msg: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn invalid_path(path: &str) -> Self {
        Self::new(ErrorType::InvalidPath, format!("invalid path: {path}"))
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(ErrorType::PermissionDenied, msg)
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::new(ErrorType::NotImplemented, msg)
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorType::Failed, msg)
    }

    pub fn category(&self) -> ErrorCategory {
        self.error_type.category()
    }
}

/// Errors raised while turning bytes into messages or back.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("frame of {size} bytes exceeds the limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("bad multipart header for rid {rid}: {reason}")]
    BadMultipart { rid: u32, reason: &'static str },
    #[error("ack violation: {0}")]
    AckViolation(String),
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u32, got: u32 },
    #[error("peer exceeded the ack window: seq {seq}, allowed up to {allowed}")]
    WindowViolation { seq: u32, allowed: u32 },
    #[error("codec error: {0}")]
    Codec(String),
}

impl FrameError {
    /// Whether the error leaves the framing state unusable.  Fatal
    /// errors escalate to a disconnect; the rest are logged and the
    /// offending frame skipped.
    pub fn is_fatal(&self) -> bool {
        match self {
            FrameError::Malformed(_) | FrameError::MissingField(_) | FrameError::UnknownType(_) => {
                false
            }
            FrameError::TooLarge { .. }
            | FrameError::BadMultipart { .. }
            | FrameError::AckViolation(_)
            | FrameError::SequenceGap { .. }
            | FrameError::WindowViolation { .. }
            | FrameError::Codec(_) => true,
        }
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(err: serde_json::Error) -> Self {
        FrameError::Malformed(err.to_string())
    }
}

/// Errors reported to callers of the requester and session APIs.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("stream {0} is closed")]
    StreamClosed(u32),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Errors raised while loading a [`LinkConfig`](crate::config::LinkConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
