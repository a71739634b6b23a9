use serde::Serialize;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TailErrorKind {
    Connection,
    CredentialsNotFound,
    NotFound,
    InvalidOffset,
    InvalidParams,
    Timeout,
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TailError {
    pub kind: TailErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub retryable: bool,
}

impl TailError {
    pub fn new(kind: TailErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            host: None,
            retryable: matches!(kind, TailErrorKind::Connection | TailErrorKind::Timeout),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(TailErrorKind::Connection, "CONNECTION", message)
    }

    pub fn credentials_not_found(host: &str) -> Self {
        Self::new(
            TailErrorKind::CredentialsNotFound,
            "CREDENTIALS_NOT_FOUND",
            format!("No credentials found for {}", host),
        )
        .with_host(host)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TailErrorKind::NotFound, "NOT_FOUND", message)
    }

    pub fn invalid_offset(message: impl Into<String>) -> Self {
        Self::new(TailErrorKind::InvalidOffset, "INVALID_OFFSET", message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(TailErrorKind::InvalidParams, "INVALID_PARAMS", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TailErrorKind::Timeout, "TIMEOUT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TailErrorKind::Internal, "INTERNAL", message)
    }
}

impl fmt::Display for TailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for TailError {}

impl From<std::io::Error> for TailError {
    fn from(err: std::io::Error) -> Self {
        TailError::internal(err.to_string())
    }
}
