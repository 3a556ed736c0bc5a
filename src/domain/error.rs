//! Domain error types.

use std::time::Duration;

/// Top-level error type for orbtrader.
#[derive(Debug, thiserror::Error)]
pub enum OrbError {
    #[error("connection error: {reason}")]
    Connection { reason: String },

    #[error("request {request_id} timed out after {waited:?} without a stream end")]
    Timeout { request_id: i32, waited: Duration },

    #[error("request {request_id} completed with no bars")]
    EmptyResult { request_id: i32 },

    #[error("request {request_id} failed: {reason}")]
    Request { request_id: i32, reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("bad bar data: {reason}")]
    Data { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OrbError {
    pub(crate) fn invalid(section: &str, key: &str, reason: impl Into<String>) -> Self {
        OrbError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn connection(reason: impl Into<String>) -> Self {
        OrbError::Connection {
            reason: reason.into(),
        }
    }

    /// True for the configuration family of errors.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            OrbError::ConfigParse { .. }
                | OrbError::ConfigMissing { .. }
                | OrbError::ConfigInvalid { .. }
        )
    }
}

impl From<&OrbError> for std::process::ExitCode {
    fn from(err: &OrbError) -> Self {
        let code: u8 = match err {
            OrbError::Io(_) => 1,
            OrbError::ConfigParse { .. }
            | OrbError::ConfigMissing { .. }
            | OrbError::ConfigInvalid { .. } => 2,
            OrbError::Connection { .. } => 3,
            OrbError::Timeout { .. } => 4,
            OrbError::EmptyResult { .. } => 5,
            OrbError::Request { .. } | OrbError::Data { .. } => 6,
        };
        std::process::ExitCode::from(code)
    }
}
