use thiserror::Error;

use crate::contract::ContractKind;
use crate::validate::FieldViolation;

/// Failure of a single call to the model vendor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("vendor returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no response received: {0}")]
    Network(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("cannot decode vendor response: {0}")]
    Decode(String),
}

impl TransportError {
    /// 429, 5xx and failures where no response arrived are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Decode(_) => false,
        }
    }

    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CogitoError {
    #[error("transport failed after {attempts} attempt(s): {last}")]
    TransportExhausted { attempts: u32, last: TransportError },

    #[error("vendor rejected credentials (HTTP {status}): {message}")]
    Credential { status: u16, message: String },

    #[error("no JSON object in response ({length} chars): {preview}")]
    UnparsableResponse { length: usize, preview: String },

    #[error("{kind} response violates schema: {}", format_violations(.violations))]
    SchemaViolation {
        kind: ContractKind,
        violations: Vec<FieldViolation>,
    },

    #[error("request cancelled during backoff")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for CogitoError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl CogitoError {
    /// Build an `UnparsableResponse` carrying a short preview of the raw text.
    pub fn unparsable(raw: &str) -> Self {
        Self::UnparsableResponse {
            length: raw.chars().count(),
            preview: preview(raw, PREVIEW_CHARS),
        }
    }
}

pub type CogitoResult<T> = Result<T, CogitoError>;

const PREVIEW_CHARS: usize = 200;

/// First `max` characters of `text`, with an ellipsis when truncated.
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
