use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Auth,
    RateLimit,
    MalformedRequest,
    Network,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Auth => "auth",
            FailureKind::RateLimit => "rate-limit",
            FailureKind::MalformedRequest => "malformed-request",
            FailureKind::Network => "network",
            FailureKind::Unknown => "unknown",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            FailureKind::Auth => "credentials were rejected by the task backend",
            FailureKind::RateLimit => "task backend rate limit exceeded",
            FailureKind::MalformedRequest => "task backend rejected the request as malformed",
            FailureKind::Network => "task backend could not be reached",
            FailureKind::Unknown => "task backend failed for an unrecognised reason",
        }
    }

    /// Auth and malformed requests will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::RateLimit | FailureKind::Network | FailureKind::Unknown)
    }

    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 | 403 => Some(FailureKind::Auth),
            429 => Some(FailureKind::RateLimit),
            400 | 404 | 405 | 413 | 422 => Some(FailureKind::MalformedRequest),
            500..=599 => Some(FailureKind::Network),
            _ if status >= 400 => Some(FailureKind::Unknown),
            _ => None,
        }
    }

    /// Best-effort classification of a free-text error message.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

        if has(&["401", "403", "unauthorized", "forbidden", "invalid api key", "authentication"]) {
            FailureKind::Auth
        } else if has(&["429", "rate limit", "too many requests", "quota"]) {
            FailureKind::RateLimit
        } else if has(&["400", "bad request", "invalid request", "malformed", "missing required"]) {
            FailureKind::MalformedRequest
        } else if has(&["timeout", "timed out", "connection", "network", "dns", "unreachable", "503", "502"]) {
            FailureKind::Network
        } else {
            FailureKind::Unknown
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified task failure. Never carries an empty message.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{kind} failure: {message}")]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Error code matched by error boundaries; defaults to the kind string.
    pub code: Option<String>,
    pub attempts: u32,
    /// Output streamed by failed attempts before they broke off.
    pub partial: Vec<Value>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            kind.describe().to_string()
        } else {
            message
        };
        Self { kind, message, code: None, attempts: 0, partial: Vec::new() }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        if let Some(req) = err.downcast_ref::<reqwest::Error>() {
            return Self::new(classify_reqwest(req), message);
        }
        Self::new(FailureKind::from_message(&message), message)
    }

    pub fn error_code(&self) -> &str {
        self.code.as_deref().unwrap_or(self.kind.as_str())
    }

    /// Error boundaries without a code catch everything.
    pub fn matches_code(&self, boundary_code: Option<&str>) -> bool {
        boundary_code.is_none_or(|c| c == self.error_code())
    }
}

pub fn classify_reqwest(err: &reqwest::Error) -> FailureKind {
    if let Some(kind) = err.status().and_then(|s| FailureKind::from_status(s.as_u16())) {
        kind
    } else if err.is_timeout() || err.is_connect() {
        FailureKind::Network
    } else if err.is_decode() || err.is_builder() {
        FailureKind::MalformedRequest
    } else {
        FailureKind::Unknown
    }
}
