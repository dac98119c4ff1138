//! Centralized error taxonomy for the relay core.
//!
//! Rejections carry a reason prefix (`blocked:`, `rate-limited:`, …) whose
//! text is safe to show to clients verbatim. Anything unexpected is wrapped
//! and logged server-side; clients only ever see a generic failure string.

use thiserror::Error;

/// A classified rejection of an event or operation.
///
/// The `Display` form is the exact machine-readable string sent in
/// `OK`/`CLOSED` messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Reject {
    #[error("blocked: {0}")]
    Blocked(String),

    #[error("rate-limited: {0}")]
    RateLimited(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("pow: {0}")]
    Pow(String),

    #[error("error: {0}")]
    Other(String),
}

impl Reject {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::Blocked(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    pub fn duplicate(reason: impl Into<String>) -> Self {
        Self::Duplicate(reason.into())
    }
}

/// Errors surfaced by protocol handling and the ingestion pipeline.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed frame or JSON; the connection answers with a NOTICE and
    /// stays open.
    #[error("{0}")]
    Protocol(String),

    /// A classified, client-safe rejection.
    #[error(transparent)]
    Reject(#[from] Reject),

    /// Storage could not produce results within the deadline.
    #[error("error: could not respond fast enough")]
    Timeout,

    /// Anything unexpected. Logged with context; clients see a generic
    /// failure string only.
    #[error("error: something went wrong")]
    Unknown(anyhow::Error),
}

impl RelayError {
    /// The message text a client may see for this error.
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(e: anyhow::Error) -> Self {
        Self::Unknown(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_prefixes() {
        assert_eq!(
            Reject::blocked("only registered users can post").to_string(),
            "blocked: only registered users can post"
        );
        assert_eq!(
            Reject::RateLimited("slow down".into()).to_string(),
            "rate-limited: slow down"
        );
        assert_eq!(Reject::Pow("difficulty 20".into()).to_string(), "pow: difficulty 20");
    }

    #[test]
    fn unknown_errors_never_leak_detail() {
        let err = RelayError::Unknown(anyhow::anyhow!("connection refused to 10.0.0.3:5432"));
        assert_eq!(err.client_message(), "error: something went wrong");
    }

    #[test]
    fn timeout_message() {
        assert_eq!(
            RelayError::Timeout.client_message(),
            "error: could not respond fast enough"
        );
    }
}
