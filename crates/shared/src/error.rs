use serde_json::Value;
use thiserror::Error;

/// Business codes the backend uses for credential problems. These are
/// recoverable by a refresh-and-retry; every other business code surfaces
/// verbatim to the caller.
pub const AUTH_BUSINESS_CODES: &[&str] = &["UNAUTHORIZED", "INVALID_TOKEN", "EXPIRED_TOKEN"];

/// Failure taxonomy for every backend interaction. Callers match on the
/// variant to decide between a domain-specific message, a login redirect,
/// and a generic "try again" prompt.
#[derive(Debug, Clone, Error)]
pub enum ApiFailure {
    /// The server understood the request and rejected it for a domain
    /// reason; `code` and `message` come from the response envelope.
    #[error("business failure {code}: {message}")]
    Business {
        code: String,
        message: String,
        payload: Option<Value>,
    },
    /// The request completed but the response carried no parseable
    /// business code.
    #[error("http failure: status {status}")]
    Http { status: u16 },
    /// Socket/broker level failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// No response reached us at all.
    #[error("network failure: {0}")]
    Network(String),
}

impl ApiFailure {
    /// Credential-class failures are the only ones the request layer may
    /// recover from on its own (single refresh, single retry).
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ApiFailure::Http { status } => *status == 401,
            ApiFailure::Business { code, .. } => AUTH_BUSINESS_CODES.contains(&code.as_str()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_auth_failures() {
        assert!(ApiFailure::Http { status: 401 }.is_auth_failure());
        assert!(ApiFailure::Business {
            code: "EXPIRED_TOKEN".into(),
            message: "expired".into(),
            payload: None,
        }
        .is_auth_failure());
        assert!(!ApiFailure::Http { status: 500 }.is_auth_failure());
        assert!(!ApiFailure::Business {
            code: "PROFILE_INCOMPLETE".into(),
            message: "fill in your profile".into(),
            payload: None,
        }
        .is_auth_failure());
        assert!(!ApiFailure::Network("offline".into()).is_auth_failure());
    }
}
