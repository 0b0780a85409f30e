// Error handling module
// Closed error taxonomy for the credential lifecycle and resource dispatch

use thiserror::Error;

/// Classification tag attached to every [`AuthError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network failure, 429 or 5xx from the token endpoint
    Transient,
    /// An attempt exceeded the configured per-attempt timeout
    Timeout,
    /// The authorization server rejected the grant (revoked/invalid credentials)
    GrantRejected,
    /// Credential store read/save/clear failed
    StoreFailure,
    /// Session tokens were cleared; re-authentication must happen outside the session
    Terminal,
    /// A resource server rejected a token the client considered valid
    Expired,
    /// Malformed or unexpected token endpoint response
    Protocol,
    /// Missing or invalid client configuration
    Config,
    /// Original error plus a failed store cleanup
    Compound,
    /// Refresh task ended without producing an outcome
    Abandoned,
}

impl ErrorKind {
    /// Whether the token exchange may retry this class of failure
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }
}

/// Errors produced by the session core
///
/// `Clone` so that one refresh outcome can be delivered to every waiter unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Token endpoint unavailable after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },

    #[error("Token endpoint timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("Grant rejected by authorization server: {status} {code} - {description}")]
    GrantRejected {
        status: u16,
        code: String,
        description: String,
    },

    #[error("Credential store failure: {0}")]
    Store(String),

    #[error("Session terminated: {0}")]
    Terminal(String),

    #[error("Access token rejected by resource server: {0}")]
    TokenExpired(String),

    #[error("Token endpoint protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{primary} (cleanup also failed: {cleanup})")]
    Compound {
        primary: Box<AuthError>,
        cleanup: Box<AuthError>,
    },

    #[error("Refresh abandoned before producing an outcome")]
    Abandoned,
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Transient { .. } => ErrorKind::Transient,
            AuthError::Timeout { .. } => ErrorKind::Timeout,
            AuthError::GrantRejected { .. } => ErrorKind::GrantRejected,
            AuthError::Store(_) => ErrorKind::StoreFailure,
            AuthError::Terminal(_) => ErrorKind::Terminal,
            AuthError::TokenExpired(_) => ErrorKind::Expired,
            AuthError::Protocol(_) => ErrorKind::Protocol,
            AuthError::Config(_) => ErrorKind::Config,
            AuthError::Compound { .. } => ErrorKind::Compound,
            AuthError::Abandoned => ErrorKind::Abandoned,
        }
    }

    /// Combine an error with a cleanup failure that happened while handling it
    pub fn compound(primary: AuthError, cleanup: AuthError) -> Self {
        AuthError::Compound {
            primary: Box::new(primary),
            cleanup: Box::new(cleanup),
        }
    }

    /// True when only an out-of-band login can restore the session
    pub fn requires_reauthentication(&self) -> bool {
        match self {
            AuthError::GrantRejected { .. } | AuthError::Terminal(_) => true,
            AuthError::Compound { primary, .. } => primary.requires_reauthentication(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for AuthError {
    fn from(err: rusqlite::Error) -> Self {
        AuthError::Store(err.to_string())
    }
}

/// Errors surfaced by authorized resource requests
#[derive(Error, Debug)]
pub enum ApiError {
    /// Could not obtain a usable access token
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Resource server answered with a non-success status
    #[error("API error: {status} - {message}")]
    Status { status: u16, message: String },

    /// Transport failed after all retries
    #[error("HTTP request failed: {0}")]
    Transport(String),

    /// Request could not be prepared
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AuthError::Transient {
            attempts: 3,
            message: "503 Service Unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Token endpoint unavailable after 3 attempt(s): 503 Service Unavailable"
        );

        let err = AuthError::GrantRejected {
            status: 400,
            code: "invalid_grant".to_string(),
            description: "Refresh token expired".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Grant rejected by authorization server: 400 invalid_grant - Refresh token expired"
        );

        let err = AuthError::Timeout { attempts: 2 };
        assert_eq!(err.to_string(), "Token endpoint timed out after 2 attempt(s)");
    }

    #[test]
    fn test_compound_message_carries_both() {
        let err = AuthError::compound(
            AuthError::TokenExpired("401 Unauthorized".to_string()),
            AuthError::Store("disk full".to_string()),
        );
        assert_eq!(err.kind(), ErrorKind::Compound);
        assert_eq!(
            err.to_string(),
            "Access token rejected by resource server: 401 Unauthorized (cleanup also failed: Credential store failure: disk full)"
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::GrantRejected.is_retryable());
        assert!(!ErrorKind::StoreFailure.is_retryable());
        assert!(!ErrorKind::Protocol.is_retryable());
    }

    #[test]
    fn test_requires_reauthentication() {
        let rejected = AuthError::GrantRejected {
            status: 401,
            code: "invalid_grant".to_string(),
            description: String::new(),
        };
        assert!(rejected.requires_reauthentication());
        assert!(AuthError::Terminal("revoked".to_string()).requires_reauthentication());
        assert!(!AuthError::Timeout { attempts: 1 }.requires_reauthentication());

        let compound = AuthError::compound(rejected, AuthError::Store("locked".to_string()));
        assert!(compound.requires_reauthentication());
    }

    #[test]
    fn test_sqlite_error_maps_to_store_failure() {
        let err: AuthError = rusqlite::Error::InvalidQuery.into();
        assert_eq!(err.kind(), ErrorKind::StoreFailure);
    }

    #[test]
    fn test_api_error_wraps_auth_error() {
        let err: ApiError = AuthError::Abandoned.into();
        assert_eq!(
            err.to_string(),
            "Authentication failed: Refresh abandoned before producing an outcome"
        );

        let err = ApiError::Status {
            status: 404,
            message: "Not found".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 404 - Not found");
    }
}
