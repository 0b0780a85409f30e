// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default safety margin subtracted from a token's literal expiry
pub const DEFAULT_EXPIRATION_BUFFER_MS: i64 = 30_000;

/// Access/refresh credential pair held by a session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    /// Lifetime of the access token; `None` means no client-side expiry
    pub ttl_ms: Option<i64>,
}

impl CredentialPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        issued_at: DateTime<Utc>,
        ttl_ms: Option<i64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            issued_at,
            ttl_ms,
        }
    }

    /// Pair carrying only a refresh token; the first access forces an exchange
    pub fn from_refresh_token(refresh_token: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(String::new(), Some(refresh_token.into()), now, None)
    }

    /// Empty pair for client-credentials sessions
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self::new(String::new(), None, now, None)
    }

    /// Literal expiry; `None` without a ttl or when the ttl runs past the representable range
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = Duration::try_milliseconds(self.ttl_ms?)?;
        self.issued_at.checked_add_signed(ttl)
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// True once `now` has reached the expiry minus `buffer_ms`, or when no access token is cached
    pub fn is_expired_at(&self, now: DateTime<Utc>, buffer_ms: i64) -> bool {
        if !self.has_access_token() {
            return true;
        }

        let Some(exp) = self.expires_at() else {
            return false;
        };
        Duration::try_milliseconds(buffer_ms)
            .and_then(|buffer| now.checked_add_signed(buffer))
            .map_or(true, |deadline| deadline >= exp)
    }
}

// Tokens stay out of Debug output
impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &crate::utils::mask_token(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(crate::utils::mask_token),
            )
            .field("issued_at", &self.issued_at)
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}

/// Observable state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Cached access token is usable
    Valid,
    /// Buffer-adjusted expiry has passed, no token cached, or marked stale
    NeedsRefresh,
    /// A coalesced refresh is in flight
    Refreshing,
    /// Tokens were cleared; the session cannot recover by itself
    Terminal,
}

/// Which token a revocation request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTypeHint {
    RefreshToken,
    AccessToken,
}

impl TokenTypeHint {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenTypeHint::RefreshToken => "refresh_token",
            TokenTypeHint::AccessToken => "access_token",
        }
    }
}

/// Token endpoint success response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Seconds; some providers send it as a string
    pub expires_in: Option<Value>,
    #[allow(dead_code)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    pub fn expires_in_secs(&self) -> Option<i64> {
        match self.expires_in.as_ref()? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }
}

/// OAuth error body (`error`, `error_description`)
#[derive(Debug, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    pub error_description: Option<String>,
}
