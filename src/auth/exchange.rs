// Token endpoint protocol client
// Stateless: operates on the pairs it is given and returns new ones

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use super::types::{CredentialPair, OAuthErrorBody, TokenResponse, TokenTypeHint};
use crate::error::{AuthError, Result};
use crate::utils::{backoff_delay_ms, mask_token};

/// OAuth error codes that mean the presented credentials will never work again
const REJECTION_CODES: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "invalid_token",
];

/// Upper bound on a server-reported `expires_in` (one year)
const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

/// Token endpoint operations a session depends on
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Trade the current pair for a new one
    async fn refresh(&self, current: &CredentialPair) -> Result<CredentialPair>;

    /// Invalidate the most authoritative token in `pair`
    async fn revoke(&self, pair: &CredentialPair) -> Result<()>;
}

/// Token endpoint connection settings
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub token_url: String,
    pub revoke_url: Option<String>,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    /// Total attempts per refresh, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Per-attempt timeout
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ExchangeSettings {
    pub fn new(token_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            revoke_url: None,
            client_id: client_id.into(),
            client_secret: None,
            scope: None,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP implementation of [`TokenExchange`]
pub struct TokenExchangeClient {
    client: Client,
    settings: ExchangeSettings,
    clock: Arc<dyn Clock>,
}

impl TokenExchangeClient {
    pub fn new(settings: ExchangeSettings) -> Result<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: ExchangeSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        if settings.max_attempts == 0 {
            return Err(AuthError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|e| AuthError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            settings,
            clock,
        })
    }

    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    /// Form fields for the grant that fits `current`
    fn grant_form(&self, current: &CredentialPair) -> Result<Vec<(&'static str, String)>> {
        let mut form = Vec::with_capacity(5);

        match current.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            Some(refresh_token) => {
                form.push(("grant_type", "refresh_token".to_string()));
                form.push(("refresh_token", refresh_token.to_string()));
                form.push(("client_id", self.settings.client_id.clone()));
                if let Some(secret) = &self.settings.client_secret {
                    form.push(("client_secret", secret.clone()));
                }
            }
            None => {
                let secret = self.settings.client_secret.as_ref().ok_or_else(|| {
                    AuthError::Config(
                        "No refresh token available and no client secret configured".to_string(),
                    )
                })?;
                form.push(("grant_type", "client_credentials".to_string()));
                form.push(("client_id", self.settings.client_id.clone()));
                form.push(("client_secret", secret.clone()));
                if let Some(scope) = &self.settings.scope {
                    form.push(("scope", scope.clone()));
                }
            }
        }

        Ok(form)
    }

    /// Single POST; the body is read here so body-read failures count as transport failures
    async fn post_form(
        &self,
        url: &str,
        form: &[(&'static str, String)],
    ) -> std::result::Result<(StatusCode, String), reqwest::Error> {
        let response = self.client.post(url).form(form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

#[async_trait]
impl TokenExchange for TokenExchangeClient {
    async fn refresh(&self, current: &CredentialPair) -> Result<CredentialPair> {
        let form = self.grant_form(current)?;
        let grant = form[0].1.as_str();
        let max_attempts = self.settings.max_attempts;
        let mut attempt: u32 = 0;

        tracing::debug!(
            url = %self.settings.token_url,
            grant = grant,
            "Requesting new credentials"
        );

        loop {
            // Expiry is measured from before the request so the client errs early
            let issued_at = self.clock.now();
            let failure = match self.post_form(&self.settings.token_url, &form).await {
                Ok((status, body)) if status.is_success() => {
                    let pair = parse_token_response(&body, current, issued_at)?;
                    tracing::info!(
                        attempt = attempt + 1,
                        token = %mask_token(&pair.access_token),
                        expires_at = ?pair.expires_at(),
                        "Credentials refreshed"
                    );
                    return Ok(pair);
                }
                Ok((status, body)) => classify_response(status, &body, attempt + 1),
                Err(e) => classify_transport(&e, attempt + 1),
            };

            if !failure.kind().is_retryable() {
                tracing::error!(error = %failure, "Token refresh rejected, not retrying");
                return Err(failure);
            }

            if attempt + 1 >= max_attempts {
                tracing::error!(
                    total_attempts = attempt + 1,
                    error = %failure,
                    "Token refresh failed after all retries"
                );
                return Err(failure);
            }

            let delay =
                backoff_delay_ms(self.settings.base_delay.as_millis() as u64, attempt);
            tracing::warn!(
                "Token refresh failed: {}, retrying after {}ms (attempt {}/{})",
                failure,
                delay,
                attempt + 1,
                max_attempts
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    async fn revoke(&self, pair: &CredentialPair) -> Result<()> {
        let url = self
            .settings
            .revoke_url
            .as_deref()
            .ok_or_else(|| AuthError::Config("No revocation endpoint configured".to_string()))?;

        let (token, hint) = revocation_target(pair)
            .ok_or_else(|| AuthError::Terminal("No token available to revoke".to_string()))?;

        let mut form = vec![
            ("token", token.to_string()),
            ("token_type_hint", hint.as_str().to_string()),
            ("client_id", self.settings.client_id.clone()),
        ];
        if let Some(secret) = &self.settings.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        match self.post_form(url, &form).await {
            Ok((status, _)) if status.is_success() => {
                tracing::info!(hint = hint.as_str(), "Token revoked");
                Ok(())
            }
            Ok((status, body)) => {
                let err = classify_response(status, &body, 1);
                tracing::warn!(hint = hint.as_str(), error = %err, "Token revocation failed");
                Err(err)
            }
            Err(e) => {
                let err = classify_transport(&e, 1);
                tracing::warn!(hint = hint.as_str(), error = %err, "Token revocation failed");
                Err(err)
            }
        }
    }
}

/// Prefer the refresh token: providers cascade its revocation to the access token
pub fn revocation_target(pair: &CredentialPair) -> Option<(&str, TokenTypeHint)> {
    if let Some(refresh) = pair.refresh_token.as_deref().filter(|t| !t.is_empty()) {
        return Some((refresh, TokenTypeHint::RefreshToken));
    }
    if pair.has_access_token() {
        return Some((pair.access_token.as_str(), TokenTypeHint::AccessToken));
    }
    None
}

/// Map a non-success token endpoint response onto the error taxonomy
pub fn classify_response(status: StatusCode, body: &str, attempts: u32) -> AuthError {
    let oauth = serde_json::from_str::<OAuthErrorBody>(body).ok();
    let code = oauth.as_ref().map(|b| b.error.clone()).unwrap_or_default();
    let description = oauth
        .and_then(|b| b.error_description)
        .unwrap_or_else(|| body.chars().take(240).collect());

    match status.as_u16() {
        408 => AuthError::Timeout { attempts },
        429 | 500..=599 => AuthError::Transient {
            attempts,
            message: format!("{} - {}", status, description),
        },
        400 | 401 => AuthError::GrantRejected {
            status: status.as_u16(),
            code,
            description,
        },
        403 if REJECTION_CODES.contains(&code.as_str()) => AuthError::GrantRejected {
            status: status.as_u16(),
            code,
            description,
        },
        _ => AuthError::Protocol(format!(
            "Unexpected token endpoint status {}: {}",
            status, description
        )),
    }
}

/// Map a transport failure onto the error taxonomy
pub fn classify_transport(err: &reqwest::Error, attempts: u32) -> AuthError {
    let error_kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connection_failed"
    } else if err.is_request() {
        "request_error"
    } else if err.is_body() {
        "body_error"
    } else if err.is_decode() {
        "decode_error"
    } else {
        "unknown"
    };

    tracing::warn!(
        error_kind = error_kind,
        error = %err,
        attempt = attempts,
        "Token endpoint request error"
    );

    if err.is_timeout() {
        AuthError::Timeout { attempts }
    } else {
        AuthError::Transient {
            attempts,
            message: format!("{} (kind: {})", err, error_kind),
        }
    }
}

/// Build the new pair from a success body, keeping the old refresh token when none is returned
pub fn parse_token_response(
    body: &str,
    current: &CredentialPair,
    issued_at: chrono::DateTime<chrono::Utc>,
) -> Result<CredentialPair> {
    let data: TokenResponse = serde_json::from_str(body)
        .map_err(|e| AuthError::Protocol(format!("Failed to parse token response: {}", e)))?;

    let access_token = data.access_token.trim();
    if access_token.is_empty() {
        return Err(AuthError::Protocol(
            "Token response does not contain access_token".to_string(),
        ));
    }

    // Non-positive lifetimes mean already expired; absurd ones are capped
    let ttl_ms = data.expires_in_secs().map(|secs| {
        if secs > MAX_TOKEN_LIFETIME_SECS {
            tracing::warn!(
                expires_in = secs,
                cap = MAX_TOKEN_LIFETIME_SECS,
                "Token lifetime out of range, capping"
            );
        }
        secs.clamp(0, MAX_TOKEN_LIFETIME_SECS) * 1000
    });

    let refresh_token = data
        .refresh_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| current.refresh_token.clone());

    Ok(CredentialPair::new(
        access_token,
        refresh_token,
        issued_at,
        ttl_ms,
    ))
}

/// Get machine fingerprint for User-Agent
fn machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

fn user_agent() -> String {
    format!(
        "oauth-session/{} ({})",
        env!("CARGO_PKG_VERSION"),
        machine_fingerprint()
    )
}
