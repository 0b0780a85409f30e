// Session state machine
// Owns the credential pair; every mutation of it happens inside the coalesced refresh,
// expired-token recovery (stale flag only) or revoke_tokens (terminal)

use std::sync::{Arc, RwLock};

use super::clock::{Clock, SystemClock};
use super::coalescer::RequestCoalescer;
use super::exchange::{revocation_target, TokenExchange};
use super::store::CredentialStore;
use super::types::{CredentialPair, SessionState, DEFAULT_EXPIRATION_BUFFER_MS};
use crate::error::{AuthError, ErrorKind, Result};
use crate::utils::{mask_token, RwLockExt};

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Treat tokens as expired this long before their literal expiry
    pub expiration_buffer_ms: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            expiration_buffer_ms: DEFAULT_EXPIRATION_BUFFER_MS,
        }
    }
}

struct Tokens {
    /// `None` once the session is terminal
    pair: Option<CredentialPair>,
    /// Set when a resource server rejected the cached access token
    stale: bool,
}

struct Inner {
    identity: String,
    tokens: RwLock<Tokens>,
    exchange: Arc<dyn TokenExchange>,
    store: Option<Arc<dyn CredentialStore>>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    refresh: RequestCoalescer<CredentialPair>,
}

impl Inner {
    fn needs_refresh(&self, tokens: &Tokens, pair: &CredentialPair) -> bool {
        tokens.stale
            || pair.is_expired_at(self.clock.now(), self.settings.expiration_buffer_ms)
    }
}

/// Authentication session
/// Hands out access tokens, refreshing at most once at a time no matter how many callers race
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    identity: String,
    exchange: Arc<dyn TokenExchange>,
    store: Option<Arc<dyn CredentialStore>>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
}

impl SessionBuilder {
    /// Persist refreshed credentials to `store`
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn expiration_buffer_ms(mut self, buffer_ms: i64) -> Self {
        self.settings.expiration_buffer_ms = buffer_ms;
        self
    }

    /// Start the session from a caller-supplied pair
    pub fn build(self, initial: CredentialPair) -> Session {
        tracing::debug!(
            identity = %self.identity,
            token = %mask_token(&initial.access_token),
            expires_at = ?initial.expires_at(),
            persistent = self.store.is_some(),
            "Session created"
        );

        Session {
            inner: Arc::new(Inner {
                identity: self.identity,
                tokens: RwLock::new(Tokens {
                    pair: Some(initial),
                    stale: false,
                }),
                exchange: self.exchange,
                store: self.store,
                clock: self.clock,
                settings: self.settings,
                refresh: RequestCoalescer::new(),
            }),
        }
    }

    /// Start the session from the pair persisted for this identity
    pub async fn restore(self) -> Result<Session> {
        let store = self.store.clone().ok_or_else(|| {
            AuthError::Config("Restoring a session requires a credential store".to_string())
        })?;

        tracing::info!(identity = %self.identity, "Loading credentials from store");
        let pair = store.read(&self.identity).await?.ok_or_else(|| {
            AuthError::Config(format!("No stored credentials for '{}'", self.identity))
        })?;

        Ok(self.build(pair))
    }
}

fn terminal_error() -> AuthError {
    AuthError::Terminal("Session tokens were revoked or rejected; re-authentication required".to_string())
}

impl Session {
    pub fn builder(identity: impl Into<String>, exchange: Arc<dyn TokenExchange>) -> SessionBuilder {
        SessionBuilder {
            identity: identity.into(),
            exchange,
            store: None,
            clock: Arc::new(SystemClock),
            settings: SessionSettings::default(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Read-only copy of the current pair; `None` when terminal
    pub fn snapshot(&self) -> Option<CredentialPair> {
        self.inner.tokens.read_or_recover().pair.clone()
    }

    pub fn state(&self) -> SessionState {
        let tokens = self.inner.tokens.read_or_recover();
        match &tokens.pair {
            None => SessionState::Terminal,
            Some(_) if self.inner.refresh.is_busy() => SessionState::Refreshing,
            Some(pair) if self.inner.needs_refresh(&tokens, pair) => SessionState::NeedsRefresh,
            Some(_) => SessionState::Valid,
        }
    }

    /// Synchronous fast path: the cached token if it is still valid
    ///
    /// Never touches the exchange client or the store. Fails only when the session is terminal.
    pub fn cached_access_token(&self) -> Result<Option<String>> {
        let tokens = self.inner.tokens.read_or_recover();
        let pair = tokens.pair.as_ref().ok_or_else(terminal_error)?;

        if self.inner.needs_refresh(&tokens, pair) {
            return Ok(None);
        }
        Ok(Some(pair.access_token.clone()))
    }

    /// Get a valid access token, refreshing if necessary
    pub async fn get_access_token(&self) -> Result<String> {
        if let Some(token) = self.cached_access_token()? {
            tracing::trace!(identity = %self.inner.identity, "Serving cached access token");
            return Ok(token);
        }

        tracing::debug!(identity = %self.inner.identity, "Access token needs refresh");
        let inner = Arc::clone(&self.inner);
        let pair = self
            .inner
            .refresh
            .run(move || do_refresh(inner, false))
            .await?;
        Ok(pair.access_token)
    }

    /// Refresh regardless of expiry; joins an in-flight refresh if there is one
    pub async fn force_refresh(&self) -> Result<String> {
        let inner = Arc::clone(&self.inner);
        let pair = self
            .inner
            .refresh
            .run(move || do_refresh(inner, true))
            .await?;
        Ok(pair.access_token)
    }

    /// Recovery entry point for a resource request rejected with an expired-token signal
    ///
    /// Waits for an in-flight refresh to land, then drops the persisted record for this
    /// identity and marks the cached pair stale so the next
    /// [`get_access_token`](Self::get_access_token) performs a real exchange. Returns the
    /// error the caller should propagate: `observed` itself, or a compound error when the
    /// store could not be cleared.
    pub async fn handle_expired_tokens_error(&self, observed: AuthError) -> AuthError {
        self.inner.refresh.settled().await;
        self.invalidate(None, observed).await
    }

    /// Like [`handle_expired_tokens_error`](Self::handle_expired_tokens_error), for callers
    /// that know which access token the server rejected
    ///
    /// When that token has already been replaced by a refresh, the current credentials are
    /// kept as they are and `observed` is returned unchanged.
    pub async fn handle_rejected_access_token(
        &self,
        rejected: &str,
        observed: AuthError,
    ) -> AuthError {
        self.inner.refresh.settled().await;
        self.invalidate(Some(rejected), observed).await
    }

    async fn invalidate(&self, rejected: Option<&str>, observed: AuthError) -> AuthError {
        let superseded = {
            let mut tokens = self.inner.tokens.write_or_recover();
            let superseded = match (rejected, tokens.pair.as_ref()) {
                (Some(rejected), Some(pair)) => pair.access_token != rejected,
                _ => false,
            };
            if !superseded && tokens.pair.is_some() {
                tokens.stale = true;
            }
            superseded
        };

        if superseded {
            tracing::debug!(
                identity = %self.inner.identity,
                "Rejected access token was already replaced, keeping current credentials"
            );
            return observed;
        }

        tracing::warn!(
            identity = %self.inner.identity,
            error = %observed,
            "Access token rejected by server, forcing refresh on next access"
        );

        if let Some(store) = &self.inner.store {
            if let Err(cleanup) = store.clear(&self.inner.identity).await {
                tracing::error!(
                    identity = %self.inner.identity,
                    error = %cleanup,
                    "Failed to clear stale credentials from store"
                );
                return AuthError::compound(observed, cleanup);
            }
        }

        observed
    }

    /// Revoke the session's tokens and make the session terminal
    ///
    /// The session is terminal afterwards even when revocation fails; the error is still
    /// reported so the caller knows the server-side grant may remain valid.
    pub async fn revoke_tokens(&self) -> Result<()> {
        // Let an in-flight refresh land first so its pair is the one revoked
        self.inner.refresh.settled().await;

        let pair = {
            let mut tokens = self.inner.tokens.write_or_recover();
            tokens.stale = false;
            tokens.pair.take()
        };

        let Some(pair) = pair else {
            tracing::debug!(identity = %self.inner.identity, "Session already terminal");
            return Ok(());
        };

        let revoked = match revocation_target(&pair) {
            Some(_) => self.inner.exchange.revoke(&pair).await,
            None => Ok(()),
        };

        let cleared = match &self.inner.store {
            Some(store) => store.clear(&self.inner.identity).await,
            None => Ok(()),
        };

        match (revoked, cleared) {
            (Ok(()), Ok(())) => {
                tracing::info!(identity = %self.inner.identity, "Session tokens revoked");
                Ok(())
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                tracing::warn!(identity = %self.inner.identity, error = %e, "Session closed with errors");
                Err(e)
            }
            (Err(e), Err(cleanup)) => Err(AuthError::compound(e, cleanup)),
        }
    }
}

/// Producer handed to the refresh coalescer; the only writer of a refreshed pair
async fn do_refresh(inner: Arc<Inner>, force: bool) -> Result<CredentialPair> {
    let current = {
        let tokens = inner.tokens.read_or_recover();
        let pair = tokens.pair.as_ref().ok_or_else(terminal_error)?;

        // An earlier busy period may already have produced a fresh pair
        if !force && !inner.needs_refresh(&tokens, pair) {
            tracing::debug!(identity = %inner.identity, "Credentials already fresh");
            return Ok(pair.clone());
        }
        pair.clone()
    };

    let refreshed = match inner.exchange.refresh(&current).await {
        Ok(pair) => pair,
        Err(err) => {
            if err.kind() == ErrorKind::GrantRejected {
                tracing::error!(
                    identity = %inner.identity,
                    error = %err,
                    "Refresh grant rejected, session is now terminal"
                );
                inner.tokens.write_or_recover().pair = None;
            }
            return Err(err);
        }
    };

    let revoked = inner.tokens.read_or_recover().pair.is_none();
    if revoked {
        return Err(terminal_error());
    }

    if let Some(store) = &inner.store {
        if let Err(err) = store.save(&inner.identity, &refreshed).await {
            tracing::error!(
                identity = %inner.identity,
                error = %err,
                "Failed to persist refreshed credentials"
            );
            // Keep the rotated refresh token in memory, but serve nothing from this
            // cycle: the next access runs a new exchange and retries the save
            let mut tokens = inner.tokens.write_or_recover();
            if tokens.pair.is_some() {
                tokens.pair = Some(refreshed);
                tokens.stale = true;
            }
            return Err(err);
        }
    }

    let mut tokens = inner.tokens.write_or_recover();
    if tokens.pair.is_none() {
        return Err(terminal_error());
    }
    tokens.pair = Some(refreshed.clone());
    tokens.stale = false;

    tracing::debug!(
        identity = %inner.identity,
        expires_at = ?refreshed.expires_at(),
        "Session credentials updated"
    );
    Ok(refreshed)
}
