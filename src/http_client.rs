use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response};
use std::time::Duration;

use crate::auth::Session;
use crate::error::{ApiError, AuthError, ErrorKind};
use crate::utils::backoff_delay_ms;

/// HTTP client for resource requests authorized by a [`Session`]
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    session: Session,

    /// Maximum number of retries for 429/5xx and transport errors
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ApiClient {
    pub fn new(
        session: Session,
        connect_timeout: Duration,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            session,
            max_retries,
            base_delay_ms: 1000,
        })
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay_ms = base_delay.as_millis() as u64;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Get the underlying HTTP client, e.g. to build requests
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Execute `request` with a bearer token
    /// Automatically handles:
    /// - 401: routes the rejected token through the session's expired-token recovery and retries once
    /// - 429: exponential backoff
    /// - 5xx: exponential backoff
    pub async fn send(&self, request: Request) -> Result<Response, ApiError> {
        let mut attempt = 0;
        let mut recovered = false;

        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(method = %method, url = %url, "Sending authorized request");

        loop {
            let mut req = request
                .try_clone()
                .ok_or_else(|| ApiError::InvalidRequest("Request body is not cloneable".to_string()))?;

            let token = self.session.get_access_token().await?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ApiError::InvalidRequest(format!("Invalid access token: {}", e)))?;
            req.headers_mut().insert(AUTHORIZATION, bearer);

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    match status.as_u16() {
                        // Server says the token is expired even though the client thought it valid
                        401 if !recovered => {
                            let body = response.text().await.unwrap_or_default();
                            let observed = AuthError::TokenExpired(format!("{} - {}", status, body));
                            let err = self
                                .session
                                .handle_rejected_access_token(&token, observed)
                                .await;
                            if err.kind() == ErrorKind::Compound {
                                return Err(err.into());
                            }

                            tracing::warn!("Received 401, retrying with refreshed token");
                            recovered = true;
                            continue;
                        }

                        429 | 500..=599 if attempt < self.max_retries => {
                            let delay = backoff_delay_ms(self.base_delay_ms, attempt);
                            tracing::warn!(
                                "Received {}, retrying after {}ms (attempt {}/{})",
                                status,
                                delay,
                                attempt + 1,
                                self.max_retries
                            );
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            attempt += 1;
                            continue;
                        }

                        _ => {}
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    tracing::error!(
                        status = status.as_u16(),
                        url = %url,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "Request failed with error response"
                    );
                    return Err(ApiError::Status {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }

                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = backoff_delay_ms(self.base_delay_ms, attempt);
                        tracing::warn!(
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "Request failed after all retries"
                    );
                    return Err(ApiError::Transport(e.to_string()));
                }
            }
        }
    }
}
