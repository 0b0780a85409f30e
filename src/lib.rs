// OAuth session - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod utils;

pub use auth::{CredentialPair, CredentialStore, Session, SessionState, TokenExchangeClient};
pub use error::{ApiError, AuthError, ErrorKind};
