// Authentication module
// Credential lifecycle: expiry tracking, coalesced refresh, persistence, revocation

mod clock;
mod coalescer;
mod exchange;
mod session;
mod store;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coalescer::RequestCoalescer;
pub use exchange::{
    classify_response, classify_transport, revocation_target, ExchangeSettings, TokenExchange,
    TokenExchangeClient,
};
pub use session::{Session, SessionBuilder, SessionSettings};
pub use store::{CredentialStore, MemoryStore, SqliteStore};
pub use types::{CredentialPair, SessionState, TokenTypeHint, DEFAULT_EXPIRATION_BUFFER_MS};
