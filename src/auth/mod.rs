// Authentication module
// Identity session lifecycle, the OIDC redirect flow and persisted state

mod manager;
mod oidc;
mod pkce;
mod provider;
mod renewal;
mod storage;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{SessionManager, SessionSettings};
pub use oidc::{decode_id_token_claims, OidcClient, OidcSettings};
pub use provider::{IdentityProvider, LogNavigator, Navigator};
pub use storage::{MemoryStore, SessionStore, SqliteStore};
pub use types::{
    Profile, ProviderMetadata, RedirectKind, RedirectPhase, RedirectResponse, Session,
    SigninState, User,
};
