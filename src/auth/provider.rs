// Identity provider and navigation seams

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;

use super::types::{RedirectResponse, User};
use crate::error::{AuthExchangeError, RenewError};

/// Capabilities consumed from the identity provider client
///
/// Implementations must be Send + Sync; the session manager shares one
/// instance between callers and its renewal task.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Prepare a sign-in and return the URL to send the user to
    async fn initiate_sign_in_redirect(&self) -> Result<Url>;

    /// End-session URL, `None` when the provider has no sign-out endpoint
    async fn initiate_sign_out_redirect(&self, id_token_hint: Option<&str>) -> Result<Option<Url>>;

    /// Exchange the authorization response for a user
    ///
    /// Consumes the pending sign-in state: a second call with the same
    /// response fails.
    async fn complete_sign_in_redirect(
        &self,
        response: &RedirectResponse,
    ) -> Result<User, AuthExchangeError>;

    /// Obtain a fresh token for an existing user, without persisting it
    async fn renew(&self, user: &User) -> Result<User, RenewError>;

    /// Persisted user, if any
    async fn get_current_user(&self) -> Result<Option<User>>;

    async fn store_user(&self, user: &User) -> Result<()>;

    async fn remove_user(&self) -> Result<()>;
}

/// The browser: transfers control out of the application
pub trait Navigator: Send + Sync {
    fn navigate_away(&self, url: &Url);
}

/// Navigator for terminal hosts, asks the user to open the URL
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate_away(&self, url: &Url) {
        tracing::info!("Redirecting to {}", url);
        println!();
        println!("  Open this URL in your browser to continue:");
        println!("  {}", url);
        println!();
    }
}
