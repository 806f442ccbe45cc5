use anyhow::Result;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::provider::{IdentityProvider, Navigator};
use super::renewal;
use super::types::{Profile, RedirectKind, RedirectPhase, RedirectResponse, Session, User};
use crate::error::AuthExchangeError;

/// Session manager tuning
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Renew once the token expires within this window
    pub renew_threshold: Duration,

    /// How often the renewal task checks the token
    pub check_interval: std::time::Duration,

    /// Run the background renewal task
    pub automatic_silent_renew: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            renew_threshold: Duration::seconds(60),
            check_interval: std::time::Duration::from_secs(15),
            automatic_silent_renew: true,
        }
    }
}

/// State shared between the manager and its renewal task
pub(super) struct Inner {
    pub(super) provider: Arc<dyn IdentityProvider>,
    navigator: Arc<dyn Navigator>,
    pub(super) settings: SessionSettings,
    phase: RwLock<RedirectPhase>,

    /// Serializes writes to the persisted user
    write_lock: Mutex<()>,
}

impl Inner {
    /// Current non-expired user; an expired one is removed
    async fn current_user(&self) -> Option<User> {
        match self.provider.get_current_user().await {
            Ok(Some(user)) if user.is_expired() => {
                tracing::info!(
                    "Session expired at {}, removing",
                    user.expires_at.to_rfc3339()
                );
                self.discard_user(&user.access_token).await;
                None
            }
            Ok(user) => user,
            Err(e) => {
                tracing::warn!("Failed to read session state: {:#}", e);
                None
            }
        }
    }

    /// Remove the persisted user unconditionally
    pub(super) async fn terminate(&self) {
        let _guard = self.write_lock.lock().await;
        match self.provider.remove_user().await {
            Ok(()) => tracing::info!("Session terminated"),
            Err(e) => tracing::warn!("Failed to remove session state: {:#}", e),
        }
    }

    /// Remove the persisted user if it still carries `access_token`
    pub(super) async fn discard_user(&self, access_token: &str) -> bool {
        let _guard = self.write_lock.lock().await;
        match self.provider.get_current_user().await {
            Ok(Some(user)) if user.access_token == access_token => {
                if let Err(e) = self.provider.remove_user().await {
                    tracing::warn!("Failed to remove session state: {:#}", e);
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("Failed to read session state: {:#}", e);
                false
            }
        }
    }

    /// Store `renewed` if the session still carries `access_token`
    pub(super) async fn replace_user(&self, access_token: &str, renewed: &User) -> bool {
        let _guard = self.write_lock.lock().await;
        match self.provider.get_current_user().await {
            Ok(Some(user)) if user.access_token == access_token => {
                match self.provider.store_user(renewed).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!("Failed to store renewed session: {:#}", e);
                        false
                    }
                }
            }
            Ok(_) => {
                tracing::debug!("Session changed during renewal, discarding renewed token");
                false
            }
            Err(e) => {
                tracing::warn!("Failed to read session state: {:#}", e);
                false
            }
        }
    }

    async fn set_phase(&self, phase: RedirectPhase) {
        tracing::debug!("Redirect phase: {:?}", phase);
        *self.phase.write().await = phase;
    }
}

/// Session manager
/// Owns the identity session and renews it in the background
pub struct SessionManager {
    inner: Arc<Inner>,

    /// Background renewal task, aborted on drop
    renewal: Option<JoinHandle<()>>,
}

impl SessionManager {
    /// Create a session manager; must be called inside a Tokio runtime
    /// when silent renewal is enabled
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        navigator: Arc<dyn Navigator>,
        settings: SessionSettings,
    ) -> Self {
        let automatic_silent_renew = settings.automatic_silent_renew;
        let check_interval = settings.check_interval;

        let inner = Arc::new(Inner {
            provider,
            navigator,
            settings,
            phase: RwLock::new(RedirectPhase::Idle),
            write_lock: Mutex::new(()),
        });

        let renewal = automatic_silent_renew
            .then(|| renewal::spawn(Arc::downgrade(&inner), check_interval));

        Self { inner, renewal }
    }

    /// Start the sign-in redirect
    ///
    /// Control leaves the application: the caller must not expect anything
    /// to happen after this beyond the navigator being handed the URL.
    pub async fn login(&self) -> Result<()> {
        let url = self.inner.provider.initiate_sign_in_redirect().await?;
        self.inner
            .set_phase(RedirectPhase::PendingRedirect(RedirectKind::SignIn))
            .await;
        self.inner.navigator.navigate_away(&url);
        Ok(())
    }

    /// End the session locally, then start the sign-out redirect
    ///
    /// The local session is gone even when building the end-session URL
    /// fails.
    pub async fn logout(&self) -> Result<()> {
        let id_token = match self.inner.provider.get_current_user().await {
            Ok(user) => user.and_then(|u| u.id_token),
            Err(e) => {
                tracing::warn!("Failed to read session state: {:#}", e);
                None
            }
        };

        self.inner
            .set_phase(RedirectPhase::PendingRedirect(RedirectKind::SignOut))
            .await;
        self.inner.terminate().await;

        match self
            .inner
            .provider
            .initiate_sign_out_redirect(id_token.as_deref())
            .await
        {
            Ok(Some(url)) => {
                self.inner.navigator.navigate_away(&url);
                Ok(())
            }
            Ok(None) => {
                tracing::info!("Signed out locally (provider has no end-session endpoint)");
                self.inner.set_phase(RedirectPhase::Idle).await;
                Ok(())
            }
            Err(e) => {
                self.inner
                    .set_phase(RedirectPhase::Failed(format!("{:#}", e)))
                    .await;
                Err(e)
            }
        }
    }

    /// Local-only termination, used when the backend rejects the credential
    pub async fn terminate(&self) {
        self.inner.terminate().await;
    }

    /// Complete the return leg of the sign-in redirect
    ///
    /// Not idempotent: the pending sign-in is consumed by the first call.
    pub async fn handle_login_redirect(
        &self,
        response: &RedirectResponse,
    ) -> Result<Session, AuthExchangeError> {
        let result = self.complete_and_store(response).await;

        match result {
            Ok(ref session) => {
                tracing::info!(
                    "Signed in, token expires: {}",
                    session.expires_at.to_rfc3339()
                );
                self.inner.set_phase(RedirectPhase::Completed).await;
            }
            Err(ref e) => {
                tracing::warn!("Sign-in exchange failed: {}", e);
                self.inner.set_phase(RedirectPhase::Failed(e.to_string())).await;
            }
        }

        result
    }

    async fn complete_and_store(
        &self,
        response: &RedirectResponse,
    ) -> Result<Session, AuthExchangeError> {
        let user = self
            .inner
            .provider
            .complete_sign_in_redirect(response)
            .await?;

        let _guard = self.inner.write_lock.lock().await;
        self.inner
            .provider
            .store_user(&user)
            .await
            .map_err(|e| AuthExchangeError::Storage(format!("{:#}", e)))?;

        Ok(Session::from(user))
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.current_user().await.is_some()
    }

    pub async fn get_profile(&self) -> Option<Profile> {
        self.inner.current_user().await.map(|user| user.profile)
    }

    /// Current bearer credential; never an expired one
    pub async fn get_access_token(&self) -> Option<String> {
        self.inner.current_user().await.map(|user| user.access_token)
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.current_user().await.map(Session::from)
    }

    pub async fn redirect_phase(&self) -> RedirectPhase {
        self.inner.phase.read().await.clone()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    #[cfg(test)]
    pub(super) fn inner(&self) -> &Inner {
        &self.inner
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}
