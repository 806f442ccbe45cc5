// OAuth2 / OpenID Connect authorization-code client

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use reqwest::{Client, Url};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

use super::pkce;
use super::provider::IdentityProvider;
use super::storage::SessionStore;
use super::types::{
    OAuthErrorResponse, Profile, ProviderMetadata, RedirectResponse, SigninState, TokenResponse,
    User,
};
use crate::error::{AuthExchangeError, RenewError};

const SIGNIN_STATE_PREFIX: &str = "oidc.signin.";

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Longest token lifetime accepted from the token endpoint
const MAX_EXPIRES_IN: i64 = 365 * 24 * 3600;

/// Identity provider client settings
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub authority: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub post_logout_redirect_uri: Option<String>,
    pub response_type: String,
    pub scope: String,
    /// Pending sign-ins older than this cannot be completed
    pub stale_state_age: Duration,
}

impl OidcSettings {
    pub fn new(
        authority: impl Into<String>,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into(),
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            post_logout_redirect_uri: None,
            response_type: "code".to_string(),
            scope: "openid profile email".to_string(),
            stale_state_age: Duration::seconds(900),
        }
    }
}

/// Token endpoint failure, mapped differently for exchange and renewal
#[derive(Error, Debug)]
enum TokenError {
    #[error("{status} - {message}")]
    Rejected { status: u16, message: String },

    #[error("{0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Authorization-code + PKCE client backed by a [`SessionStore`]
pub struct OidcClient {
    settings: OidcSettings,
    client: Client,
    store: Arc<dyn SessionStore>,
    metadata: OnceCell<ProviderMetadata>,
}

impl OidcClient {
    /// Create a new client; `timeout` of `None` leaves requests unbounded
    pub fn new(
        settings: OidcSettings,
        store: Arc<dyn SessionStore>,
        timeout: Option<std::time::Duration>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        Ok(Self {
            settings,
            client,
            store,
            metadata: OnceCell::new(),
        })
    }

    pub fn settings(&self) -> &OidcSettings {
        &self.settings
    }

    fn user_key(&self) -> String {
        format!(
            "oidc.user:{}:{}",
            self.settings.authority, self.settings.client_id
        )
    }

    /// Provider metadata, discovered once
    pub async fn metadata(&self) -> Result<&ProviderMetadata> {
        self.metadata
            .get_or_try_init(|| self.fetch_metadata())
            .await
    }

    async fn fetch_metadata(&self) -> Result<ProviderMetadata> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.settings.authority.trim_end_matches('/')
        );
        tracing::debug!("Fetching provider metadata from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send discovery request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Discovery failed: {} - {}", status, error_text);
        }

        let metadata: ProviderMetadata = response
            .json()
            .await
            .context("Failed to parse provider metadata")?;

        tracing::info!(
            "Discovered identity provider {}",
            metadata.issuer.as_deref().unwrap_or(&self.settings.authority)
        );
        Ok(metadata)
    }

    /// Drop sign-in states that can no longer be completed
    fn prune_stale_states(&self) {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("Failed to list sign-in states: {:#}", e);
                return;
            }
        };

        let cutoff = Utc::now() - self.settings.stale_state_age;
        for key in keys.iter().filter(|k| k.starts_with(SIGNIN_STATE_PREFIX)) {
            let stale = match self.store.get(key) {
                Ok(Some(raw)) => serde_json::from_str::<SigninState>(&raw)
                    .map(|state| state.created_at < cutoff)
                    .unwrap_or(true),
                Ok(None) => false,
                Err(_) => true,
            };
            if stale {
                tracing::debug!("Removing stale sign-in state {}", key);
                if let Err(e) = self.store.remove(key) {
                    tracing::warn!("Failed to remove stale sign-in state: {:#}", e);
                }
            }
        }
    }

    /// Remove and return the pending sign-in for `id`
    fn take_signin_state(&self, id: &str) -> Result<Option<SigninState>, AuthExchangeError> {
        let key = format!("{}{}", SIGNIN_STATE_PREFIX, id);
        let raw = self
            .store
            .get(&key)
            .map_err(|e| AuthExchangeError::Storage(format!("{:#}", e)))?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        self.store
            .remove(&key)
            .map_err(|e| AuthExchangeError::Storage(format!("{:#}", e)))?;

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| AuthExchangeError::Storage(format!("Corrupt sign-in state: {}", e)))
    }

    async fn request_token(
        &self,
        endpoint: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, TokenError> {
        let response = self
            .client
            .post(endpoint)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<OAuthErrorResponse>(&body) {
                Ok(OAuthErrorResponse {
                    error,
                    error_description: Some(description),
                }) => format!("{}: {}", error, description),
                Ok(OAuthErrorResponse { error, .. }) => error,
                Err(_) if body.is_empty() => status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string(),
                Err(_) => body,
            };

            tracing::error!(
                status = status.as_u16(),
                "Token request failed: {}",
                message
            );
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Invalid(format!("Failed to parse token response: {}", e)))?;

        if token.access_token.is_empty() {
            return Err(TokenError::Invalid(
                "Token response does not contain access_token".to_string(),
            ));
        }

        Ok(token)
    }

    async fn fetch_userinfo(&self, endpoint: &str, access_token: &str) -> Result<Profile> {
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .context("Failed to send userinfo request")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Userinfo request failed: {}", status);
        }

        response
            .json()
            .await
            .context("Failed to parse userinfo response")
    }
}

/// Decode the claims of an ID token
///
/// The signature is not verified.
pub fn decode_id_token_claims(id_token: &str) -> Result<Profile> {
    let payload = id_token
        .split('.')
        .nth(1)
        .context("ID token is not a JWT")?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("ID token payload is not base64url")?;
    serde_json::from_slice(&bytes).context("ID token payload is not a JSON object")
}

/// Absolute expiry for a token response, with `expires_in` clamped to
/// `0..=MAX_EXPIRES_IN`
fn expires_at(token: &TokenResponse) -> Option<chrono::DateTime<Utc>> {
    let secs = token
        .expires_in
        .unwrap_or(DEFAULT_EXPIRES_IN)
        .clamp(0, MAX_EXPIRES_IN);
    Utc::now().checked_add_signed(Duration::seconds(secs))
}

#[async_trait]
impl IdentityProvider for OidcClient {
    async fn initiate_sign_in_redirect(&self) -> Result<Url> {
        let metadata = self.metadata().await?;
        self.prune_stale_states();

        let state = SigninState {
            id: pkce::generate_state(),
            code_verifier: pkce::generate_verifier(),
            redirect_uri: self.settings.redirect_uri.clone(),
            created_at: Utc::now(),
        };
        let challenge = pkce::challenge(&state.code_verifier);

        self.store.set(
            &format!("{}{}", SIGNIN_STATE_PREFIX, state.id),
            &serde_json::to_string(&state)?,
        )?;

        let url = Url::parse_with_params(
            &metadata.authorization_endpoint,
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", state.redirect_uri.as_str()),
                ("response_type", self.settings.response_type.as_str()),
                ("scope", self.settings.scope.as_str()),
                ("state", state.id.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .context("Invalid authorization endpoint")?;

        tracing::info!("Sign-in started (state: {}...)", &state.id[..8]);
        Ok(url)
    }

    async fn initiate_sign_out_redirect(&self, id_token_hint: Option<&str>) -> Result<Option<Url>> {
        let metadata = self.metadata().await?;
        let Some(endpoint) = metadata.end_session_endpoint.as_deref() else {
            tracing::debug!("Provider has no end-session endpoint");
            return Ok(None);
        };

        let mut url = Url::parse(endpoint).context("Invalid end-session endpoint")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.settings.client_id);
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            if let Some(ref post_logout) = self.settings.post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", post_logout);
            }
        }

        Ok(Some(url))
    }

    async fn complete_sign_in_redirect(
        &self,
        response: &RedirectResponse,
    ) -> Result<User, AuthExchangeError> {
        if let Some(ref error) = response.error {
            if let Some(ref state) = response.state {
                if let Err(e) = self.take_signin_state(state) {
                    tracing::warn!("Failed to discard sign-in state: {}", e);
                }
            }
            return Err(AuthExchangeError::Provider {
                error: error.clone(),
                description: response.error_description.clone(),
            });
        }

        let state_id = response
            .state
            .as_deref()
            .ok_or(AuthExchangeError::MissingParameter("state"))?;
        let code = response
            .code
            .as_deref()
            .ok_or(AuthExchangeError::MissingParameter("code"))?;

        let signin = self
            .take_signin_state(state_id)?
            .ok_or(AuthExchangeError::StateMismatch)?;
        if Utc::now() - signin.created_at > self.settings.stale_state_age {
            return Err(AuthExchangeError::StateExpired);
        }

        let metadata = self
            .metadata()
            .await
            .map_err(|e| AuthExchangeError::Network(format!("{:#}", e)))?;

        tracing::debug!("Exchanging authorization code (state: {}...)", &state_id[..8.min(state_id.len())]);
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", signin.redirect_uri.as_str()),
            ("client_id", self.settings.client_id.as_str()),
            ("code_verifier", signin.code_verifier.as_str()),
        ];
        let token = self
            .request_token(&metadata.token_endpoint, &form)
            .await
            .map_err(|e| match e {
                TokenError::Rejected { status, message } => {
                    AuthExchangeError::TokenRejected { status, message }
                }
                TokenError::Network(e) => AuthExchangeError::Network(e.to_string()),
                TokenError::Invalid(msg) => AuthExchangeError::InvalidResponse(msg),
            })?;

        let profile = match (&token.id_token, &metadata.userinfo_endpoint) {
            (Some(id_token), _) => decode_id_token_claims(id_token)
                .map_err(|e| AuthExchangeError::InvalidResponse(format!("{:#}", e)))?,
            (None, Some(endpoint)) => self
                .fetch_userinfo(endpoint, &token.access_token)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("Failed to load user profile (non-fatal): {:#}", e);
                    Profile::new()
                }),
            (None, None) => Profile::new(),
        };

        let expires_at = expires_at(&token).ok_or_else(|| {
            AuthExchangeError::InvalidResponse("Token lifetime is out of range".to_string())
        })?;
        tracing::info!("Code exchange successful, expires: {}", expires_at.to_rfc3339());

        Ok(User {
            profile,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            id_token: token.id_token,
            token_type: token.token_type,
            scope: token.scope,
            expires_at,
        })
    }

    async fn renew(&self, user: &User) -> Result<User, RenewError> {
        let refresh_token = user
            .refresh_token
            .as_deref()
            .ok_or_else(|| RenewError::Rejected("No refresh token available".to_string()))?;

        let metadata = self.metadata().await?;

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.settings.client_id.as_str()),
        ];
        let token = self
            .request_token(&metadata.token_endpoint, &form)
            .await
            .map_err(|e| match e {
                TokenError::Rejected { status, message } if status == 400 || status == 401 => {
                    RenewError::Rejected(message)
                }
                other => RenewError::Transient(anyhow::anyhow!("Token refresh failed: {}", other)),
            })?;

        let profile = match token.id_token.as_deref().map(decode_id_token_claims) {
            Some(Ok(profile)) => profile,
            Some(Err(e)) => {
                tracing::warn!("Ignoring unreadable ID token on renewal: {:#}", e);
                user.profile.clone()
            }
            None => user.profile.clone(),
        };

        let expires_at = expires_at(&token).ok_or_else(|| {
            RenewError::Transient(anyhow::anyhow!("Token lifetime is out of range"))
        })?;
        tracing::info!("Token renewed, expires: {}", expires_at.to_rfc3339());

        Ok(User {
            profile,
            access_token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| user.refresh_token.clone()),
            id_token: token.id_token.or_else(|| user.id_token.clone()),
            token_type: token.token_type,
            scope: token.scope.or_else(|| user.scope.clone()),
            expires_at,
        })
    }

    async fn get_current_user(&self) -> Result<Option<User>> {
        let key = self.user_key();
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };

        match serde_json::from_str::<User>(&raw) {
            Ok(user) => Ok(Some(user)),
            Err(e) => {
                tracing::warn!("Discarding unreadable stored user: {}", e);
                self.store.remove(&key)?;
                Ok(None)
            }
        }
    }

    async fn store_user(&self, user: &User) -> Result<()> {
        let raw = serde_json::to_string(user).context("Failed to serialize user")?;
        self.store.set(&self.user_key(), &raw)
    }

    async fn remove_user(&self) -> Result<()> {
        self.store.remove(&self.user_key())
    }
}
