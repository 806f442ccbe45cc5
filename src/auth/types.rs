// Authentication types

use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque identity claims
pub type Profile = Map<String, Value>;

/// Signed-in user as persisted by the identity provider client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub profile: Profile,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub token_type: String,
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl User {
    /// Check if the access token has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Check if the access token expires within the given window
    pub fn expires_within(&self, window: Duration) -> bool {
        Utc::now() + window >= self.expires_at
    }

    /// Subject claim, if the provider sent one
    pub fn subject(&self) -> Option<&str> {
        self.profile.get("sub").and_then(|v| v.as_str())
    }
}

/// The live session view handed to callers
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub profile: Profile,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl From<User> for Session {
    fn from(user: User) -> Self {
        Self {
            profile: user.profile,
            access_token: user.access_token,
            expires_at: user.expires_at,
        }
    }
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth error body from the token endpoint
#[derive(Debug, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}

/// Pending sign-in, persisted between the outbound redirect and the return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigninState {
    /// Random state parameter for CSRF protection
    pub id: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    /// When the sign-in flow was started
    pub created_at: DateTime<Utc>,
}

/// Subset of the OpenID provider metadata document we use
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
}

/// Authorization response carried by the return navigation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedirectResponse {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl RedirectResponse {
    /// Build from decoded query pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut response = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_ref() {
                "code" => &mut response.code,
                "state" => &mut response.state,
                "error" => &mut response.error,
                "error_description" => &mut response.error_description,
                _ => continue,
            };
            *slot = Some(value.into());
        }
        response
    }

    /// Build from the full return URL
    pub fn from_url(url: &Url) -> Self {
        Self::from_pairs(url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())))
    }
}

/// Which way control left the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    SignIn,
    SignOut,
}

/// Two-phase redirect protocol state
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RedirectPhase {
    /// No redirect in flight
    #[default]
    Idle,
    /// Control was handed to the identity provider
    PendingRedirect(RedirectKind),
    /// The return leg established a session
    Completed,
    /// The return leg failed
    Failed(String),
}
