// In-process identity provider double for unit tests

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Url;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::provider::{IdentityProvider, Navigator};
use super::types::{Profile, RedirectResponse, User};
use crate::error::{AuthExchangeError, RenewError};

pub fn user_with_token(access_token: &str, expires_in: i64) -> User {
    let mut profile = Profile::new();
    profile.insert("sub".to_string(), json!("user-1"));
    User {
        profile,
        access_token: access_token.to_string(),
        refresh_token: Some(format!("refresh-{}", access_token)),
        id_token: Some(format!("id-{}", access_token)),
        token_type: "Bearer".to_string(),
        scope: Some("openid".to_string()),
        expires_at: Utc::now() + Duration::seconds(expires_in),
    }
}

#[derive(Debug, Clone)]
pub enum RenewBehavior {
    Succeed(String),
    Reject,
    FailTransiently,
}

/// Accepts code `good-code` and issues token `abc`
pub struct FakeProvider {
    user: Mutex<Option<User>>,
    renew: Mutex<RenewBehavior>,
    end_session: bool,
    remove_calls: AtomicUsize,
    renew_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            user: Mutex::new(None),
            renew: Mutex::new(RenewBehavior::Reject),
            end_session: false,
            remove_calls: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
        }
    }

    pub fn signed_in(access_token: &str, expires_in: i64) -> Self {
        let provider = Self::new();
        *provider.user.lock().unwrap() = Some(user_with_token(access_token, expires_in));
        provider
    }

    pub fn with_end_session(mut self) -> Self {
        self.end_session = true;
        self
    }

    pub fn valid_response() -> RedirectResponse {
        RedirectResponse {
            code: Some("good-code".to_string()),
            state: Some("s1".to_string()),
            ..Default::default()
        }
    }

    pub fn set_renew(&self, behavior: RenewBehavior) {
        *self.renew.lock().unwrap() = behavior;
    }

    pub fn stored(&self) -> Option<User> {
        self.user.lock().unwrap().clone()
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn initiate_sign_in_redirect(&self) -> Result<Url> {
        Ok(Url::parse("https://idp.example/authorize?state=s1")?)
    }

    async fn initiate_sign_out_redirect(&self, id_token_hint: Option<&str>) -> Result<Option<Url>> {
        if !self.end_session {
            return Ok(None);
        }
        let mut url = Url::parse("https://idp.example/end-session")?;
        if let Some(hint) = id_token_hint {
            url.query_pairs_mut().append_pair("id_token_hint", hint);
        }
        Ok(Some(url))
    }

    async fn complete_sign_in_redirect(
        &self,
        response: &RedirectResponse,
    ) -> Result<User, AuthExchangeError> {
        match response.code.as_deref() {
            Some("good-code") => Ok(user_with_token("abc", 3600)),
            Some(_) => Err(AuthExchangeError::TokenRejected {
                status: 400,
                message: "invalid_grant".to_string(),
            }),
            None => Err(AuthExchangeError::MissingParameter("code")),
        }
    }

    async fn renew(&self, _user: &User) -> Result<User, RenewError> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.renew.lock().unwrap().clone();
        match behavior {
            RenewBehavior::Succeed(token) => Ok(user_with_token(&token, 3600)),
            RenewBehavior::Reject => Err(RenewError::Rejected("invalid_grant".to_string())),
            RenewBehavior::FailTransiently => {
                Err(RenewError::Transient(anyhow::anyhow!("connection reset")))
            }
        }
    }

    async fn get_current_user(&self) -> Result<Option<User>> {
        Ok(self.stored())
    }

    async fn store_user(&self, user: &User) -> Result<()> {
        *self.user.lock().unwrap() = Some(user.clone());
        Ok(())
    }

    async fn remove_user(&self) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        *self.user.lock().unwrap() = None;
        Ok(())
    }
}

/// Records every URL control was handed to
#[derive(Default)]
pub struct RecordingNavigator {
    urls: Mutex<Vec<Url>>,
}

impl RecordingNavigator {
    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate_away(&self, url: &Url) {
        self.urls.lock().unwrap().push(url.clone());
    }
}
