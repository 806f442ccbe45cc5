use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::SessionManager;
use crate::error::ApiError;
use crate::models::{ErrorEnvelope, ResponseEnvelope};

/// Authorized request dispatcher for the backend API
///
/// Every call is exactly one network attempt. A 401 ends the local session
/// before the error is returned.
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Backend base URL, joined with each request path
    base_url: String,

    /// Source of the bearer credential
    session: Arc<SessionManager>,
}

impl ApiClient {
    /// Create a new dispatcher; timeouts of `None` leave requests unbounded
    pub fn new(
        base_url: impl Into<String>,
        session: Arc<SessionManager>,
        request_timeout: Option<u64>,
        connect_timeout: Option<u64>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(secs) = request_timeout {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = connect_timeout {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            session,
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Join `path` onto the base URL
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ResponseEnvelope<T>, ApiError> {
        let body = self.execute(Method::GET, path, None).await?;
        decode(&body)
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<ResponseEnvelope<T>, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(body)?;
        let body = self.execute(Method::POST, path, Some(payload)).await?;
        decode(&body)
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<ResponseEnvelope<T>, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(body)?;
        let body = self.execute(Method::PUT, path, Some(payload)).await?;
        decode(&body)
    }

    /// Delete a resource; the success envelope carries nothing of use
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(Method::DELETE, path, None).await?;
        Ok(())
    }

    /// Send one request and return the body of a success response
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<String, ApiError> {
        let token = self.session.get_access_token().await;
        let url = self.url(path);

        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }
        if let Some(ref token) = token {
            request = request.bearer_auth(token);
        }

        tracing::debug!(
            method = %method,
            url = %url,
            authorized = token.is_some(),
            "Sending HTTP request"
        );

        let response = request.send().await.map_err(|e| {
            tracing::warn!(
                error_kind = error_kind(&e),
                error = %e,
                url = %url,
                "HTTP request error"
            );
            ApiError::Network(e)
        })?;

        let status = response.status();
        tracing::debug!(status = %status, "Received HTTP response");

        if status.is_success() {
            return Ok(response.text().await?);
        }

        // A failure body that cannot be read still carries its status
        let text = response.text().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, url = %url, "Failed to read error response body");
            String::new()
        });
        let message = error_message(status, &text);

        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(url = %url, "Credential rejected by backend, terminating session");
            self.session.terminate().await;
            return Err(ApiError::Unauthorized { message });
        }

        tracing::error!(
            status = status.as_u16(),
            url = %url,
            response_body = %text,
            "HTTP request failed with error response"
        );
        Err(ApiError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<ResponseEnvelope<T>, ApiError> {
    serde_json::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Message for a failure response: the envelope's, else the raw body, else
/// the status reason
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return envelope.message;
    }
    if !body.trim().is_empty() {
        return body.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("Request failed")
        .to_string()
}

fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::{FakeProvider, RecordingNavigator};
    use crate::auth::SessionSettings;
    use mockito::Matcher;
    use serde_json::{json, Value};

    fn session_with(provider: Arc<FakeProvider>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            provider,
            Arc::new(RecordingNavigator::default()),
            SessionSettings {
                automatic_silent_renew: false,
                ..Default::default()
            },
        ))
    }

    fn client_for(base_url: &str, provider: Arc<FakeProvider>) -> ApiClient {
        ApiClient::new(base_url, session_with(provider), None, None).unwrap()
    }

    #[test]
    fn test_url_join() {
        let client = client_for("http://backend.test/api/", Arc::new(FakeProvider::new()));
        assert_eq!(client.url("/scores"), "http://backend.test/api/scores");
        assert_eq!(client.url("scores/3"), "http://backend.test/api/scores/3");
    }

    #[test]
    fn test_error_message_fallbacks() {
        assert_eq!(
            error_message(StatusCode::UNAUTHORIZED, r#"{"message":"expired"}"#),
            "expired"
        );
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, "plain failure"),
            "plain failure"
        );
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, ""), "Bad Gateway");
    }

    #[tokio::test]
    async fn test_get_attaches_bearer_and_returns_envelope() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/scores")
            .match_header("authorization", "Bearer abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"ok","data":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server.url(), Arc::new(FakeProvider::signed_in("abc", 600)));
        let envelope: ResponseEnvelope<Vec<Value>> = client.get("scores").await.unwrap();

        assert_eq!(
            envelope,
            ResponseEnvelope {
                message: "ok".to_string(),
                data: vec![]
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthenticated_request_is_still_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/levels")
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .with_body(r#"{"message":"ok","data":{"count":2}}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server.url(), Arc::new(FakeProvider::new()));
        let envelope: ResponseEnvelope<Value> = client.get("/levels").await.unwrap();

        assert_eq!(envelope.data, json!({"count": 2}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_and_put_send_json() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({"gameId": "g1", "score": 1200});
        let post = server
            .mock("POST", "/scores")
            .match_header("content-type", "application/json")
            .match_header("authorization", "Bearer abc")
            .match_body(Matcher::Json(body.clone()))
            .with_status(201)
            .with_body(r#"{"message":"created","data":{"id":7}}"#)
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/scores/7")
            .match_body(Matcher::Json(body.clone()))
            .with_status(200)
            .with_body(r#"{"message":"updated","data":{"id":7}}"#)
            .create_async()
            .await;

        let client = client_for(&server.url(), Arc::new(FakeProvider::signed_in("abc", 600)));

        let created: ResponseEnvelope<Value> = client.post("scores", &body).await.unwrap();
        assert_eq!(created.message, "created");
        assert_eq!(created.data, json!({"id": 7}));

        let updated: ResponseEnvelope<Value> = client.put("scores/7", &body).await.unwrap();
        assert_eq!(updated.message, "updated");

        post.assert_async().await;
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_returns_unit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/scores/7")
            .match_header("content-type", Matcher::Missing)
            .with_status(200)
            .with_body(r#"{"message":"deleted","data":null}"#)
            .create_async()
            .await;

        let client = client_for(&server.url(), Arc::new(FakeProvider::signed_in("abc", 600)));
        client.delete("scores/7").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_terminates_session_once() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/scores")
            .with_status(401)
            .with_body(r#"{"message":"expired"}"#)
            .create_async()
            .await;

        let provider = Arc::new(FakeProvider::signed_in("abc", 600));
        let client = client_for(&server.url(), provider.clone());

        let err = client.get::<Value>("scores").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(err.to_string(), "expired");
        assert_eq!(provider.remove_calls(), 1);
        assert!(!client.session().is_authenticated().await);
    }

    #[tokio::test]
    async fn test_unauthorized_with_truncated_body_terminates_session() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            // Declares 100 bytes, sends 10, then hangs up
            socket
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 100\r\n\r\n{\"message\"")
                .await
                .unwrap();
            socket.shutdown().await.ok();
        });

        let provider = Arc::new(FakeProvider::signed_in("abc", 600));
        let client = client_for(&url, provider.clone());

        let err = client.get::<Value>("scores").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(provider.remove_calls(), 1);
        assert!(!client.session().is_authenticated().await);
    }

    #[tokio::test]
    async fn test_api_error_keeps_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/scores/7")
            .with_status(404)
            .with_body(r#"{"message":"Score not found"}"#)
            .create_async()
            .await;

        let provider = Arc::new(FakeProvider::signed_in("abc", 600));
        let client = client_for(&server.url(), provider.clone());

        let err = client.delete("scores/7").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.to_string(), "Score not found");
        assert_eq!(provider.remove_calls(), 0);
        assert!(client.session().is_authenticated().await);
    }

    #[tokio::test]
    async fn test_success_body_must_be_envelope() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/scores")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let client = client_for(&server.url(), Arc::new(FakeProvider::new()));
        let err = client.get::<Value>("scores").await.unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn test_network_error_is_propagated() {
        let client = client_for("http://127.0.0.1:1", Arc::new(FakeProvider::signed_in("abc", 600)));
        let err = client.get::<Value>("scores").await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
        assert!(client.session().is_authenticated().await);
    }
}
