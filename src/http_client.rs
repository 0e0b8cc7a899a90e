use anyhow::Context;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{redact, AuthManager};
use crate::error::ApiError;

/// HTTP client for protected provider calls
///
/// Attaches the current access token and recovers from a 401 by refreshing
/// once and replaying the request. Anything other than a 401 is returned
/// untouched.
pub struct AuthorizedClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Source of access tokens and refreshes
    auth_manager: Arc<AuthManager>,
}

impl AuthorizedClient {
    pub fn new(
        auth_manager: Arc<AuthManager>,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            auth_manager,
        })
    }

    /// Execute a protected request.
    ///
    /// At most two transport calls are made: the original and, after a
    /// successful refresh, one replay. A second 401, or a failed refresh,
    /// surfaces the original rejection.
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        let method = request.method().clone();
        let url = request.url().clone();

        let mut token = self.auth_manager.access_token();
        let mut rejection: Option<String> = None;

        loop {
            let retried = rejection.is_some();
            let mut req = request.try_clone().ok_or_else(|| {
                ApiError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;

            if let Some(ref t) = token {
                let value = HeaderValue::from_str(&format!("Bearer {}", t))
                    .context("Access token is not a valid header value")?;
                req.headers_mut().insert(AUTHORIZATION, value);
            }

            tracing::debug!(
                method = %method,
                url = %url,
                retried = retried,
                authenticated = token.is_some(),
                "Sending protected request"
            );

            let response = self.client.execute(req).await.map_err(|e| {
                tracing::warn!(
                    error = %e,
                    url = %url,
                    "Protected request failed to reach provider"
                );
                ApiError::Transport(e)
            })?;

            let status = response.status();
            if status != StatusCode::UNAUTHORIZED {
                tracing::debug!(status = %status, url = %url, "Received response");
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();

            if let Some(original) = rejection.take() {
                tracing::warn!(url = %url, "Still unauthorized after token refresh, giving up");
                return Err(ApiError::AuthError(original));
            }

            tracing::warn!(url = %url, "Received 401, refreshing token and retrying...");
            rejection = Some(if body.is_empty() {
                "Unauthorized".to_string()
            } else {
                body
            });

            // Someone else may have refreshed while this request was in flight
            let current = self.auth_manager.access_token();
            token = match current {
                Some(current) if token.as_deref() != Some(current.as_str()) => {
                    tracing::debug!(
                        "Token already replaced ({}), replaying without refresh",
                        redact(&current)
                    );
                    Some(current)
                }
                _ => match self.auth_manager.refresh().await {
                    Some(fresh) => Some(fresh),
                    None => {
                        tracing::warn!(url = %url, "Token refresh failed, surfacing 401");
                        return Err(ApiError::AuthError(rejection.unwrap_or_default()));
                    }
                },
            };
        }
    }

    /// Build and execute a protected request
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let request = builder.build()?;
        self.execute(request).await
    }

    /// Protected GET returning JSON; non-2xx becomes `ProviderError`
    pub async fn get_json(&self, url: reqwest::Url) -> Result<Value, ApiError> {
        let response = self.send(self.client.get(url)).await?;
        read_json(response).await
    }

    /// Protected POST with a JSON body returning JSON
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: reqwest::Url,
        body: &B,
    ) -> Result<Value, ApiError> {
        let response = self.send(self.client.post(url).json(body)).await?;
        read_json(response).await
    }
}

async fn read_json(response: Response) -> Result<Value, ApiError> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        tracing::error!(
            status = status.as_u16(),
            response_body = %text,
            "Protected request failed with error response"
        );
        return Err(ApiError::ProviderError {
            status: status.as_u16(),
            message: text,
        });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .context("Provider returned invalid JSON")
        .map_err(ApiError::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialPair, CredentialStore, IdentityProvider, Role, Session};
    use mockito::Matcher;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    fn manager(base_url: &str, access_token: Option<&str>) -> Arc<AuthManager> {
        let store = CredentialStore::open_in_memory().unwrap();
        if let Some(access_token) = access_token {
            store
                .save_login(
                    &Session {
                        id: "u-1".to_string(),
                        email: "p@example.com".to_string(),
                        display_name: "p".to_string(),
                        phone: None,
                        role: Role::Player,
                    },
                    &CredentialPair {
                        access_token: access_token.to_string(),
                        refresh_token: "refresh-1".to_string(),
                    },
                )
                .unwrap();
        }
        AuthManager::new(IdentityProvider::new(base_url, 5, 10).unwrap(), store)
    }

    fn gate(server: &mockito::ServerGuard, access_token: Option<&str>) -> AuthorizedClient {
        AuthorizedClient::new(manager(&server.url(), access_token), 5, 10).unwrap()
    }

    fn fields_url(server: &mockito::ServerGuard) -> reqwest::Url {
        reqwest::Url::parse(&format!("{}/api/Field", server.url())).unwrap()
    }

    fn refreshed(token: &str) -> String {
        json!({"isSuccess": true, "returnObject": {"accessToken": token}}).to_string()
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/Field")
            .match_header("authorization", "Bearer old-token")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let gate = gate(&server, Some("old-token"));
        let body = gate.get_json(fields_url(&server)).await.unwrap();
        assert_eq!(body, json!([]));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_sends_unauthenticated_without_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/Field")
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let gate = gate(&server, None);
        assert!(gate.get_json(fields_url(&server)).await.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_401_then_refresh_then_single_retry() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("GET", "/api/Field")
            .match_header("authorization", "Bearer old-token")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", "/api/Field")
            .match_header("authorization", "Bearer new-token")
            .with_status(200)
            .with_body(r#"[{"id":1}]"#)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/RefreshToken")
            .with_status(200)
            .with_body(refreshed("new-token"))
            .expect(1)
            .create_async()
            .await;

        let gate = gate(&server, Some("old-token"));
        let body = gate.get_json(fields_url(&server)).await.unwrap();
        assert_eq!(body[0]["id"], 1);

        rejected.assert_async().await;
        accepted.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_401_is_surfaced_without_looping() {
        let mut server = mockito::Server::new_async().await;
        let protected = server
            .mock("GET", "/api/Field")
            .with_status(401)
            .with_body("token expired")
            .expect(2)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/RefreshToken")
            .with_status(200)
            .with_body(refreshed("new-token"))
            .expect(1)
            .create_async()
            .await;

        let gate = gate(&server, Some("old-token"));
        let err = gate.get_json(fields_url(&server)).await.unwrap_err();
        match err {
            ApiError::AuthError(msg) => assert_eq!(msg, "token expired"),
            other => panic!("unexpected error: {:?}", other),
        }

        protected.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_refresh_surfaces_401_and_signs_out() {
        let mut server = mockito::Server::new_async().await;
        let protected = server
            .mock("GET", "/api/Field")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/RefreshToken")
            .with_status(400)
            .with_body("invalid refresh token")
            .create_async()
            .await;

        let manager = manager(&server.url(), Some("old-token"));
        let gate = AuthorizedClient::new(Arc::clone(&manager), 5, 10).unwrap();

        let err = gate.get_json(fields_url(&server)).await.unwrap_err();
        assert!(matches!(err, ApiError::AuthError(_)));
        assert!(!manager.is_authenticated());
        protected.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_auth_failures_pass_through() {
        let mut server = mockito::Server::new_async().await;
        let protected = server
            .mock("GET", "/api/Field")
            .with_status(503)
            .with_body("maintenance")
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/RefreshToken")
            .expect(0)
            .create_async()
            .await;

        let gate = gate(&server, Some("old-token"));
        let response = gate
            .send(Client::new().get(fields_url(&server)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        protected.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_provider_error_status_in_get_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/Field")
            .with_status(403)
            .with_body("not yours")
            .create_async()
            .await;

        let gate = gate(&server, Some("old-token"));
        match gate.get_json(fields_url(&server)).await.unwrap_err() {
            ApiError::ProviderError { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "not yours");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_json_replays_body_after_refresh() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/Booking")
            .match_header("authorization", "Bearer old-token")
            .with_status(401)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", "/api/Booking")
            .match_header("authorization", "Bearer new-token")
            .match_body(Matcher::Json(json!({"fieldId": 3})))
            .with_status(201)
            .with_body(r#"{"isSuccess":true}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/RefreshToken")
            .with_status(200)
            .with_body(refreshed("new-token"))
            .create_async()
            .await;

        let gate = gate(&server, Some("old-token"));
        let url = reqwest::Url::parse(&format!("{}/api/Booking", server.url())).unwrap();
        let body = gate.post_json(url, &json!({"fieldId": 3})).await.unwrap();
        assert_eq!(body["isSuccess"], true);
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_stale_token_is_replayed_without_refresh() {
        // Refresh endpoint lives on mockito; the protected endpoint is a raw
        // listener so its 401 can be held until the token has changed
        let mut provider = mockito::Server::new_async().await;
        let refresh = provider
            .mock("POST", "/RefreshToken")
            .with_status(200)
            .with_body(refreshed("new-token"))
            .expect(1)
            .create_async()
            .await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (first_tx, first_rx) = oneshot::channel::<String>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (replay_tx, replay_rx) = oneshot::channel::<String>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = first_tx.send(read_request(&mut stream).await);
            let _ = release_rx.await;
            stream
                .write_all(
                    b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            drop(stream);

            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = replay_tx.send(read_request(&mut stream).await);
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n[]",
                )
                .await
                .unwrap();
        });

        let manager = manager(&provider.url(), Some("old-token"));
        let gate = Arc::new(AuthorizedClient::new(Arc::clone(&manager), 5, 10).unwrap());
        let url = reqwest::Url::parse(&format!("http://{}/api/Field", addr)).unwrap();
        let call = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.get_json(url).await }
        });

        let first = first_rx.await.unwrap();
        assert!(first.contains("Bearer old-token"));

        // Another caller refreshes while the original request is still in flight
        assert_eq!(manager.refresh().await.as_deref(), Some("new-token"));
        release_tx.send(()).unwrap();

        let body = call.await.unwrap().unwrap();
        assert_eq!(body, json!([]));
        let replay = replay_rx.await.unwrap();
        assert!(replay.contains("Bearer new-token"));

        // Only the other caller's refresh reached the provider
        refresh.assert_async().await;
    }
}
