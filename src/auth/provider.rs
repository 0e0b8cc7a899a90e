// Identity provider HTTP client

use anyhow::{Context, Result};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::types::{
    redact, scalar_to_string, CredentialPair, Envelope, LoginGrant, LoginOutcome, LoginPayload,
    LoginRequest, RefreshGrant, RefreshPayload, RefreshRequest, RegisterRequest, Role,
    VerifyEmailRequest,
};

const REGISTER_PATH: &str = "/api/Authentication/register";
const LOGIN_PATH: &str = "/api/Authentication/login";
const ROLE_PATH: &str = "/api/Token/GetRole";
const REFRESH_PATH: &str = "/RefreshToken";
const VERIFY_EMAIL_PATH: &str = "/api/Authentication/verify-email";
const CONFIRM_REGISTER_PATH: &str = "/api/Authentication/confirmRegister";

/// Client for the identity provider's authentication endpoints
#[derive(Clone)]
pub struct IdentityProvider {
    client: Client,
    base_url: Url,
}

impl IdentityProvider {
    /// Create a provider client rooted at `base_url`
    pub fn new(base_url: &str, connect_timeout: u64, request_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid provider URL: {}", base_url))?;

        Ok(Self { client, base_url })
    }

    /// Absolute URL for a provider path
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Failed to build provider URL for {}", path))
    }

    /// Register a new account. The provider emails a confirmation link;
    /// no session is established here.
    pub async fn register(&self, form: &RegisterRequest) -> Result<()> {
        tracing::info!("Registering account for {}", form.email);

        let response = self
            .client
            .post(self.url(REGISTER_PATH)?)
            .json(form)
            .send()
            .await
            .context("Failed to send register request")?;

        let envelope: Envelope<serde_json::Value> =
            read_envelope(response, "register").await?;
        if !envelope.is_success {
            anyhow::bail!(
                "Provider rejected registration: {}",
                envelope.message.unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Exchange email + password for a credential pair.
    ///
    /// A clean answer without usable tokens is `LoginOutcome::Rejected`;
    /// transport failures and error statuses are `Err`.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        tracing::info!("Signing in {}", email);

        let response = self
            .client
            .post(self.url(LOGIN_PATH)?)
            .json(&LoginRequest { email, password })
            .send()
            .await
            .context("Failed to send login request")?;

        let envelope: Envelope<LoginPayload> = read_envelope(response, "login").await?;
        if !envelope.is_success {
            return Ok(LoginOutcome::Rejected(format!(
                "Provider rejected login: {}",
                envelope.message.unwrap_or_default()
            )));
        }

        let Some(payload) = envelope.return_object else {
            return Ok(LoginOutcome::Rejected(
                "Login response does not contain returnObject".to_string(),
            ));
        };

        let (access_token, refresh_token) = match (payload.access_token, payload.refresh_token) {
            (Some(a), Some(r)) if !a.is_empty() && !r.is_empty() => (a, r),
            _ => {
                return Ok(LoginOutcome::Rejected(
                    "Login response does not contain both accessToken and refreshToken"
                        .to_string(),
                ))
            }
        };

        Ok(LoginOutcome::Granted(LoginGrant {
            credentials: CredentialPair {
                access_token,
                refresh_token,
            },
            user_id: payload.id.as_ref().and_then(scalar_to_string),
            name: payload.name.filter(|n| !n.is_empty()),
            phone: payload.phone_number.as_ref().and_then(scalar_to_string),
        }))
    }

    /// Look up the role of the account owning `access_token`
    pub async fn role(&self, access_token: &str) -> Result<Role> {
        tracing::debug!("Looking up role (token: {})", redact(access_token));

        let response = self
            .client
            .get(self.url(ROLE_PATH)?)
            .bearer_auth(access_token)
            .send()
            .await
            .context("Failed to send role request")?;

        let envelope: Envelope<String> = read_envelope(response, "role").await?;
        if !envelope.is_success {
            anyhow::bail!(
                "Provider refused role lookup: {}",
                envelope.message.unwrap_or_default()
            );
        }

        let raw = envelope
            .return_object
            .filter(|r| !r.trim().is_empty())
            .context("Role response does not contain a role")?;

        let role = Role::from_provider(&raw);
        tracing::debug!("Provider role {:?} normalized to {:?}", raw, role);
        Ok(role)
    }

    /// Mint a new access token from a refresh token
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant> {
        tracing::info!("Refreshing access token...");

        let response = self
            .client
            .post(self.url(REFRESH_PATH)?)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .context("Failed to send refresh request")?;

        let envelope: Envelope<RefreshPayload> = read_envelope(response, "refresh").await?;
        let payload = envelope
            .return_object
            .context("Refresh response does not contain returnObject")?;

        let access_token = payload
            .access_token
            .filter(|t| !t.is_empty())
            .context("Refresh response does not contain accessToken")?;

        Ok(RefreshGrant {
            access_token,
            refresh_token: payload.refresh_token.filter(|t| !t.is_empty()),
        })
    }

    /// Activate an account with the token from the verification email
    pub async fn verify_email(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(VERIFY_EMAIL_PATH)?)
            .json(&VerifyEmailRequest { token })
            .send()
            .await
            .context("Failed to send verify-email request")?;

        ensure_success(response, "verify-email").await
    }

    /// Confirm a registration through the link's query token
    pub async fn confirm_register(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .get(self.url(CONFIRM_REGISTER_PATH)?)
            .query(&[("token", token)])
            .send()
            .await
            .context("Failed to send confirm-register request")?;

        ensure_success(response, "confirm-register").await
    }
}

async fn ensure_success(response: Response, endpoint: &str) -> Result<()> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Provider {} failed: {} - {}", endpoint, status, error_text);
    }
    Ok(())
}

async fn read_envelope<T: DeserializeOwned>(response: Response, endpoint: &str) -> Result<Envelope<T>> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::warn!(
            endpoint = endpoint,
            status = %status,
            body = %error_text,
            "Provider returned an error status"
        );
        anyhow::bail!("Provider {} failed: {} - {}", endpoint, status, error_text);
    }

    response
        .json()
        .await
        .with_context(|| format!("Failed to parse provider {} response", endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn provider(server: &mockito::ServerGuard) -> IdentityProvider {
        IdentityProvider::new(&server.url(), 5, 10).unwrap()
    }

    #[tokio::test]
    async fn test_login_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", LOGIN_PATH)
            .match_body(Matcher::Json(json!({"email": "a@b.vn", "password": "pw"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "isSuccess": true,
                    "returnObject": {
                        "accessToken": "acc",
                        "refreshToken": "ref",
                        "id": 12,
                        "name": "An",
                        "phoneNumber": 901234567
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let grant = match provider(&server).login("a@b.vn", "pw").await.unwrap() {
            LoginOutcome::Granted(grant) => grant,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(grant.credentials.access_token, "acc");
        assert_eq!(grant.credentials.refresh_token, "ref");
        assert_eq!(grant.user_id.as_deref(), Some("12"));
        assert_eq!(grant.name.as_deref(), Some("An"));
        assert_eq!(grant.phone.as_deref(), Some("901234567"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_missing_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", LOGIN_PATH)
            .with_status(200)
            .with_body(json!({"isSuccess": true, "returnObject": {"accessToken": "acc"}}).to_string())
            .create_async()
            .await;

        match provider(&server).login("a@b.vn", "pw").await.unwrap() {
            LoginOutcome::Rejected(reason) => assert!(reason.contains("refreshToken")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", LOGIN_PATH)
            .with_status(200)
            .with_body(json!({"isSuccess": false, "message": "Wrong password"}).to_string())
            .create_async()
            .await;

        match provider(&server).login("a@b.vn", "bad").await.unwrap() {
            LoginOutcome::Rejected(reason) => assert!(reason.contains("Wrong password")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", LOGIN_PATH)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let err = provider(&server).login("a@b.vn", "pw").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_role_lookup_sends_bearer_and_normalizes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", ROLE_PATH)
            .match_header("authorization", "Bearer acc")
            .with_status(200)
            .with_body(json!({"isSuccess": true, "returnObject": "Staff"}).to_string())
            .create_async()
            .await;

        assert_eq!(provider(&server).role("acc").await.unwrap(), Role::Owner);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_role_lookup_unknown_value_is_player() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", ROLE_PATH)
            .with_status(200)
            .with_body(json!({"isSuccess": true, "returnObject": "Moderator"}).to_string())
            .create_async()
            .await;

        assert_eq!(provider(&server).role("acc").await.unwrap(), Role::Player);
    }

    #[tokio::test]
    async fn test_role_lookup_null_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", ROLE_PATH)
            .with_status(200)
            .with_body(json!({"isSuccess": true, "returnObject": null}).to_string())
            .create_async()
            .await;

        assert!(provider(&server).role("acc").await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_success_with_rotation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", REFRESH_PATH)
            .match_body(Matcher::Json(json!({"refreshToken": "ref"})))
            .with_status(200)
            .with_body(
                json!({"isSuccess": true, "returnObject": {"accessToken": "new", "refreshToken": "ref2"}})
                    .to_string(),
            )
            .create_async()
            .await;

        let grant = provider(&server).refresh("ref").await.unwrap();
        assert_eq!(grant.access_token, "new");
        assert_eq!(grant.refresh_token.as_deref(), Some("ref2"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_without_token_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", REFRESH_PATH)
            .with_status(200)
            .with_body(json!({"isSuccess": true, "returnObject": {}}).to_string())
            .create_async()
            .await;

        let err = provider(&server).refresh("ref").await.unwrap_err();
        assert!(err.to_string().contains("accessToken"));
    }

    #[tokio::test]
    async fn test_register() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", REGISTER_PATH)
            .match_body(Matcher::PartialJson(json!({"fullName": "Nguyen An", "phoneNumber": "0901"})))
            .with_status(200)
            .with_body(json!({"isSuccess": true}).to_string())
            .create_async()
            .await;

        let form = RegisterRequest {
            full_name: "Nguyen An".to_string(),
            email: "an@example.com".to_string(),
            password: "secret".to_string(),
            phone_number: "0901".to_string(),
            confirm_password: "secret".to_string(),
        };
        assert!(provider(&server).register(&form).await.is_ok());
    }

    #[tokio::test]
    async fn test_confirm_register_passes_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", CONFIRM_REGISTER_PATH)
            .match_query(Matcher::UrlEncoded("token".into(), "abc123".into()))
            .with_status(200)
            .create_async()
            .await;

        assert!(provider(&server).confirm_register("abc123").await.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_verify_email_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", VERIFY_EMAIL_PATH)
            .with_status(400)
            .with_body("expired")
            .create_async()
            .await;

        assert!(provider(&server).verify_email("old").await.is_err());
    }
}
