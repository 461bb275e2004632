//! Supabase (GoTrue) identity provider
//!
//! Talks to the `/auth/v1` REST endpoints directly. The provider keeps the
//! session it last issued or adopted, which is what `get_session` and
//! `sign_out` act on. The browser leg of OAuth is delegated to an
//! `OAuthRedirect`.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

use tabsync_session::{AuthError, AuthSession, Credentials, IdentityProvider, Session, User};
use tabsync_storage::Clock;

use crate::error::CoreError;
use crate::Result;

/// Tokens handed back on the OAuth callback.
#[derive(Clone, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds
    pub expires_in: i64,
}

#[async_trait]
pub trait OAuthRedirect: Send + Sync {
    /// Send the user to `authorize_url` and wait for the callback.
    async fn complete(&self, authorize_url: Url) -> std::result::Result<OAuthTokens, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: serde_json::Value,
}

impl From<UserResponse> for User {
    fn from(user: UserResponse) -> Self {
        User {
            id: user.id,
            email: user.email,
            metadata: user.user_metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    error_code: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

pub struct SupabaseProvider {
    http_client: reqwest::Client,
    api_url: Url,
    anon_key: String,
    clock: Clock,
    current: RwLock<Option<AuthSession>>,
    oauth: Option<Arc<dyn OAuthRedirect>>,
}

impl SupabaseProvider {
    /// `api_url` is the project URL, e.g. `https://xyz.supabase.co`.
    pub fn new(api_url: &str, anon_key: impl Into<String>, clock: Clock) -> Result<Self> {
        let mut api_url = Url::parse(api_url)
            .map_err(|e| CoreError::Config(format!("invalid api url {}: {}", api_url, e)))?;
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }

        Ok(Self {
            http_client: reqwest::Client::new(),
            api_url,
            anon_key: anon_key.into(),
            clock,
            current: RwLock::new(None),
            oauth: None,
        })
    }

    pub fn with_oauth(mut self, redirect: Arc<dyn OAuthRedirect>) -> Self {
        self.oauth = Some(redirect);
        self
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, AuthError> {
        self.api_url
            .join(path)
            .map_err(|e| AuthError::provider(format!("invalid endpoint {}: {}", path, e)))
    }

    fn authorize_url(&self, provider_name: &str) -> std::result::Result<Url, AuthError> {
        let mut url = self.endpoint("auth/v1/authorize")?;
        url.query_pairs_mut().append_pair("provider", provider_name);
        Ok(url)
    }

    fn into_auth_session(&self, tokens: TokenResponse) -> AuthSession {
        let session = Session {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: self.clock.now() + chrono::Duration::seconds(tokens.expires_in),
        };
        AuthSession::new(session, tokens.user.into())
    }

    fn remember(&self, auth: &AuthSession) {
        *self.current.write() = Some(auth.clone());
    }

    async fn token_grant(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> std::result::Result<AuthSession, AuthError> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);

        tracing::debug!(grant_type, "Requesting token");

        let response = self
            .http_client
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await?;
        let tokens: TokenResponse = response.json().await.map_err(transport_error)?;
        let auth = self.into_auth_session(tokens);
        self.remember(&auth);
        Ok(auth)
    }

    async fn fetch_user(&self, access_token: &str) -> std::result::Result<User, AuthError> {
        let response = self
            .http_client
            .get(self.endpoint("auth/v1/user")?)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await?;
        let user: UserResponse = response.json().await.map_err(transport_error)?;
        Ok(user.into())
    }
}

#[async_trait]
impl IdentityProvider for SupabaseProvider {
    /// Verifies the remembered session against `/auth/v1/user`.
    async fn get_session(&self) -> std::result::Result<Option<AuthSession>, AuthError> {
        let Some(current) = self.current.read().clone() else {
            return Ok(None);
        };
        if current.session.is_expired_at(self.clock.now()) {
            return Ok(None);
        }

        match self.fetch_user(&current.session.access_token).await {
            Ok(user) => {
                let verified = AuthSession::new(current.session, user);
                self.remember(&verified);
                Ok(Some(verified))
            }
            Err(e) if e.kind == tabsync_session::AuthErrorKind::InvalidCredentials => {
                tracing::info!(error = %e, "Server rejected remembered session");
                *self.current.write() = None;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_in_with_password(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<AuthSession, AuthError> {
        self.token_grant(
            "password",
            serde_json::json!({
                "email": credentials.email,
                "password": credentials.password,
            }),
        )
        .await
    }

    async fn sign_up(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<Option<AuthSession>, AuthError> {
        let response = self
            .http_client
            .post(self.endpoint("auth/v1/signup")?)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": credentials.email,
                "password": credentials.password,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await?;
        let body: serde_json::Value = response.json().await.map_err(transport_error)?;
        let issued = parse_sign_up(body)?.map(|tokens| self.into_auth_session(tokens));
        if let Some(auth) = &issued {
            self.remember(auth);
        }
        Ok(issued)
    }

    async fn sign_in_with_oauth(
        &self,
        provider_name: &str,
    ) -> std::result::Result<AuthSession, AuthError> {
        let redirect = self
            .oauth
            .as_ref()
            .ok_or_else(|| AuthError::provider("OAuth sign-in is not configured"))?;

        let tokens = redirect.complete(self.authorize_url(provider_name)?).await?;
        let user = self.fetch_user(&tokens.access_token).await?;

        let auth = AuthSession::new(
            Session {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
                expires_at: self.clock.now() + chrono::Duration::seconds(tokens.expires_in),
            },
            user,
        );
        self.remember(&auth);
        Ok(auth)
    }

    async fn sign_out(&self) -> std::result::Result<(), AuthError> {
        let Some(current) = self.current.write().take() else {
            return Ok(());
        };

        let response = self
            .http_client
            .post(self.endpoint("auth/v1/logout")?)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", current.session.access_token))
            .send()
            .await
            .map_err(transport_error)?;

        // Already revoked server-side
        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND) {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    async fn renew_session(
        &self,
        current: &Session,
    ) -> std::result::Result<AuthSession, AuthError> {
        self.token_grant(
            "refresh_token",
            serde_json::json!({ "refresh_token": current.refresh_token }),
        )
        .await
    }

    fn session_changed(&self, session: Option<&AuthSession>) {
        *self.current.write() = session.cloned();
    }
}

fn transport_error(error: reqwest::Error) -> AuthError {
    if error.is_decode() {
        AuthError::provider(format!("unexpected response: {}", error))
    } else {
        AuthError::network(error.to_string())
    }
}

async fn check_status(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let error = classify_status(status, &body);
    tracing::warn!(status = %status, kind = %error.kind, "Identity provider request failed");
    Err(error)
}

fn classify_status(status: StatusCode, body: &str) -> AuthError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .error_description
        .clone()
        .or_else(|| parsed.msg.clone())
        .or_else(|| parsed.message.clone())
        .unwrap_or_else(|| format!("HTTP {}", status));

    let rejected_grant = parsed.error.as_deref() == Some("invalid_grant")
        || matches!(
            parsed.error_code.as_deref(),
            Some("invalid_credentials" | "refresh_token_not_found" | "refresh_token_already_used")
        );

    match status {
        StatusCode::UNAUTHORIZED => AuthError::invalid_credentials(message),
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN if rejected_grant => {
            AuthError::invalid_credentials(message)
        }
        StatusCode::TOO_MANY_REQUESTS => AuthError::network(message),
        s if s.is_server_error() => AuthError::network(message),
        _ => AuthError::provider(message),
    }
}

/// A sign-up answers with a full token response, or with just the user
/// while confirmation is pending.
fn parse_sign_up(
    body: serde_json::Value,
) -> std::result::Result<Option<TokenResponse>, AuthError> {
    if body.get("access_token").is_none() {
        return Ok(None);
    }
    serde_json::from_value(body)
        .map(Some)
        .map_err(|e| AuthError::provider(format!("unexpected sign-up response: {}", e)))
}
