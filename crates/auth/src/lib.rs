//! Auth client for the placement backend
//!
//! Password sign-in, the current session, token refresh, sign-out, and a
//! broadcast stream of auth-state changes that views use to react to sign-in and sign-out.

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing session")]
    MissingSession,
}

/// Authenticated identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub app_metadata: serde_json::Value,
    #[serde(default)]
    pub user_metadata: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    /// Unix timestamp; filled in from `expires_in` when the server omits it
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub token_type: String,
    pub user: User,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_within(0)
    }

    /// True when the access token expires in `seconds` or less
    pub fn expires_within(&self, seconds: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => unix_now() + seconds >= expires_at,
            None => false,
        }
    }

    fn stamped(mut self) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = Some(unix_now() + self.expires_in);
        }
        self
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Auth-state change delivered to every subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum AuthChangeEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Buffered auth events per subscriber before lagging ones drop events
    pub event_capacity: usize,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            event_capacity: 16,
        }
    }
}

pub struct Auth {
    url: String,
    key: String,
    http_client: Client,
    current_session: Arc<RwLock<Option<Session>>>,
    events: broadcast::Sender<AuthChangeEvent>,
}

impl Auth {
    pub fn new(url: &str, key: &str, http_client: Client, options: AuthOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            http_client,
            current_session: Arc::new(RwLock::new(None)),
            events,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.url, path)
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.current_session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.current_session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: AuthChangeEvent) {
        // No receivers is fine: nobody is watching auth state yet.
        let _ = self.events.send(event);
    }

    /// Subscribe to sign-in / sign-out / refresh notifications
    pub fn on_auth_state_change(&self) -> broadcast::Receiver<AuthChangeEvent> {
        self.events.subscribe()
    }

    /// Sign in with email and password
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let url = self.endpoint("/token?grant_type=password");
        debug!(%email, "signing in with password");

        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let session = self.store(parse_session(response).await?);
        info!(user_id = %session.user.id, "signed in");
        self.emit(AuthChangeEvent::SignedIn(session.clone()));
        Ok(session)
    }

    /// The current session, if any
    pub fn get_session(&self) -> Option<Session> {
        self.read_session().clone()
    }

    /// Install an externally obtained session (restored from storage, tests)
    pub fn set_session(&self, session: Session) {
        let session = self.store(session);
        self.emit(AuthChangeEvent::SignedIn(session));
    }

    fn store(&self, session: Session) -> Session {
        let session = session.stamped();
        *self.write_session() = Some(session.clone());
        session
    }

    /// Access token of the current session
    pub fn access_token(&self) -> Option<String> {
        self.read_session().as_ref().map(|s| s.access_token.clone())
    }

    /// Exchange the refresh token for a new session
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let refresh_token = self
            .read_session()
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or(AuthError::MissingSession)?;
        let url = self.endpoint("/token?grant_type=refresh_token");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let session = self.store(parse_session(response).await?);
        debug!(user_id = %session.user.id, "session refreshed");
        self.emit(AuthChangeEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    /// Sign out. The local session is cleared and `SignedOut` emitted even if
    /// the server rejects the logout call; that error is still returned.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let token = self.access_token().ok_or(AuthError::MissingSession)?;
        let url = self.endpoint("/logout");

        let result = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await;

        *self.write_session() = None;
        self.emit(AuthChangeEvent::SignedOut);
        info!("signed out");

        let response = result?;
        if !response.status().is_success() {
            let message = response.text().await?;
            warn!(%message, "server rejected logout");
            return Err(AuthError::ApiError(message));
        }
        Ok(())
    }
}

async fn parse_session(response: Response) -> Result<Session, AuthError> {
    if !response.status().is_success() {
        return Err(AuthError::ApiError(response.text().await?));
    }
    Ok(response.json::<Session>().await?)
}
