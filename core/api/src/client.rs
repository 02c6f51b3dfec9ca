//! Metadata-service client.

use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use studiosync_common::{ClientUpdate, Error, Lock, Project, Result, Song};

/// Default production control-API base.
pub const DEFAULT_API_BASE: &str = "https://api.studiosync.app/api/v1/";

/// Target of a lock or unlock request.
///
/// Song locks are submitted against the containing project with the song id
/// in the payload.
#[derive(Debug, Clone, Copy)]
pub enum LockTarget {
    Project(i64),
    Song { project: i64, song: i64 },
}

impl LockTarget {
    fn project_id(&self) -> i64 {
        match self {
            LockTarget::Project(id) => *id,
            LockTarget::Song { project, .. } => *project,
        }
    }

    fn song_id(&self) -> Option<i64> {
        match self {
            LockTarget::Project(_) => None,
            LockTarget::Song { song, .. } => Some(*song),
        }
    }
}

/// Options for a lock request.
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Steal the lock from its current holder.
    pub force: bool,
    /// Human-readable reason shown to other clients.
    pub reason: Option<String>,
    /// Checkout expiry; absent for sync-duration locks.
    pub until: Option<DateTime<Utc>>,
}

impl LockOptions {
    pub fn reason(reason: &str) -> Self {
        Self { reason: Some(reason.to_string()), ..Self::default() }
    }

    pub fn forced() -> Self {
        Self { force: true, ..Self::default() }
    }
}

/// Object-store credentials vended by the control API.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendCredentials {
    pub access: String,
    pub secret: String,
    pub bucket: String,
    pub audio_bucket: String,
}

#[derive(Debug, Clone)]
struct TokenPair {
    access: String,
    refresh: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: String,
    refresh: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    username: String,
}

/// Paginated list response; `next` carries the follow-up URL.
#[derive(Debug, Deserialize)]
struct PageResponse<T> {
    results: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncReceipt<'a> {
    project: i64,
    songs: &'a [i64],
}

/// Token-bearing client for the control API.
pub struct MetadataClient {
    http: Client,
    base: String,
    tokens: RwLock<Option<TokenPair>>,
    username: RwLock<Option<String>>,
}

impl MetadataClient {
    /// Create a client against `base`, seeding tokens if the store has any.
    pub fn new(base: impl Into<String>, access: Option<String>, refresh: Option<String>) -> Self {
        let http = Client::builder()
            .user_agent(concat!("studiosync/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");

        let tokens = match (access, refresh) {
            (Some(access), Some(refresh)) => Some(TokenPair { access, refresh }),
            _ => None,
        };

        Self {
            http,
            base: base.into(),
            tokens: RwLock::new(tokens),
            username: RwLock::new(None),
        }
    }

    /// Whether a token pair is loaded.
    pub async fn has_tokens(&self) -> bool {
        self.tokens.read().await.is_some()
    }

    /// Replace the token pair (web login flow handoff).
    pub async fn set_tokens(&self, access: String, refresh: String) {
        *self.tokens.write().await = Some(TokenPair { access, refresh });
        // A new identity may be behind the new tokens.
        *self.username.write().await = None;
    }

    /// Current token pair, for persisting to the store.
    pub async fn token_pair(&self) -> Option<(String, String)> {
        self.tokens.read().await.as_ref().map(|t| (t.access.clone(), t.refresh.clone()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn bearer(&self) -> Result<String> {
        let tokens = self.tokens.read().await;
        let pair = tokens
            .as_ref()
            .ok_or_else(|| Error::Unauthenticated("no tokens loaded".to_string()))?;
        Ok(format!("Bearer {}", pair.access))
    }

    /// Issue one request with the transport policy applied: on 403 refresh
    /// the access token and retry exactly once; at most two attempts.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let url = self.url(path);
        for attempt in 0..2 {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(header::AUTHORIZATION, self.bearer().await?);
            if let Some(json) = body {
                request = request.json(json);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Transport(format!("{} {}: {}", method, url, e)))?;

            match response.status() {
                StatusCode::FORBIDDEN if attempt == 0 => {
                    debug!(%url, "access token rejected, refreshing");
                    self.refresh().await?;
                }
                status => return Self::handle_response(status, response).await,
            }
        }
        unreachable!("request loop always returns on the second attempt")
    }

    async fn handle_response<T: DeserializeOwned>(
        status: StatusCode,
        response: reqwest::Response,
    ) -> Result<T> {
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::Serialization(format!("bad API response: {}", e)));
        }
        let message = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED => {
                Err(Error::Unauthenticated("access token rejected".to_string()))
            }
            StatusCode::NOT_FOUND => Err(Error::NotFound(message)),
            _ => Err(Error::Api { status: status.as_u16(), message }),
        }
    }

    // ---- auth -----------------------------------------------------------

    /// Exchange credentials for a token pair.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url("auth/login/"))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("login: {}", e)))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthenticated("bad credentials".to_string()));
        }
        let login: LoginResponse = Self::handle_response(response.status(), response).await?;
        self.set_tokens(login.access, login.refresh).await;
        info!(username, "logged in");
        Ok(())
    }

    /// Refresh the access token using the stored refresh token.
    ///
    /// # Errors
    /// - `Unauthenticated` when the refresh token itself is rejected; the
    ///   user must log in again.
    pub async fn refresh(&self) -> Result<()> {
        let refresh = {
            let tokens = self.tokens.read().await;
            tokens
                .as_ref()
                .map(|t| t.refresh.clone())
                .ok_or_else(|| Error::Unauthenticated("no refresh token".to_string()))?
        };

        let response = self
            .http
            .post(self.url("auth/refresh/"))
            .json(&serde_json::json!({ "refresh": refresh }))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("token refresh: {}", e)))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthenticated("refresh token rejected".to_string()));
        }
        let refreshed: RefreshResponse = Self::handle_response(response.status(), response).await?;

        let mut tokens = self.tokens.write().await;
        if let Some(pair) = tokens.as_mut() {
            pair.access = refreshed.access;
        }
        Ok(())
    }

    /// The logged-in username, fetched lazily and cached.
    pub async fn who_am_i(&self) -> Result<String> {
        if let Some(name) = self.username.read().await.clone() {
            return Ok(name);
        }
        let me: WhoAmIResponse = self.request(Method::GET, "users/me/", None).await?;
        *self.username.write().await = Some(me.username.clone());
        Ok(me.username)
    }

    // ---- projects and locks ---------------------------------------------

    /// All projects visible to this user.
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut all = Vec::new();
        let mut path = "projects/".to_string();
        loop {
            let page: PageResponse<Project> = self.request(Method::GET, &path, None).await?;
            all.extend(page.results);
            match page.next {
                // The service hands back absolute URLs; keep only the
                // path-and-query part relative to the base.
                Some(next) => path = next.trim_start_matches(&self.base).to_string(),
                None => break,
            }
        }
        Ok(all)
    }

    pub async fn get_project(&self, id: i64) -> Result<Project> {
        self.request(Method::GET, &format!("projects/{}/", id), None).await
    }

    /// Fetch one song's current record (revision, lock state, flags).
    pub async fn get_song(&self, id: i64) -> Result<Song> {
        self.request(Method::GET, &format!("songs/{}/", id), None).await
    }

    /// Request a cooperative lock on a project or song.
    pub async fn lock(&self, target: LockTarget, options: &LockOptions) -> Result<Lock> {
        let mut payload = serde_json::json!({});
        if options.force {
            payload["force"] = serde_json::json!(true);
        }
        if let Some(reason) = &options.reason {
            payload["reason"] = serde_json::json!(reason);
        }
        if let Some(until) = &options.until {
            payload["until"] = serde_json::json!(until.to_rfc3339());
        }
        if let Some(song) = target.song_id() {
            payload["song"] = serde_json::json!(song);
        }

        self.request(
            Method::PUT,
            &format!("projects/{}/lock/", target.project_id()),
            Some(&payload),
        )
        .await
    }

    /// Release a cooperative lock.
    pub async fn unlock(&self, target: LockTarget, force: bool) -> Result<Lock> {
        let mut payload = serde_json::json!({});
        if force {
            payload["force"] = serde_json::json!(true);
        }
        if let Some(song) = target.song_id() {
            payload["song"] = serde_json::json!(song);
        }

        self.request(
            Method::DELETE,
            &format!("projects/{}/lock/", target.project_id()),
            Some(&payload),
        )
        .await
    }

    // ---- receipts -------------------------------------------------------

    /// Record that the listed songs were pushed in this run.
    pub async fn record_sync(&self, project: i64, songs: &[i64]) -> Result<()> {
        let receipt = SyncReceipt { project, songs };
        let _: serde_json::Value = self
            .request(Method::POST, "syncs/", Some(&serde_json::to_value(&receipt)?))
            .await?;
        Ok(())
    }

    /// Record an audio-bucket upload from the watcher.
    pub async fn record_audio_sync(&self, project_name: &str, file_name: &str) -> Result<()> {
        let payload = serde_json::json!({ "project": project_name, "file": file_name });
        let _: serde_json::Value =
            self.request(Method::POST, "syncs/audio/", Some(&payload)).await?;
        Ok(())
    }

    // ---- updates and support --------------------------------------------

    /// Available client builds for a host tag such as `x86_64-windows`.
    pub async fn list_client_updates(&self, target: &str) -> Result<Vec<ClientUpdate>> {
        let page: PageResponse<ClientUpdate> = self
            .request(Method::GET, &format!("updates/?target={}", target), None)
            .await?;
        Ok(page.results)
    }

    /// Object-store credentials for the transfer layer.
    pub async fn get_object_store_credentials(&self) -> Result<BackendCredentials> {
        self.request(Method::GET, "backend_creds/", None).await
    }

    /// Upload a zipped log archive for support.
    pub async fn upload_logs(&self, file_name: &str, archive: Vec<u8>) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(archive)
            .file_name(file_name.to_string())
            .mime_str("application/zip")
            .map_err(|e| Error::InvalidInput(format!("log archive: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("log", part);

        let response = self
            .http
            .post(self.url("logs/"))
            .header(header::AUTHORIZATION, self.bearer().await?)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("log upload: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            warn!(%status, "log upload rejected");
            return Err(Error::Api { status: status.as_u16(), message });
        }
        Ok(())
    }
}
