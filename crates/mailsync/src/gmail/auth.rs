//! Access-token refresh for Gmail API calls
//!
//! Tokens are obtained out of band by the authorization flow and saved in a
//! [`CredentialStore`]. This module only keeps them fresh: a stored token is
//! used until five minutes before expiry, then exchanged with its refresh
//! token. A user without a refresh token gets `SyncError::Auth`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::GmailCredentials;
use crate::error::SyncError;
use crate::models::UserId;

/// Seconds before expiry at which a token is treated as stale
const EXPIRY_BUFFER_SECS: i64 = 300;

/// Token data persisted per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds
    pub expires_at: Option<i64>,
}

impl StoredToken {
    /// Token is usable for at least the expiry buffer
    pub fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > chrono::Utc::now().timestamp() + EXPIRY_BUFFER_SECS,
            None => false,
        }
    }
}

/// Persistence for per-user OAuth tokens
pub trait CredentialStore: Send + Sync {
    fn load(&self, user_id: &UserId) -> Result<Option<StoredToken>>;
    fn save(&self, user_id: &UserId, token: &StoredToken) -> Result<()>;
}

/// Stores each user's token as JSON in a directory
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `<config dir>/tokens/`
    pub fn in_config_dir() -> Result<Self> {
        let dir = config::config_path("tokens").context("Could not determine config directory")?;
        Ok(Self::new(dir))
    }

    fn token_path(&self, user_id: &UserId) -> PathBuf {
        self.dir
            .join(format!("{}.json", urlencoding::encode(user_id.as_str())))
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, user_id: &UserId) -> Result<Option<StoredToken>> {
        let path = self.token_path(user_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read token file {}", path.display()))?;
        let token = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse token file {}", path.display()))?;
        Ok(Some(token))
    }

    fn save(&self, user_id: &UserId, token: &StoredToken) -> Result<()> {
        config::save_json_file(&self.token_path(user_id), token)
    }
}

/// Token response from Google
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Keeps per-user access tokens fresh
pub struct GmailAuth {
    credentials: GmailCredentials,
    store: Arc<dyn CredentialStore>,
    /// Serializes refreshes so concurrent workers do not race the token endpoint
    refresh_lock: Mutex<()>,
}

impl GmailAuth {
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    pub fn new(credentials: GmailCredentials, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            store,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Get a valid access token for `user_id`, refreshing when stale
    pub fn access_token(&self, user_id: &UserId) -> Result<String> {
        let token = self.load_required(user_id)?;
        if token.is_fresh() {
            return Ok(token.access_token);
        }
        self.refresh(user_id, false)
    }

    /// Refresh regardless of the stored expiry (after a 401)
    pub fn force_refresh(&self, user_id: &UserId) -> Result<String> {
        self.refresh(user_id, true)
    }

    /// Whether a token exists that can be used or refreshed
    pub fn is_authorized(&self, user_id: &UserId) -> bool {
        matches!(
            self.store.load(user_id),
            Ok(Some(token)) if token.is_fresh() || token.refresh_token.is_some()
        )
    }

    fn refresh(&self, user_id: &UserId, force: bool) -> Result<String> {
        let _guard = self.refresh_lock.lock().unwrap();

        // Another worker may have refreshed while we waited
        let token = self.load_required(user_id)?;
        if !force && token.is_fresh() {
            return Ok(token.access_token);
        }

        let refresh_token = token.refresh_token.clone().ok_or_else(|| {
            SyncError::Auth(format!("no refresh credential for user {}", user_id))
        })?;

        log::debug!("[GMAIL] Refreshing access token for user {}", user_id);
        let response = self.refresh_access_token(&refresh_token)?;

        let stored = StoredToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(Some(refresh_token)),
            expires_at: response
                .expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs as i64),
        };
        self.store.save(user_id, &stored)?;
        Ok(stored.access_token)
    }

    fn load_required(&self, user_id: &UserId) -> Result<StoredToken> {
        self.store.load(user_id)?.ok_or_else(|| {
            SyncError::Auth(format!("no stored credentials for user {}", user_id)).into()
        })
    }

    /// Exchange a refresh token for a new access token
    fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenResponse, SyncError> {
        let response = ureq::post(Self::TOKEN_URL).send_form([
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ]);

        match response {
            Ok(response) => response
                .into_body()
                .read_json()
                .map_err(|e| SyncError::Data(format!("Failed to parse refresh token response: {e}"))),
            Err(ureq::Error::StatusCode(status @ (400 | 401 | 403))) => Err(SyncError::Auth(
                format!("refresh token rejected (HTTP {status})"),
            )),
            Err(ureq::Error::StatusCode(status)) => Err(SyncError::Transient(format!(
                "token endpoint returned HTTP {status}"
            ))),
            Err(e) => Err(SyncError::Transient(format!("Failed to refresh access token: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryCredentialStore {
        tokens: Mutex<HashMap<UserId, StoredToken>>,
    }

    impl CredentialStore for MemoryCredentialStore {
        fn load(&self, user_id: &UserId) -> Result<Option<StoredToken>> {
            Ok(self.tokens.lock().unwrap().get(user_id).cloned())
        }

        fn save(&self, user_id: &UserId, token: &StoredToken) -> Result<()> {
            self.tokens
                .lock()
                .unwrap()
                .insert(user_id.clone(), token.clone());
            Ok(())
        }
    }

    fn auth_with(store: Arc<MemoryCredentialStore>) -> GmailAuth {
        GmailAuth::new(
            GmailCredentials {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
            },
            store,
        )
    }

    #[test]
    fn test_fresh_token_is_returned_without_refresh() {
        let store = Arc::new(MemoryCredentialStore::default());
        let user = UserId::new("u1");
        store
            .save(
                &user,
                &StoredToken {
                    access_token: "abc".to_string(),
                    refresh_token: None,
                    expires_at: Some(chrono::Utc::now().timestamp() + 3_600),
                },
            )
            .unwrap();

        let auth = auth_with(store);
        assert_eq!(auth.access_token(&user).unwrap(), "abc");
        assert!(auth.is_authorized(&user));
    }

    #[test]
    fn test_missing_credentials_is_auth_error() {
        let auth = auth_with(Arc::new(MemoryCredentialStore::default()));
        let err = auth.access_token(&UserId::new("nobody")).unwrap_err();
        assert!(crate::error::is_auth_error(&err));
    }

    #[test]
    fn test_expired_without_refresh_token_is_auth_error() {
        let store = Arc::new(MemoryCredentialStore::default());
        let user = UserId::new("u1");
        store
            .save(
                &user,
                &StoredToken {
                    access_token: "old".to_string(),
                    refresh_token: None,
                    expires_at: Some(0),
                },
            )
            .unwrap();

        let auth = auth_with(store);
        let err = auth.access_token(&user).unwrap_err();
        assert!(crate::error::is_auth_error(&err));
        assert!(!auth.is_authorized(&user));
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        let user = UserId::new("someone@example.com");

        assert!(store.load(&user).unwrap().is_none());

        let token = StoredToken {
            access_token: "tok".to_string(),
            refresh_token: Some("ref".to_string()),
            expires_at: Some(42),
        };
        store.save(&user, &token).unwrap();
        assert_eq!(store.load(&user).unwrap(), Some(token));
    }
}
