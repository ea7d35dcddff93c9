//! Gmail API HTTP client
//!
//! Synchronous HTTP (ureq) to stay executor-agnostic. Every request goes
//! through one retry loop: transient failures back off exponentially with
//! jitter, and a 401 triggers a single forced token refresh and replay.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::api::{
    GmailLabel, GmailMessage, HistoryResponse, ListLabelsResponse, ListMessagesResponse,
    ProfileResponse,
};
use super::{GmailAuth, MailboxProvider, RemoteMailbox};
use crate::error::SyncError;
use crate::models::{MessageId, UserId};

/// Gmail API client bound to one user
pub struct GmailClient {
    user_id: UserId,
    auth: Arc<GmailAuth>,
    agent: ureq::Agent,
    max_attempts: u32,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1/users/me";

    /// Largest page the list endpoint accepts
    const MAX_PAGE_SIZE: usize = 500;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

    pub fn new(user_id: UserId, auth: Arc<GmailAuth>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Self::REQUEST_TIMEOUT))
            .build()
            .into();

        Self {
            user_id,
            auth,
            agent,
            max_attempts: 3,
        }
    }

    /// Override the in-client retry budget (queue-level retries still apply)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn endpoint(path: &str) -> Result<Url> {
        Url::parse(&format!("{}/{}", Self::BASE_URL, path))
            .with_context(|| format!("Invalid Gmail endpoint: {}", path))
    }

    /// GET `url` and decode JSON, retrying transient failures
    fn get_json<T: DeserializeOwned>(&self, url: &Url, what: &str) -> Result<T> {
        let mut delay = Self::INITIAL_BACKOFF;
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let token = self.auth.access_token(&self.user_id)?;

            match self.request(url, &token) {
                Ok(value) => return Ok(value),
                Err(SyncError::Auth(_)) if !refreshed => {
                    log::info!("[GMAIL] {} got 401, refreshing token for {}", what, self.user_id);
                    refreshed = true;
                    self.auth.force_refresh(&self.user_id)?;
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let wait = match &e {
                        SyncError::RateLimited {
                            retry_after: Some(after),
                        } => *after,
                        _ => delay + Duration::from_millis(rand_jitter()),
                    };
                    log::warn!(
                        "[GMAIL] {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        what,
                        attempt,
                        self.max_attempts,
                        e,
                        wait
                    );
                    std::thread::sleep(wait);
                    delay *= 2;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!("Failed to {}", what)));
                }
            }
        }
    }

    fn request<T: DeserializeOwned>(&self, url: &Url, access_token: &str) -> Result<T, SyncError> {
        let mut response = self
            .agent
            .get(url.as_str())
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()
            .map_err(classify_error)?;

        response
            .body_mut()
            .read_json()
            .map_err(|e| SyncError::Data(format!("unparseable response: {}", e)))
    }
}

impl RemoteMailbox for GmailClient {
    fn list_messages(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<ListMessagesResponse> {
        let mut url = Self::endpoint("messages")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(
                "maxResults",
                &page_size.clamp(1, Self::MAX_PAGE_SIZE).to_string(),
            );
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        self.get_json(&url, "list messages")
    }

    fn get_message(&self, id: &MessageId) -> Result<GmailMessage> {
        let mut url = Self::endpoint(&format!("messages/{}", urlencoding::encode(id.as_str())))?;
        url.query_pairs_mut().append_pair("format", "full");
        self.get_json(&url, "get message")
    }

    fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse> {
        let mut url = Self::endpoint("history")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("startHistoryId", start_history_id);
            for history_type in ["messageAdded", "messageDeleted", "labelAdded", "labelRemoved"] {
                query.append_pair("historyTypes", history_type);
            }
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }

        self.get_json(&url, "list history").map_err(|e| {
            // Gmail answers 404 when the start id is older than its retention
            match e.downcast_ref::<SyncError>() {
                Some(SyncError::NotFound(_)) => SyncError::HistoryExpired.into(),
                _ => e,
            }
        })
    }

    fn list_labels(&self) -> Result<Vec<GmailLabel>> {
        let url = Self::endpoint("labels")?;
        let response: ListLabelsResponse = self.get_json(&url, "list labels")?;
        Ok(response.labels.unwrap_or_default())
    }

    fn get_profile(&self) -> Result<ProfileResponse> {
        let url = Self::endpoint("profile")?;
        self.get_json(&url, "get profile")
    }
}

/// Builds a [`GmailClient`] per user over shared auth
pub struct GmailMailboxProvider {
    auth: Arc<GmailAuth>,
}

impl GmailMailboxProvider {
    pub fn new(auth: Arc<GmailAuth>) -> Self {
        Self { auth }
    }
}

impl MailboxProvider for GmailMailboxProvider {
    fn mailbox(&self, user_id: &UserId) -> Result<Arc<dyn RemoteMailbox>> {
        if !self.auth.is_authorized(user_id) {
            return Err(SyncError::Auth(format!("user {} has not authorized access", user_id)).into());
        }
        Ok(Arc::new(GmailClient::new(user_id.clone(), self.auth.clone())))
    }
}

/// Map a transport or HTTP status failure onto the sync taxonomy
fn classify_error(err: ureq::Error) -> SyncError {
    match err {
        ureq::Error::StatusCode(401) => SyncError::Auth("access token rejected".to_string()),
        // Gmail reports quota exhaustion as 403 rateLimitExceeded
        ureq::Error::StatusCode(403 | 429) => SyncError::RateLimited { retry_after: None },
        ureq::Error::StatusCode(404) => SyncError::NotFound("remote returned 404".to_string()),
        ureq::Error::StatusCode(status) if status >= 500 => {
            SyncError::Transient(format!("remote returned HTTP {}", status))
        }
        ureq::Error::StatusCode(status) => {
            SyncError::Data(format!("remote rejected request with HTTP {}", status))
        }
        other => SyncError::Transient(other.to_string()),
    }
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_codes() {
        assert!(matches!(
            classify_error(ureq::Error::StatusCode(401)),
            SyncError::Auth(_)
        ));
        assert!(classify_error(ureq::Error::StatusCode(429)).is_retryable());
        assert!(classify_error(ureq::Error::StatusCode(403)).is_retryable());
        assert!(classify_error(ureq::Error::StatusCode(503)).is_retryable());
        assert!(classify_error(ureq::Error::StatusCode(404)).is_data_error());
        assert!(matches!(
            classify_error(ureq::Error::StatusCode(400)),
            SyncError::Data(_)
        ));
    }

    #[test]
    fn test_endpoint_building() {
        let url = GmailClient::endpoint("messages").unwrap();
        assert_eq!(
            url.as_str(),
            "https://gmail.googleapis.com/gmail/v1/users/me/messages"
        );
    }

    #[test]
    fn test_jitter_is_bounded() {
        for _ in 0..20 {
            assert!(rand_jitter() < 100);
        }
    }
}
