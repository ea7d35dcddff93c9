//! Configuration for the sync engine and its workers
//!
//! `SyncConfig` is read from `sync.json` in the mailsync config directory
//! when present; every field has a default so a partial file is enough.
//! OAuth client credentials are loaded separately (see [`GmailCredentials`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::JobKind;

/// Sync settings filename in the config directory
const SYNC_CONFIG_FILE: &str = "sync.json";

/// Credentials filename in the config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// At most `max` dispatches per `per_secs` window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    pub per_secs: u64,
}

impl RateLimit {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.per_secs)
    }
}

/// Scheduling policy for one job kind's queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    /// Worker threads pulling from this queue
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    /// Total attempts including the first delivery
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Lease length; an unacknowledged job is redelivered after this
    pub timeout_secs: u64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rate_limit: None,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            timeout_secs: 300,
        }
    }
}

impl QueuePolicy {
    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-kind queue policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicies {
    pub sync_initial: QueuePolicy,
    pub sync_incremental: QueuePolicy,
    pub sync_labels: QueuePolicy,
    pub detail_batch: QueuePolicy,
}

impl Default for QueuePolicies {
    fn default() -> Self {
        Self {
            sync_initial: QueuePolicy {
                concurrency: 2,
                rate_limit: Some(RateLimit { max: 10, per_secs: 60 }),
                timeout_secs: 1_800,
                ..QueuePolicy::default()
            },
            sync_incremental: QueuePolicy {
                concurrency: 4,
                rate_limit: Some(RateLimit { max: 60, per_secs: 60 }),
                ..QueuePolicy::default()
            },
            sync_labels: QueuePolicy {
                concurrency: 2,
                ..QueuePolicy::default()
            },
            detail_batch: QueuePolicy {
                concurrency: 4,
                rate_limit: Some(RateLimit { max: 20, per_secs: 1 }),
                max_attempts: 8,
                timeout_secs: 600,
                ..QueuePolicy::default()
            },
        }
    }
}

impl QueuePolicies {
    pub fn for_kind(&self, kind: JobKind) -> &QueuePolicy {
        match kind {
            JobKind::SyncInitial => &self.sync_initial,
            JobKind::SyncIncremental => &self.sync_incremental,
            JobKind::SyncLabels => &self.sync_labels,
            JobKind::DetailBatch => &self.detail_batch,
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Message identities requested per list page (remote caps at 500)
    pub page_size: usize,
    /// Stubs enriched per detail batch job
    pub detail_batch_size: usize,
    /// Stubs that failed enrichment this many times are left alone
    pub max_detail_failures: u32,
    /// Minimum seconds between incremental syncs for one user
    pub incremental_cooldown_secs: u64,
    /// History pages one incremental job applies before handing off
    pub max_history_pages: usize,
    pub queues: QueuePolicies,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            detail_batch_size: 50,
            max_detail_failures: 3,
            incremental_cooldown_secs: 30,
            max_history_pages: 10,
            queues: QueuePolicies::default(),
        }
    }
}

impl SyncConfig {
    /// Load `sync.json` from the config directory, or defaults if absent
    pub fn load() -> Result<Self> {
        let config = config::load_json_optional::<Self>(SYNC_CONFIG_FILE)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = config::load_json_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.page_size > 0, "page_size must be positive");
        anyhow::ensure!(self.detail_batch_size > 0, "detail_batch_size must be positive");
        anyhow::ensure!(self.max_history_pages > 0, "max_history_pages must be positive");
        for kind in JobKind::ALL {
            let policy = self.queues.for_kind(kind);
            anyhow::ensure!(
                policy.max_attempts > 0,
                "{} queue needs at least one attempt",
                kind.queue_name()
            );
            if let Some(limit) = policy.rate_limit {
                anyhow::ensure!(
                    limit.max > 0 && limit.per_secs > 0,
                    "{} queue has an empty rate limit window",
                    kind.queue_name()
                );
            }
        }
        Ok(())
    }
}

/// OAuth client credentials used to refresh access tokens
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials
    /// 2. JSON file in the config directory
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Credentials embedded via GOOGLE_CLIENT_ID / GOOGLE_CLIENT_SECRET at build time
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }

    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "detail_batch_size": 10, "queues": { "detail_batch": { "concurrency": 8 } } }"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.detail_batch_size, 10);
        assert_eq!(config.page_size, 500);
        assert_eq!(config.queues.detail_batch.concurrency, 8);
        // Fields missing from a partially specified policy fall back to QueuePolicy::default
        assert_eq!(config.queues.detail_batch.max_attempts, 5);
        assert_eq!(config.queues.sync_labels, QueuePolicies::default().sync_labels);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = SyncConfig {
            detail_batch_size: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            max_history_pages: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = QueuePolicy {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..QueuePolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_parse_installed_credentials() {
        let json = r#"{
            "installed": {
                "client_id": "test-client-id.apps.googleusercontent.com",
                "client_secret": "test-secret",
                "token_uri": "https://oauth2.googleapis.com/token"
            }
        }"#;

        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "test-client-id.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "test-secret");
    }

    #[test]
    fn test_parse_web_credentials() {
        let json = r#"{ "web": { "client_id": "web-id", "client_secret": "web-secret" } }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "web-id");
    }

    #[test]
    fn test_invalid_credentials_json() {
        assert!(GmailCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }
}
