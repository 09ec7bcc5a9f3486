use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::preferences::{Preferences, PriorityMode};

// Android app client ID, same one the watch payloads are attributed to.
pub const DEFAULT_CLIENT_ID: &str = "kd1unb4b3q4t58fwlpcbzcbnm76a8fp";

const APP_NAME: &str = "dropwatch";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    /// OAuth access token for an already-authenticated session. Login is
    /// handled outside this process; we only consume the credential.
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub priority_games: Vec<String>,
    #[serde(default)]
    pub excluded_games: Vec<String>,
    #[serde(default)]
    pub priority_mode: PriorityMode,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval_secs: u64,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    /// Consecutive keep-alive failures tolerated before the session is
    /// invalidated and the candidate cooled down.
    #[serde(default = "default_keepalive_retry_budget")]
    pub keepalive_retry_budget: u32,
    /// How long a failed candidate stays excluded from selection.
    #[serde(default = "default_cooldown")]
    pub candidate_cooldown_secs: u64,

    #[serde(default = "default_true")]
    pub auto_claim_drops: bool,
    /// Streams fetched per game when seeding candidates from the directory.
    #[serde(default = "default_directory_page_size")]
    pub directory_page_size: u32,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}
fn default_keepalive_interval() -> u64 {
    20
}
fn default_status_poll_interval() -> u64 {
    60
}
fn default_discovery_interval() -> u64 {
    300
}
fn default_request_timeout() -> u64 {
    30
}
fn default_keepalive_timeout() -> u64 {
    10
}
fn default_keepalive_retry_budget() -> u32 {
    3
}
fn default_cooldown() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_directory_page_size() -> u32 {
    20
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            client_id: default_client_id(),
            priority_games: Vec::new(),
            excluded_games: Vec::new(),
            priority_mode: PriorityMode::default(),
            keepalive_interval_secs: default_keepalive_interval(),
            status_poll_interval_secs: default_status_poll_interval(),
            discovery_interval_secs: default_discovery_interval(),
            request_timeout_secs: default_request_timeout(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            keepalive_retry_budget: default_keepalive_retry_budget(),
            candidate_cooldown_secs: default_cooldown(),
            auto_claim_drops: default_true(),
            directory_page_size: default_directory_page_size(),
        }
    }
}

impl MinerConfig {
    /// Loads the config from the platform config directory, creating a
    /// default file on first run.
    pub fn load() -> Result<Self> {
        confy::load(APP_NAME, None).context("failed to load configuration")
    }

    pub fn preferences(&self) -> Preferences {
        Preferences {
            priority_games: self.priority_games.clone(),
            excluded_games: self.excluded_games.iter().cloned().collect(),
            priority_mode: self.priority_mode,
        }
    }
}
