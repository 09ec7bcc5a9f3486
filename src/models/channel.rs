use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point-in-time snapshot of a broadcast channel, as reported by the
/// status poller or directory discovery. The engine never invents channels;
/// it only observes and re-ranks these snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelState {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// None while offline or when the broadcaster has no category set.
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub game_name: Option<String>,
    pub live: bool,
    #[serde(default)]
    pub viewers: u32,
    #[serde(default)]
    pub drops_enabled: bool,
    /// Whether this channel came from a campaign allow-list rather than the
    /// game directory. ACL channels are preferred when ranking ties.
    #[serde(default)]
    pub acl_based: bool,
    #[serde(default)]
    pub last_seen_live: Option<DateTime<Utc>>,
}

impl ChannelState {
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.login)
    }

    pub fn offline(id: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            login: login.into(),
            display_name: None,
            game_id: None,
            game_name: None,
            live: false,
            viewers: 0,
            drops_enabled: false,
            acl_based: false,
            last_seen_live: None,
        }
    }
}
