use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A time-bounded collection of drops tied to a single game.
///
/// Campaigns are created and refreshed by discovery; nothing else mutates
/// them except progress application on their contained drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub game_id: String,
    pub game_name: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    /// Whether the account is connected/linked for this campaign. Unlinked
    /// campaigns never accrue watch minutes.
    #[serde(default)]
    pub account_linked: bool,
    /// Allow-list of channels for ACL-restricted campaigns. Empty means the
    /// campaign is open to any channel streaming its game.
    #[serde(default)]
    pub allowed_channels: Vec<AclChannel>,
    pub timed_drops: Vec<TimedDrop>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclChannel {
    pub id: String,
    pub name: String,
}

/// A single time-gated reward within a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedDrop {
    pub id: String,
    pub name: String,
    pub required_minutes: u32,
    #[serde(default)]
    pub current_minutes: u32,
    #[serde(default)]
    pub is_claimed: bool,
    /// Drops that must be claimed before this one starts accruing.
    #[serde(default)]
    pub precondition_ids: Vec<String>,
}

impl TimedDrop {
    /// A drop is complete once claimed, or once its accrued minutes reach
    /// the threshold. Zero-minute drops are rewarded out-of-band and never
    /// count as pending.
    pub fn is_complete(&self) -> bool {
        self.is_claimed
            || (self.required_minutes > 0 && self.current_minutes >= self.required_minutes)
    }

    pub fn remaining_minutes(&self) -> u32 {
        self.required_minutes.saturating_sub(self.current_minutes)
    }

    pub fn progress(&self) -> f32 {
        if self.required_minutes == 0 || self.current_minutes == 0 {
            0.0
        } else if self.current_minutes >= self.required_minutes {
            1.0
        } else {
            self.current_minutes as f32 / self.required_minutes as f32
        }
    }
}

impl Campaign {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && now < self.end_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_at <= now
    }

    /// True when the allow-list permits the given channel. An empty list
    /// means no restriction.
    pub fn allows_channel(&self, channel_id: &str) -> bool {
        self.allowed_channels.is_empty() || self.allowed_channels.iter().any(|c| c.id == channel_id)
    }

    pub fn get_drop(&self, drop_id: &str) -> Option<&TimedDrop> {
        self.timed_drops.iter().find(|d| d.id == drop_id)
    }

    pub fn get_drop_mut(&mut self, drop_id: &str) -> Option<&mut TimedDrop> {
        self.timed_drops.iter_mut().find(|d| d.id == drop_id)
    }

    /// True when the drop's preconditions (if any) are all complete.
    pub fn preconditions_met(&self, drop: &TimedDrop) -> bool {
        drop.precondition_ids
            .iter()
            .all(|pid| self.get_drop(pid).map(|p| p.is_complete()).unwrap_or(true))
    }

    /// Drops that can still accrue minutes: not complete, a nonzero
    /// threshold, and preconditions met.
    pub fn pending_drops(&self) -> impl Iterator<Item = &TimedDrop> {
        self.timed_drops
            .iter()
            .filter(|d| !d.is_complete() && d.required_minutes > 0 && self.preconditions_met(d))
    }

    pub fn has_pending_drops(&self) -> bool {
        self.pending_drops().next().is_some()
    }

    pub fn claimed_count(&self) -> usize {
        self.timed_drops.iter().filter(|d| d.is_claimed).count()
    }
}
