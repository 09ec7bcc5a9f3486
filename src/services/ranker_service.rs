use chrono::{DateTime, Utc};
use log::debug;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::channel::ChannelState;
use crate::models::preferences::Preferences;
use crate::services::eligibility_service::{evaluate, Eligibility};
use crate::services::inventory_service::Inventory;

/// The channel the miner should be watching right now, with the campaign
/// that made it eligible.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub channel: ChannelState,
    pub campaign_id: String,
}

/// Orders live, eligible channels and remembers which candidates recently
/// failed so they sit out a cool-down window instead of being re-picked in
/// a tight loop.
#[derive(Default)]
pub struct Ranker {
    cooldowns: HashMap<String, Instant>,
}

impl Ranker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Excludes the channel from selection until `window` elapses.
    pub fn cool_down(&mut self, channel_id: &str, window: Duration) {
        debug!("[Ranker] cooling down channel {channel_id} for {window:?}");
        self.cooldowns
            .insert(channel_id.to_string(), Instant::now() + window);
    }

    pub fn is_cooled_down(&self, channel_id: &str, now: Instant) -> bool {
        self.cooldowns
            .get(channel_id)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    pub fn purge_cooldowns(&mut self, now: Instant) {
        self.cooldowns.retain(|_, until| *until > now);
    }

    /// Picks the single best channel, or None when nothing is eligible,
    /// which is a normal idle condition, not an error.
    ///
    /// Order: (1) category priority rank, unlisted categories after all
    /// listed ones ordered by game id; (2) the channel already being
    /// watched, so a viewer-count lead alone never forces a switch;
    /// (3) ACL-listed channels before directory ones; (4) viewer count
    /// descending; (5) channel id ascending as the final deterministic
    /// tie-break.
    pub fn pick_best(
        &self,
        inventory: &Inventory,
        preferences: &Preferences,
        current_target: Option<&str>,
        now_utc: DateTime<Utc>,
        now: Instant,
    ) -> Option<RankedCandidate> {
        let mut candidates: Vec<(RankKey, RankedCandidate)> = Vec::new();
        for channel in inventory.channels() {
            if !channel.live || self.is_cooled_down(&channel.id, now) {
                continue;
            }
            let Eligibility::Eligible { campaign_id } =
                evaluate(channel, inventory, preferences, now_utc)
            else {
                continue;
            };
            let rank = match channel.game_name.as_deref().and_then(|g| preferences.priority_rank(g))
            {
                Some(idx) => CategoryRank::Listed(idx),
                None => CategoryRank::Unlisted(channel.game_id.clone().unwrap_or_default()),
            };
            let key = RankKey {
                rank,
                is_current: current_target == Some(channel.id.as_str()),
                acl_based: channel.acl_based,
                viewers: channel.viewers,
                channel_id: channel.id.clone(),
            };
            candidates.push((
                key,
                RankedCandidate {
                    channel: channel.clone(),
                    campaign_id,
                },
            ));
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates.into_iter().next().map(|(_, c)| c)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CategoryRank {
    Listed(usize),
    /// Below every listed category; ordered among themselves by game id.
    Unlisted(String),
}

impl Ord for CategoryRank {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (CategoryRank::Listed(a), CategoryRank::Listed(b)) => a.cmp(b),
            (CategoryRank::Listed(_), CategoryRank::Unlisted(_)) => Ordering::Less,
            (CategoryRank::Unlisted(_), CategoryRank::Listed(_)) => Ordering::Greater,
            (CategoryRank::Unlisted(a), CategoryRank::Unlisted(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for CategoryRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct RankKey {
    rank: CategoryRank,
    is_current: bool,
    acl_based: bool,
    viewers: u32,
    channel_id: String,
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.is_current.cmp(&self.is_current))
            .then_with(|| other.acl_based.cmp(&self.acl_based))
            .then_with(|| other.viewers.cmp(&self.viewers))
            .then_with(|| self.channel_id.cmp(&other.channel_id))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
