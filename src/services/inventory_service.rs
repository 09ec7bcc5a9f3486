use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::campaign::Campaign;
use crate::models::channel::ChannelState;

/// A progress report arrived out of order: the platform already confirmed
/// more minutes than this. Ignored by callers, never fatal.
#[derive(Debug, Error)]
#[error("stale progress for drop {drop_id}: received {received}, already at {current}")]
pub struct StaleProgress {
    pub drop_id: String,
    pub received: u32,
    pub current: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressApplied {
    Updated { minutes: u32 },
    /// The drop crossed its threshold with this report.
    Completed,
    /// Already complete, or an unknown drop id; nothing to do.
    Unchanged,
}

/// In-memory store of campaigns and channel snapshots. No I/O; owned
/// exclusively by the mining loop task, so no interior locking.
#[derive(Default)]
pub struct Inventory {
    campaigns: HashMap<String, Campaign>,
    /// game_id -> campaign ids, so per-category eligibility queries stay
    /// proportional to that category's campaigns.
    by_game: HashMap<String, Vec<String>>,
    /// drop_id -> campaign_id for progress application.
    drop_owner: HashMap<String, String>,
    channels: HashMap<String, ChannelState>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a campaign. Idempotent by id; accrued minutes
    /// and claim flags of already-known drops are preserved when the
    /// incoming copy reports less (a re-fetch never regresses progress).
    pub fn upsert_campaign(&mut self, mut incoming: Campaign) {
        if let Some(existing) = self.campaigns.get(&incoming.id) {
            for drop in &mut incoming.timed_drops {
                if let Some(known) = existing.get_drop(&drop.id) {
                    drop.current_minutes = drop.current_minutes.max(known.current_minutes);
                    drop.is_claimed = drop.is_claimed || known.is_claimed;
                }
            }
            // Drops the re-fetch no longer carries leave the index too.
            for drop in &existing.timed_drops {
                self.drop_owner.remove(&drop.id);
            }
        }
        self.unindex(&incoming.id);
        for drop in &incoming.timed_drops {
            self.drop_owner.insert(drop.id.clone(), incoming.id.clone());
        }
        self.by_game
            .entry(incoming.game_id.clone())
            .or_default()
            .push(incoming.id.clone());
        self.campaigns.insert(incoming.id.clone(), incoming);
    }

    /// Last-write-wins refresh of a channel snapshot. Keeps the previous
    /// last-seen-live timestamp when the new snapshot is offline, and the
    /// ACL origin flag once set.
    pub fn upsert_channel(&mut self, mut channel: ChannelState) {
        if channel.live && channel.last_seen_live.is_none() {
            channel.last_seen_live = Some(Utc::now());
        }
        if let Some(prev) = self.channels.get(&channel.id) {
            channel.acl_based = channel.acl_based || prev.acl_based;
            if !channel.live {
                channel.last_seen_live = prev.last_seen_live;
            }
        }
        self.channels.insert(channel.id.clone(), channel);
    }

    /// Applies a confirmed watch-minutes reading to a drop. Monotonic:
    /// a lower value than the stored one is a `StaleProgress` error; equal
    /// values and reports for completed drops are no-ops.
    pub fn apply_progress(
        &mut self,
        drop_id: &str,
        minutes: u32,
    ) -> Result<ProgressApplied, StaleProgress> {
        let Some(campaign_id) = self.drop_owner.get(drop_id) else {
            debug!("[Inventory] progress for unknown drop {drop_id}, dropping");
            return Ok(ProgressApplied::Unchanged);
        };
        let Some(drop) = self
            .campaigns
            .get_mut(campaign_id)
            .and_then(|c| c.get_drop_mut(drop_id))
        else {
            return Ok(ProgressApplied::Unchanged);
        };

        if drop.is_complete() {
            return Ok(ProgressApplied::Unchanged);
        }
        if minutes < drop.current_minutes {
            return Err(StaleProgress {
                drop_id: drop_id.to_string(),
                received: minutes,
                current: drop.current_minutes,
            });
        }
        if minutes == drop.current_minutes {
            return Ok(ProgressApplied::Unchanged);
        }
        drop.current_minutes = minutes.min(drop.required_minutes);
        if drop.is_complete() {
            Ok(ProgressApplied::Completed)
        } else {
            Ok(ProgressApplied::Updated { minutes })
        }
    }

    pub fn mark_claimed(&mut self, drop_id: &str) {
        if let Some(campaign_id) = self.drop_owner.get(drop_id) {
            if let Some(drop) = self
                .campaigns
                .get_mut(campaign_id)
                .and_then(|c| c.get_drop_mut(drop_id))
            {
                drop.is_claimed = true;
                drop.current_minutes = drop.required_minutes;
            }
        }
    }

    /// Campaigns for a game that can still accrue progress for the account.
    pub fn earnable_campaigns_for_game(
        &self,
        game_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<&Campaign> {
        self.campaigns_for_game(game_id)
            .into_iter()
            .filter(|c| c.is_active(now) && c.account_linked && c.has_pending_drops())
            .collect()
    }

    pub fn campaigns_for_game(&self, game_id: &str) -> Vec<&Campaign> {
        self.by_game
            .get(game_id)
            .map(|ids| ids.iter().filter_map(|id| self.campaigns.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_campaign(&self, id: &str) -> Option<&Campaign> {
        self.campaigns.get(id)
    }

    pub fn campaign_of_drop(&self, drop_id: &str) -> Option<&Campaign> {
        self.drop_owner
            .get(drop_id)
            .and_then(|cid| self.campaigns.get(cid))
    }

    pub fn campaigns(&self) -> impl Iterator<Item = &Campaign> {
        self.campaigns.values()
    }

    pub fn get_channel(&self, id: &str) -> Option<&ChannelState> {
        self.channels.get(id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelState> {
        self.channels.values()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Removes campaigns whose window fully elapsed, along with their drop
    /// index entries. Returns how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .campaigns
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| c.id.clone())
            .collect();
        for id in &expired {
            self.unindex(id);
            if let Some(campaign) = self.campaigns.remove(id) {
                for drop in &campaign.timed_drops {
                    self.drop_owner.remove(&drop.id);
                }
                debug!("[Inventory] purged expired campaign {} ({})", campaign.name, id);
            }
        }
        expired.len()
    }

    fn unindex(&mut self, campaign_id: &str) {
        for ids in self.by_game.values_mut() {
            ids.retain(|id| id != campaign_id);
        }
        self.by_game.retain(|_, ids| !ids.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::campaign::TimedDrop;
    use chrono::Duration;

    fn campaign(id: &str, game_id: &str, drops: Vec<TimedDrop>) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: id.to_string(),
            name: format!("campaign {id}"),
            game_id: game_id.to_string(),
            game_name: format!("game {game_id}"),
            start_at: now - Duration::hours(1),
            end_at: now + Duration::hours(1),
            account_linked: true,
            allowed_channels: Vec::new(),
            timed_drops: drops,
        }
    }

    fn timed_drop(id: &str, required: u32, current: u32) -> TimedDrop {
        TimedDrop {
            id: id.to_string(),
            name: id.to_string(),
            required_minutes: required,
            current_minutes: current,
            is_claimed: false,
            precondition_ids: Vec::new(),
        }
    }

    #[test]
    fn upsert_merge_preserves_accrued_minutes() {
        let mut inv = Inventory::new();
        inv.upsert_campaign(campaign("c1", "g1", vec![timed_drop("d1", 60, 45)]));
        // Re-fetch reports fewer minutes (late data); must not regress.
        inv.upsert_campaign(campaign("c1", "g1", vec![timed_drop("d1", 60, 30)]));
        let drop = inv.get_campaign("c1").unwrap().get_drop("d1").unwrap();
        assert_eq!(drop.current_minutes, 45);

        // A higher value does win.
        inv.upsert_campaign(campaign("c1", "g1", vec![timed_drop("d1", 60, 50)]));
        let drop = inv.get_campaign("c1").unwrap().get_drop("d1").unwrap();
        assert_eq!(drop.current_minutes, 50);
    }

    #[test]
    fn apply_progress_is_monotonic() {
        let mut inv = Inventory::new();
        inv.upsert_campaign(campaign("c1", "g1", vec![timed_drop("d1", 60, 20)]));

        assert!(matches!(
            inv.apply_progress("d1", 30),
            Ok(ProgressApplied::Updated { minutes: 30 })
        ));
        let err = inv.apply_progress("d1", 10).unwrap_err();
        assert_eq!(err.received, 10);
        assert_eq!(err.current, 30);
        // Stale report left the stored value untouched.
        let drop = inv.get_campaign("c1").unwrap().get_drop("d1").unwrap();
        assert_eq!(drop.current_minutes, 30);
    }

    #[test]
    fn threshold_completes_and_further_reports_are_noops() {
        let mut inv = Inventory::new();
        inv.upsert_campaign(campaign("c1", "g1", vec![timed_drop("d1", 60, 59)]));

        assert!(matches!(
            inv.apply_progress("d1", 60),
            Ok(ProgressApplied::Completed)
        ));
        // Any value after completion is a no-op, even a lower one.
        assert!(matches!(
            inv.apply_progress("d1", 10),
            Ok(ProgressApplied::Unchanged)
        ));
        assert!(matches!(
            inv.apply_progress("d1", 120),
            Ok(ProgressApplied::Unchanged)
        ));
        assert!(!inv.get_campaign("c1").unwrap().has_pending_drops());
    }

    #[test]
    fn unknown_drop_is_ignored() {
        let mut inv = Inventory::new();
        assert!(matches!(
            inv.apply_progress("nope", 10),
            Ok(ProgressApplied::Unchanged)
        ));
    }

    #[test]
    fn earnable_query_skips_unlinked_and_finished() {
        let mut inv = Inventory::new();
        let mut unlinked = campaign("c1", "g1", vec![timed_drop("d1", 60, 0)]);
        unlinked.account_linked = false;
        inv.upsert_campaign(unlinked);
        inv.upsert_campaign(campaign("c2", "g1", vec![timed_drop("d2", 60, 60)]));
        inv.upsert_campaign(campaign("c3", "g1", vec![timed_drop("d3", 60, 0)]));

        let earnable = inv.earnable_campaigns_for_game("g1", Utc::now());
        let ids: Vec<&str> = earnable.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c3"]);
    }

    #[test]
    fn refetch_without_a_drop_unindexes_it() {
        let mut inv = Inventory::new();
        inv.upsert_campaign(campaign(
            "c1",
            "g1",
            vec![timed_drop("d1", 60, 0), timed_drop("d2", 60, 0)],
        ));
        inv.upsert_campaign(campaign("c1", "g1", vec![timed_drop("d2", 60, 0)]));

        assert!(inv.campaign_of_drop("d1").is_none());
        assert!(inv.campaign_of_drop("d2").is_some());
        assert!(matches!(
            inv.apply_progress("d1", 30),
            Ok(ProgressApplied::Unchanged)
        ));
    }

    #[test]
    fn purge_removes_expired_and_their_drops() {
        let mut inv = Inventory::new();
        let mut old = campaign("c1", "g1", vec![timed_drop("d1", 60, 0)]);
        old.start_at = Utc::now() - Duration::hours(3);
        old.end_at = Utc::now() - Duration::hours(1);
        inv.upsert_campaign(old);
        inv.upsert_campaign(campaign("c2", "g2", vec![timed_drop("d2", 60, 0)]));

        assert_eq!(inv.purge_expired(Utc::now()), 1);
        assert!(inv.get_campaign("c1").is_none());
        assert!(inv.campaign_of_drop("d1").is_none());
        assert!(inv.get_campaign("c2").is_some());
    }

    #[test]
    fn offline_snapshot_keeps_last_seen_live() {
        let mut inv = Inventory::new();
        let mut live = ChannelState::offline("ch1", "streamer");
        live.live = true;
        inv.upsert_channel(live);
        let seen = inv.get_channel("ch1").unwrap().last_seen_live;
        assert!(seen.is_some());

        inv.upsert_channel(ChannelState::offline("ch1", "streamer"));
        let ch = inv.get_channel("ch1").unwrap();
        assert!(!ch.live);
        assert_eq!(ch.last_seen_live, seen);
    }
}
