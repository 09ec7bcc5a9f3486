use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use std::time::{Duration, Instant};

use crate::models::campaign::Campaign;
use crate::services::inventory_service::{Inventory, ProgressApplied};
use crate::services::platform::DropProgressEvent;

/// Capped exponential backoff with jitter for discovery retries.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next retry: base * 2^attempt, capped, with up to
    /// 25% added jitter so restarts don't synchronize.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::rng().random_range(0.0..0.25);
        exp.mul_f64(1.0 + jitter).min(self.cap.mul_f64(1.25))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// What a campaign refresh changed.
#[derive(Debug, Default)]
pub struct RefreshSummary {
    pub campaigns: usize,
    pub purged: usize,
    /// Game (id, name) pairs that still have earnable drops; used to seed
    /// directory discovery for candidate channels.
    pub pending_games: Vec<(String, String)>,
}

/// A drop that just crossed its threshold and should be claimed and
/// re-ranked against.
#[derive(Debug, Clone)]
pub struct CompletedDrop {
    pub drop_id: String,
    pub campaign_id: String,
    pub name: String,
}

/// Record of a successfully claimed drop, kept for status output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClaimedDropRecord {
    pub id: String,
    pub drop_id: String,
    pub campaign_id: String,
    pub drop_name: String,
    pub game_name: String,
    pub claimed_at: DateTime<Utc>,
}

/// Drives the slow-cadence campaign refresh and reconciles progress events
/// into the inventory. Refresh failures back off without ever blocking the
/// rest of the loop; the stale inventory keeps serving until one succeeds.
pub struct DiscoveryTracker {
    backoff: Backoff,
    retry_at: Option<Instant>,
    last_refresh: Option<DateTime<Utc>>,
    claimed: Vec<ClaimedDropRecord>,
}

impl DiscoveryTracker {
    pub fn new() -> Self {
        Self {
            backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(300)),
            retry_at: None,
            last_refresh: None,
            claimed: Vec::new(),
        }
    }

    /// True when a refresh should be issued on this tick. After a failure
    /// this holds off until the backoff delay has elapsed.
    pub fn should_refresh(&self, now: Instant) -> bool {
        match self.retry_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    /// Merges a successful fetch into the inventory and resets the backoff.
    pub fn on_refresh_ok(
        &mut self,
        inventory: &mut Inventory,
        campaigns: Vec<Campaign>,
        now: DateTime<Utc>,
    ) -> RefreshSummary {
        self.backoff.reset();
        self.retry_at = None;
        self.last_refresh = Some(now);

        let count = campaigns.len();
        for campaign in campaigns {
            inventory.upsert_campaign(campaign);
        }
        let purged = inventory.purge_expired(now);

        let mut pending_games: Vec<(String, String)> = Vec::new();
        for campaign in inventory.campaigns() {
            if inventory
                .earnable_campaigns_for_game(&campaign.game_id, now)
                .is_empty()
            {
                continue;
            }
            let pair = (campaign.game_id.clone(), campaign.game_name.clone());
            if !pending_games.contains(&pair) {
                pending_games.push(pair);
            }
        }
        pending_games.sort();

        info!(
            "[Discovery] refreshed {count} campaigns ({purged} purged, {} games pending)",
            pending_games.len()
        );
        RefreshSummary {
            campaigns: count,
            purged,
            pending_games,
        }
    }

    /// Schedules the retry for a failed refresh. Existing inventory is
    /// untouched.
    pub fn on_refresh_err(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(now + delay);
        warn!(
            "[Discovery] refresh failed (attempt {}), retrying in {delay:?}",
            self.backoff.attempt()
        );
        delay
    }

    /// Applies a batch of confirmed progress readings. Stale reports are
    /// logged and dropped; completions are returned for claiming and
    /// re-ranking.
    pub fn apply_progress_events(
        &mut self,
        inventory: &mut Inventory,
        events: Vec<DropProgressEvent>,
    ) -> Vec<CompletedDrop> {
        let mut completed = Vec::new();
        for event in events {
            match inventory.apply_progress(&event.drop_id, event.minutes) {
                Ok(ProgressApplied::Completed) => {
                    if let Some(campaign) = inventory.campaign_of_drop(&event.drop_id) {
                        let name = campaign
                            .get_drop(&event.drop_id)
                            .map(|d| d.name.clone())
                            .unwrap_or_default();
                        info!(
                            "[Discovery] drop {name} complete ({} / {})",
                            campaign.name, campaign.game_name
                        );
                        completed.push(CompletedDrop {
                            drop_id: event.drop_id,
                            campaign_id: campaign.id.clone(),
                            name,
                        });
                    }
                }
                Ok(ProgressApplied::Updated { minutes }) => {
                    debug!("[Discovery] drop {} at {minutes} minutes", event.drop_id);
                }
                Ok(ProgressApplied::Unchanged) => {}
                Err(stale) => {
                    debug!("[Discovery] {stale}");
                }
            }
        }
        completed
    }

    pub fn record_claim(&mut self, inventory: &Inventory, drop_id: &str) {
        let (drop_name, campaign_id, game_name) = match inventory.campaign_of_drop(drop_id) {
            Some(campaign) => (
                campaign
                    .get_drop(drop_id)
                    .map(|d| d.name.clone())
                    .unwrap_or_default(),
                campaign.id.clone(),
                campaign.game_name.clone(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        self.claimed.push(ClaimedDropRecord {
            id: uuid::Uuid::new_v4().to_string(),
            drop_id: drop_id.to_string(),
            campaign_id,
            drop_name,
            game_name,
            claimed_at: Utc::now(),
        });
    }

    pub fn claimed(&self) -> &[ClaimedDropRecord] {
        &self.claimed
    }
}

impl Default for DiscoveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::campaign::TimedDrop;
    use chrono::Duration as ChronoDuration;

    fn campaign(id: &str, game_id: &str, minutes: u32) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: id.to_string(),
            name: format!("campaign {id}"),
            game_id: game_id.to_string(),
            game_name: format!("game {game_id}"),
            start_at: now - ChronoDuration::hours(1),
            end_at: now + ChronoDuration::hours(1),
            account_linked: true,
            allowed_channels: Vec::new(),
            timed_drops: vec![TimedDrop {
                id: format!("{id}-d1"),
                name: "reward".to_string(),
                required_minutes: 60,
                current_minutes: minutes,
                is_claimed: false,
                precondition_ids: Vec::new(),
            }],
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let first = b.next_delay();
        let second = b.next_delay();
        let third = b.next_delay();
        assert!(first >= Duration::from_secs(5));
        assert!(second >= Duration::from_secs(10));
        assert!(third >= Duration::from_secs(20));
        // Far along, delays stay at the cap (plus bounded jitter).
        for _ in 0..10 {
            b.next_delay();
        }
        assert!(b.next_delay() <= Duration::from_secs(75));

        b.reset();
        assert!(b.next_delay() < Duration::from_secs(10));
    }

    #[test]
    fn failed_refresh_leaves_inventory_untouched_and_schedules_retry() {
        let mut inv = Inventory::new();
        let mut tracker = DiscoveryTracker::new();
        tracker.on_refresh_ok(&mut inv, vec![campaign("c1", "g1", 30)], Utc::now());
        assert!(inv.get_campaign("c1").is_some());

        let now = Instant::now();
        let delay = tracker.on_refresh_err(now);
        assert!(inv.get_campaign("c1").is_some());
        assert_eq!(
            inv.get_campaign("c1").unwrap().get_drop("c1-d1").unwrap().current_minutes,
            30
        );
        assert!(!tracker.should_refresh(now));
        assert!(tracker.should_refresh(now + delay));
    }

    #[test]
    fn refresh_success_resets_backoff() {
        let mut inv = Inventory::new();
        let mut tracker = DiscoveryTracker::new();
        tracker.on_refresh_err(Instant::now());
        tracker.on_refresh_err(Instant::now());
        tracker.on_refresh_ok(&mut inv, vec![], Utc::now());
        assert!(tracker.should_refresh(Instant::now()));
        assert_eq!(tracker.backoff.attempt(), 0);
    }

    #[test]
    fn progress_events_complete_drops_and_skip_stale() {
        let mut inv = Inventory::new();
        let mut tracker = DiscoveryTracker::new();
        tracker.on_refresh_ok(&mut inv, vec![campaign("c1", "g1", 50)], Utc::now());

        let completed = tracker.apply_progress_events(
            &mut inv,
            vec![
                // Stale: below stored 50, must be ignored.
                DropProgressEvent {
                    drop_id: "c1-d1".to_string(),
                    minutes: 10,
                },
                DropProgressEvent {
                    drop_id: "c1-d1".to_string(),
                    minutes: 60,
                },
            ],
        );
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].drop_id, "c1-d1");
        assert_eq!(completed[0].campaign_id, "c1");
    }

    #[test]
    fn pending_games_are_deduped_and_sorted() {
        let mut inv = Inventory::new();
        let mut tracker = DiscoveryTracker::new();
        let summary = tracker.on_refresh_ok(
            &mut inv,
            vec![
                campaign("c1", "g2", 0),
                campaign("c2", "g1", 0),
                campaign("c3", "g2", 0),
            ],
            Utc::now(),
        );
        assert_eq!(
            summary.pending_games,
            vec![
                ("g1".to_string(), "game g1".to_string()),
                ("g2".to_string(), "game g2".to_string()),
            ]
        );
    }
}
