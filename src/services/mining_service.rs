use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::config::MinerConfig;
use crate::error::PlatformError;
use crate::models::campaign::Campaign;
use crate::models::channel::ChannelState;
use crate::models::preferences::Preferences;
use crate::services::discovery_service::DiscoveryTracker;
use crate::services::eligibility_service::evaluate;
use crate::services::inventory_service::Inventory;
use crate::services::platform::{DropProgressEvent, KeepaliveAck, PlatformApi};
use crate::services::ranker_service::Ranker;
use crate::services::watch_service::{FailureVerdict, SessionPhase, WatchSession};

/// Control surface commands, delivered over the handle's channel so all
/// state stays on the loop task.
pub enum MinerCommand {
    Start,
    Stop,
    ReloadPreferences(Preferences),
    Status(oneshot::Sender<MinerStatus>),
    Shutdown,
}

/// Results of concurrently-issued I/O, funneled back into the loop before
/// any shared state is touched.
enum IoEvent {
    Campaigns(Result<Vec<Campaign>, PlatformError>),
    ChannelStatus(Result<Vec<ChannelState>, PlatformError>),
    Directory {
        game_name: String,
        result: Result<Vec<ChannelState>, PlatformError>,
    },
    Keepalive {
        channel_id: String,
        sequence: u64,
        result: Result<KeepaliveAck, PlatformError>,
    },
    Progress(Result<Vec<DropProgressEvent>, PlatformError>),
    Claimed {
        drop_id: String,
        result: Result<bool, PlatformError>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStatus {
    pub id: String,
    pub name: String,
    pub game_name: String,
    pub claimed_drops: usize,
    pub total_drops: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DropStatus {
    pub drop_id: String,
    pub name: String,
    pub campaign_name: String,
    pub game_name: String,
    pub current_minutes: u32,
    pub required_minutes: u32,
    pub remaining_minutes: u32,
    pub progress: f32,
}

/// Read-only snapshot for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct MinerStatus {
    pub running: bool,
    /// True after the platform rejected our credentials; cleared by start().
    pub halted: bool,
    pub phase: SessionPhase,
    pub watched_channel: Option<String>,
    pub watched_channel_id: Option<String>,
    pub current_campaign: Option<String>,
    pub last_keepalive_at: Option<DateTime<Utc>>,
    pub last_discovery_at: Option<DateTime<Utc>>,
    pub active_campaigns: Vec<CampaignStatus>,
    pub pending_drops: Vec<DropStatus>,
    pub claimed_drops: usize,
}

/// Cloneable handle to a running miner loop.
#[derive(Clone)]
pub struct MinerHandle {
    tx: mpsc::Sender<MinerCommand>,
}

impl MinerHandle {
    pub async fn start(&self) -> anyhow::Result<()> {
        self.send(MinerCommand::Start).await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(MinerCommand::Stop).await
    }

    pub async fn reload_preferences(&self, preferences: Preferences) -> anyhow::Result<()> {
        self.send(MinerCommand::ReloadPreferences(preferences)).await
    }

    pub async fn status(&self) -> anyhow::Result<MinerStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(MinerCommand::Status(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("miner loop dropped the status request"))
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.send(MinerCommand::Shutdown).await
    }

    async fn send(&self, cmd: MinerCommand) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("miner loop is no longer running"))
    }
}

/// The single coordinating loop. Owns the inventory, the watch session and
/// the cool-down registry outright; every mutation happens on this task, so
/// none of it needs a lock. External I/O runs on spawned tasks with their
/// own timeouts and reports back through `IoEvent`s.
pub struct MiningService {
    platform: Arc<dyn PlatformApi>,
    config: MinerConfig,
    preferences: Preferences,
    inventory: Inventory,
    session: WatchSession,
    ranker: Ranker,
    discovery: DiscoveryTracker,
    running: bool,
    halted: bool,
    io_tx: mpsc::Sender<IoEvent>,
    io_rx: mpsc::Receiver<IoEvent>,
    cmd_rx: mpsc::Receiver<MinerCommand>,
    keepalive_task: Option<JoinHandle<()>>,
    discovery_inflight: bool,
    status_poll_inflight: bool,
    progress_inflight: bool,
}

impl MiningService {
    pub fn new(platform: Arc<dyn PlatformApi>, config: MinerConfig) -> (Self, MinerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (io_tx, io_rx) = mpsc::channel(64);
        let preferences = config.preferences();
        let service = Self {
            platform,
            config,
            preferences,
            inventory: Inventory::new(),
            session: WatchSession::new(),
            ranker: Ranker::new(),
            discovery: DiscoveryTracker::new(),
            running: false,
            halted: false,
            io_tx,
            io_rx,
            cmd_rx,
            keepalive_task: None,
            discovery_inflight: false,
            status_poll_inflight: false,
            progress_inflight: false,
        };
        (service, MinerHandle { tx: cmd_tx })
    }

    /// Runs until `Shutdown` (or every handle is dropped). Three cadences
    /// interleave cooperatively; none blocks another past its own timeout.
    pub async fn run(mut self) {
        let mut keepalive_tick =
            interval(Duration::from_secs(self.config.keepalive_interval_secs.max(1)));
        let mut status_tick =
            interval(Duration::from_secs(self.config.status_poll_interval_secs.max(1)));
        let mut discovery_tick =
            interval(Duration::from_secs(self.config.discovery_interval_secs.max(1)));
        keepalive_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        discovery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = keepalive_tick.tick() => self.on_keepalive_tick(),
                _ = status_tick.tick() => self.on_status_tick(),
                _ = discovery_tick.tick() => self.on_discovery_tick(),
                Some(event) = self.io_rx.recv() => self.on_io_event(event),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(MinerCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
            }
        }
        // Shutdown: abandon in-flight work without waiting for acks.
        self.abort_keepalive();
        self.session.stop();
        info!("[Miner] loop terminated");
    }

    fn on_command(&mut self, cmd: MinerCommand) {
        match cmd {
            MinerCommand::Start => {
                self.halted = false;
                if !self.running {
                    self.running = true;
                    info!("[Miner] mining started");
                    self.trigger_discovery();
                }
            }
            MinerCommand::Stop => {
                if self.running {
                    info!("[Miner] mining stopped");
                }
                self.running = false;
                self.abort_keepalive();
                self.session.stop();
            }
            MinerCommand::ReloadPreferences(preferences) => {
                info!(
                    "[Miner] preferences reloaded ({} priority, {} excluded)",
                    preferences.priority_games.len(),
                    preferences.excluded_games.len()
                );
                self.preferences = preferences;
                self.reselect();
            }
            MinerCommand::Status(reply) => {
                let _ = reply.send(self.build_status());
            }
            MinerCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    // Fast cadence: one keep-alive per tick while a target exists. Only one
    // send is ever outstanding; a slow one is not stacked on.
    fn on_keepalive_tick(&mut self) {
        if !self.running || self.halted {
            return;
        }
        let Some(target) = self.session.target().cloned() else {
            return;
        };
        if let Some(task) = &self.keepalive_task {
            if !task.is_finished() {
                return;
            }
        }
        let sequence = self.session.next_sequence();
        self.spawn_keepalive(target, sequence);
    }

    // Medium cadence: re-check channel liveness, retry selection while
    // idle, and poll confirmed progress while a session exists.
    fn on_status_tick(&mut self) {
        if !self.running || self.halted {
            return;
        }
        self.ranker.purge_cooldowns(Instant::now());
        if self.session.target().is_none() {
            self.reselect();
        }
        if !self.status_poll_inflight {
            let ids = self.inventory.channel_ids();
            if !ids.is_empty() {
                self.status_poll_inflight = true;
                let platform = self.platform.clone();
                let io_tx = self.io_tx.clone();
                let limit = Duration::from_secs(self.config.request_timeout_secs);
                tokio::spawn(async move {
                    let result = match timeout(limit, platform.poll_channel_status(&ids)).await {
                        Ok(result) => result,
                        Err(_) => Err(PlatformError::Timeout(limit)),
                    };
                    let _ = io_tx.send(IoEvent::ChannelStatus(result)).await;
                });
            }
        }
        if !self.progress_inflight && self.session.target().is_some() {
            self.progress_inflight = true;
            let platform = self.platform.clone();
            let io_tx = self.io_tx.clone();
            let limit = Duration::from_secs(self.config.request_timeout_secs);
            tokio::spawn(async move {
                let result =
                    match timeout(limit, platform.report_progress_since_last_tick()).await {
                        Ok(result) => result,
                        Err(_) => Err(PlatformError::Timeout(limit)),
                    };
                let _ = io_tx.send(IoEvent::Progress(result)).await;
            });
        }
    }

    // Slow cadence: full campaign refresh, gated by the failure backoff.
    fn on_discovery_tick(&mut self) {
        if !self.running || self.halted {
            return;
        }
        self.trigger_discovery();
    }

    fn trigger_discovery(&mut self) {
        if self.discovery_inflight || !self.discovery.should_refresh(Instant::now()) {
            return;
        }
        self.discovery_inflight = true;
        let platform = self.platform.clone();
        let io_tx = self.io_tx.clone();
        let limit = Duration::from_secs(self.config.request_timeout_secs);
        tokio::spawn(async move {
            let result = match timeout(limit, platform.fetch_campaigns()).await {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Timeout(limit)),
            };
            let _ = io_tx.send(IoEvent::Campaigns(result)).await;
        });
    }

    fn on_io_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Campaigns(result) => {
                self.discovery_inflight = false;
                match result {
                    Ok(campaigns) => {
                        let summary =
                            self.discovery
                                .on_refresh_ok(&mut self.inventory, campaigns, Utc::now());
                        self.seed_acl_channels();
                        self.seed_directory(summary.pending_games);
                        self.revalidate_session();
                        self.reselect();
                    }
                    Err(err) if err.is_fatal() => self.halt(),
                    Err(err) => {
                        warn!("[Miner] campaign refresh failed: {err}");
                        self.discovery.on_refresh_err(Instant::now());
                    }
                }
            }
            IoEvent::ChannelStatus(result) => {
                self.status_poll_inflight = false;
                match result {
                    Ok(channels) => {
                        for channel in channels {
                            self.inventory.upsert_channel(channel);
                        }
                        self.revalidate_session();
                        self.reselect();
                    }
                    Err(err) if err.is_fatal() => self.halt(),
                    Err(err) => warn!("[Miner] status poll failed: {err}"),
                }
            }
            IoEvent::Directory { game_name, result } => match result {
                Ok(channels) => {
                    debug!(
                        "[Miner] directory found {} live channels for {game_name}",
                        channels.len()
                    );
                    for channel in channels {
                        self.inventory.upsert_channel(channel);
                    }
                    self.reselect();
                }
                Err(err) if err.is_fatal() => self.halt(),
                Err(err) => warn!("[Miner] directory fetch for {game_name} failed: {err}"),
            },
            IoEvent::Keepalive {
                channel_id,
                sequence,
                result,
            } => match result {
                Ok(ack) => {
                    let activated = self.session.on_keepalive_ack(&ack.channel_id, ack.sequence);
                    if activated {
                        debug!("[Miner] keep-alive confirmed, minutes accruing");
                    }
                }
                Err(err) if err.is_fatal() => self.halt(),
                Err(err) => {
                    debug!("[Miner] keep-alive for {channel_id} failed: {err}");
                    let verdict = self.session.on_keepalive_fail(
                        &channel_id,
                        sequence,
                        self.config.keepalive_retry_budget,
                    );
                    if verdict == FailureVerdict::BudgetExhausted {
                        self.ranker.cool_down(
                            &channel_id,
                            Duration::from_secs(self.config.candidate_cooldown_secs),
                        );
                        self.abort_keepalive();
                        self.session.invalidate();
                        self.reselect();
                    }
                }
            },
            IoEvent::Progress(result) => {
                self.progress_inflight = false;
                match result {
                    Ok(events) => {
                        let completed = self
                            .discovery
                            .apply_progress_events(&mut self.inventory, events);
                        if !completed.is_empty() {
                            if self.config.auto_claim_drops {
                                for drop in &completed {
                                    debug!(
                                        "[Miner] claiming {} ({})",
                                        drop.name, drop.drop_id
                                    );
                                    self.spawn_claim(
                                        drop.campaign_id.clone(),
                                        drop.drop_id.clone(),
                                    );
                                }
                            }
                            // A completed drop changes eligibility for its
                            // campaign; the watched channel may no longer
                            // be the best choice.
                            self.revalidate_session();
                            self.reselect();
                        }
                    }
                    Err(err) if err.is_fatal() => self.halt(),
                    Err(err) => warn!("[Miner] progress poll failed: {err}"),
                }
            }
            IoEvent::Claimed { drop_id, result } => match result {
                Ok(true) => {
                    self.inventory.mark_claimed(&drop_id);
                    self.discovery.record_claim(&self.inventory, &drop_id);
                    info!("[Miner] claimed drop {drop_id}");
                }
                Ok(false) => warn!("[Miner] claim for {drop_id} was refused"),
                Err(err) if err.is_fatal() => self.halt(),
                Err(err) => warn!("[Miner] claim for {drop_id} failed: {err}"),
            },
        }
    }

    /// Re-runs ranking and retargets the session when a better candidate
    /// exists. The ranker itself prefers the current target within its
    /// priority rank, so switches only happen for a real improvement.
    fn reselect(&mut self) {
        if !self.running || self.halted {
            return;
        }
        let pick = self.ranker.pick_best(
            &self.inventory,
            &self.preferences,
            self.session.target_id(),
            Utc::now(),
            Instant::now(),
        );
        match pick {
            Some(candidate) => {
                if self.session.target_id() == Some(candidate.channel.id.as_str()) {
                    return;
                }
                // The superseded target's in-flight keep-alive dies here;
                // its late result is also rejected by the sequence check.
                self.abort_keepalive();
                let channel = candidate.channel.clone();
                self.session
                    .begin_switch(candidate.channel, candidate.campaign_id);
                let sequence = self.session.next_sequence();
                self.spawn_keepalive(channel, sequence);
            }
            None => {
                if self.session.target().is_some() {
                    self.abort_keepalive();
                    self.session.invalidate();
                }
                debug!("[Miner] no eligible channel, idling until the next poll");
            }
        }
    }

    /// Invalidates the session if the watched channel went offline or lost
    /// eligibility since the last evaluation.
    fn revalidate_session(&mut self) {
        let Some(target_id) = self.session.target_id().map(String::from) else {
            return;
        };
        let still_good = match self.inventory.get_channel(&target_id) {
            Some(channel) => {
                evaluate(channel, &self.inventory, &self.preferences, Utc::now()).is_eligible()
            }
            None => false,
        };
        if !still_good {
            self.abort_keepalive();
            self.session.invalidate();
        }
    }

    /// ACL channels from campaign allow-lists enter the channel set as
    /// unknown-status entries so the medium-cadence poll resolves them.
    fn seed_acl_channels(&mut self) {
        let now = Utc::now();
        let mut seeds: Vec<ChannelState> = Vec::new();
        for campaign in self.inventory.campaigns() {
            if !campaign.is_active(now) || !campaign.account_linked {
                continue;
            }
            for acl in &campaign.allowed_channels {
                if self.inventory.get_channel(&acl.id).is_none() {
                    let mut seed = ChannelState::offline(acl.id.clone(), acl.name.clone());
                    seed.acl_based = true;
                    seeds.push(seed);
                }
            }
        }
        for seed in seeds {
            self.inventory.upsert_channel(seed);
        }
    }

    fn seed_directory(&mut self, pending_games: Vec<(String, String)>) {
        for (game_id, game_name) in pending_games {
            if !self.preferences.allows(&game_name) {
                continue;
            }
            let platform = self.platform.clone();
            let io_tx = self.io_tx.clone();
            let limit = Duration::from_secs(self.config.request_timeout_secs);
            tokio::spawn(async move {
                let result =
                    match timeout(limit, platform.discover_channels(&game_id, &game_name)).await {
                        Ok(result) => result,
                        Err(_) => Err(PlatformError::Timeout(limit)),
                    };
                let _ = io_tx.send(IoEvent::Directory { game_name, result }).await;
            });
        }
    }

    fn spawn_keepalive(&mut self, channel: ChannelState, sequence: u64) {
        let platform = self.platform.clone();
        let io_tx = self.io_tx.clone();
        let limit = Duration::from_secs(self.config.keepalive_timeout_secs);
        let handle = tokio::spawn(async move {
            let result = match timeout(limit, platform.send_keepalive(&channel, sequence)).await {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Timeout(limit)),
            };
            let _ = io_tx
                .send(IoEvent::Keepalive {
                    channel_id: channel.id,
                    sequence,
                    result,
                })
                .await;
        });
        self.keepalive_task = Some(handle);
    }

    fn spawn_claim(&self, campaign_id: String, drop_id: String) {
        let platform = self.platform.clone();
        let io_tx = self.io_tx.clone();
        let limit = Duration::from_secs(self.config.request_timeout_secs);
        tokio::spawn(async move {
            let result = match timeout(limit, platform.claim_drop(&campaign_id, &drop_id)).await {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Timeout(limit)),
            };
            let _ = io_tx.send(IoEvent::Claimed { drop_id, result }).await;
        });
    }

    fn abort_keepalive(&mut self) {
        if let Some(task) = self.keepalive_task.take() {
            task.abort();
        }
    }

    /// Credential rejection: stop all scheduling and wait for an external
    /// re-authentication followed by start(). Retrying on our own with a
    /// dead token risks a lockout.
    fn halt(&mut self) {
        if self.halted {
            return;
        }
        error!("[Miner] the platform rejected our credentials; halting until restarted");
        self.halted = true;
        self.abort_keepalive();
        self.session.stop();
    }

    fn build_status(&self) -> MinerStatus {
        let now = Utc::now();
        let mut active_campaigns: Vec<CampaignStatus> = Vec::new();
        let mut pending_drops: Vec<DropStatus> = Vec::new();
        for campaign in self.inventory.campaigns() {
            if !campaign.is_active(now) {
                continue;
            }
            active_campaigns.push(CampaignStatus {
                id: campaign.id.clone(),
                name: campaign.name.clone(),
                game_name: campaign.game_name.clone(),
                claimed_drops: campaign.claimed_count(),
                total_drops: campaign.timed_drops.len(),
            });
            for drop in campaign.pending_drops() {
                pending_drops.push(DropStatus {
                    drop_id: drop.id.clone(),
                    name: drop.name.clone(),
                    campaign_name: campaign.name.clone(),
                    game_name: campaign.game_name.clone(),
                    current_minutes: drop.current_minutes,
                    required_minutes: drop.required_minutes,
                    remaining_minutes: drop.remaining_minutes(),
                    progress: drop.progress(),
                });
            }
        }
        active_campaigns.sort_by(|a, b| a.id.cmp(&b.id));
        pending_drops.sort_by(|a, b| a.drop_id.cmp(&b.drop_id));

        MinerStatus {
            running: self.running,
            halted: self.halted,
            phase: self.session.phase(),
            watched_channel: self.session.target().map(|c| c.name().to_string()),
            watched_channel_id: self.session.target_id().map(String::from),
            current_campaign: self
                .session
                .campaign_id()
                .and_then(|id| self.inventory.get_campaign(id))
                .map(|c| c.name.clone()),
            last_keepalive_at: self.session.last_ack_at(),
            last_discovery_at: self.discovery.last_refresh(),
            active_campaigns,
            pending_drops,
            claimed_drops: self.discovery.claimed().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::campaign::TimedDrop;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakePlatform {
        campaigns: Mutex<Vec<Campaign>>,
        directory: Mutex<HashMap<String, Vec<ChannelState>>>,
        channels: Mutex<Vec<ChannelState>>,
        progress: Mutex<Vec<DropProgressEvent>>,
        keepalive_ok: AtomicBool,
        reject_auth: AtomicBool,
        fail_campaigns: AtomicBool,
        fetch_calls: AtomicUsize,
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                campaigns: Mutex::new(Vec::new()),
                directory: Mutex::new(HashMap::new()),
                channels: Mutex::new(Vec::new()),
                progress: Mutex::new(Vec::new()),
                keepalive_ok: AtomicBool::new(true),
                reject_auth: AtomicBool::new(false),
                fail_campaigns: AtomicBool::new(false),
                fetch_calls: AtomicUsize::new(0),
            }
        }

        fn set_channel_live(&self, id: &str, live: bool) {
            let mut channels = self.channels.lock().unwrap();
            for ch in channels.iter_mut() {
                if ch.id == id {
                    ch.live = live;
                    if !live {
                        ch.game_id = None;
                        ch.game_name = None;
                        ch.viewers = 0;
                    }
                }
            }
        }
    }

    #[async_trait::async_trait]
    impl PlatformApi for FakePlatform {
        async fn fetch_campaigns(&self) -> Result<Vec<Campaign>, PlatformError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_auth.load(Ordering::SeqCst) {
                return Err(PlatformError::AuthRejected);
            }
            if self.fail_campaigns.load(Ordering::SeqCst) {
                return Err(PlatformError::Transient("refresh refused".to_string()));
            }
            Ok(self.campaigns.lock().unwrap().clone())
        }

        async fn poll_channel_status(
            &self,
            ids: &[String],
        ) -> Result<Vec<ChannelState>, PlatformError> {
            let channels = self.channels.lock().unwrap();
            Ok(channels
                .iter()
                .filter(|c| ids.contains(&c.id))
                .cloned()
                .collect())
        }

        async fn discover_channels(
            &self,
            game_id: &str,
            _game_name: &str,
        ) -> Result<Vec<ChannelState>, PlatformError> {
            let directory = self.directory.lock().unwrap();
            Ok(directory.get(game_id).cloned().unwrap_or_default())
        }

        async fn send_keepalive(
            &self,
            channel: &ChannelState,
            sequence: u64,
        ) -> Result<KeepaliveAck, PlatformError> {
            if self.keepalive_ok.load(Ordering::SeqCst) {
                Ok(KeepaliveAck {
                    channel_id: channel.id.clone(),
                    sequence,
                })
            } else {
                Err(PlatformError::Transient("keep-alive refused".to_string()))
            }
        }

        async fn report_progress_since_last_tick(
            &self,
        ) -> Result<Vec<DropProgressEvent>, PlatformError> {
            Ok(std::mem::take(&mut *self.progress.lock().unwrap()))
        }

        async fn claim_drop(
            &self,
            _campaign_id: &str,
            _drop_id: &str,
        ) -> Result<bool, PlatformError> {
            Ok(true)
        }
    }

    fn campaign(id: &str, game_id: &str, game_name: &str) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: id.to_string(),
            name: format!("campaign {id}"),
            game_id: game_id.to_string(),
            game_name: game_name.to_string(),
            start_at: now - ChronoDuration::hours(1),
            end_at: now + ChronoDuration::hours(1),
            account_linked: true,
            allowed_channels: Vec::new(),
            timed_drops: vec![TimedDrop {
                id: format!("{id}-d1"),
                name: "reward".to_string(),
                required_minutes: 60,
                current_minutes: 0,
                is_claimed: false,
                precondition_ids: Vec::new(),
            }],
        }
    }

    fn live_channel(id: &str, game_id: &str, game_name: &str, viewers: u32) -> ChannelState {
        let mut ch = ChannelState::offline(id, id);
        ch.live = true;
        ch.game_id = Some(game_id.to_string());
        ch.game_name = Some(game_name.to_string());
        ch.viewers = viewers;
        ch.drops_enabled = true;
        ch
    }

    fn test_config() -> MinerConfig {
        MinerConfig {
            keepalive_interval_secs: 1,
            status_poll_interval_secs: 1,
            discovery_interval_secs: 1,
            request_timeout_secs: 5,
            keepalive_timeout_secs: 5,
            keepalive_retry_budget: 3,
            candidate_cooldown_secs: 600,
            ..MinerConfig::default()
        }
    }

    async fn wait_for<F>(handle: &MinerHandle, mut pred: F) -> MinerStatus
    where
        F: FnMut(&MinerStatus) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let status = handle.status().await.expect("status");
            if pred(&status) {
                return status;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached; last status: {status:?}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn discovers_selects_and_activates() {
        let fake = Arc::new(FakePlatform::new());
        *fake.campaigns.lock().unwrap() = vec![campaign("c1", "g1", "Game One")];
        let ch = live_channel("ch1", "g1", "Game One", 100);
        fake.directory
            .lock()
            .unwrap()
            .insert("g1".to_string(), vec![ch.clone()]);
        *fake.channels.lock().unwrap() = vec![ch];

        let (service, handle) = MiningService::new(fake.clone(), test_config());
        let task = tokio::spawn(service.run());
        handle.start().await.unwrap();

        let status = wait_for(&handle, |s| s.phase == SessionPhase::Active).await;
        assert_eq!(status.watched_channel_id.as_deref(), Some("ch1"));
        assert_eq!(status.current_campaign.as_deref(), Some("campaign c1"));
        assert!(status.last_keepalive_at.is_some());
        assert_eq!(status.active_campaigns.len(), 1);
        assert_eq!(status.pending_drops.len(), 1);

        handle.shutdown().await.unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn offline_target_falls_back_to_next_priority() {
        let fake = Arc::new(FakePlatform::new());
        *fake.campaigns.lock().unwrap() = vec![
            campaign("ca", "ga", "Game A"),
            campaign("cb", "gb", "Game B"),
        ];
        let ch_a = live_channel("ch-a", "ga", "Game A", 10);
        let ch_b = live_channel("ch-b", "gb", "Game B", 10);
        {
            let mut dir = fake.directory.lock().unwrap();
            dir.insert("ga".to_string(), vec![ch_a.clone()]);
            dir.insert("gb".to_string(), vec![ch_b.clone()]);
        }
        *fake.channels.lock().unwrap() = vec![ch_a, ch_b];

        let mut config = test_config();
        config.priority_games = vec!["Game A".to_string(), "Game B".to_string()];
        let (service, handle) = MiningService::new(fake.clone(), config);
        let task = tokio::spawn(service.run());
        handle.start().await.unwrap();

        let status =
            wait_for(&handle, |s| s.watched_channel_id.as_deref() == Some("ch-a")).await;
        assert_eq!(status.phase, SessionPhase::Active);

        // The priority channel drops offline; the next poll must move the
        // session to Game B's channel.
        fake.set_channel_live("ch-a", false);
        fake.directory.lock().unwrap().remove("ga");
        let status =
            wait_for(&handle, |s| s.watched_channel_id.as_deref() == Some("ch-b")).await;
        assert_eq!(status.phase, SessionPhase::Active);

        handle.shutdown().await.unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn keepalive_budget_exhaustion_idles_and_cools_down() {
        let fake = Arc::new(FakePlatform::new());
        fake.keepalive_ok.store(false, Ordering::SeqCst);
        *fake.campaigns.lock().unwrap() = vec![campaign("c1", "g1", "Game One")];
        let ch = live_channel("ch1", "g1", "Game One", 100);
        fake.directory
            .lock()
            .unwrap()
            .insert("g1".to_string(), vec![ch.clone()]);
        *fake.channels.lock().unwrap() = vec![ch];

        let (service, handle) = MiningService::new(fake.clone(), test_config());
        let task = tokio::spawn(service.run());
        handle.start().await.unwrap();

        // The candidate is picked and the session enters Switching.
        let status =
            wait_for(&handle, |s| s.watched_channel_id.as_deref() == Some("ch1")).await;
        assert_eq!(status.phase, SessionPhase::Switching);

        // Three consecutive failures exhaust the budget; the only candidate
        // is cooled down, so the session must end up Idle with no target
        // and stay there.
        let status = wait_for(&handle, |s| {
            s.phase == SessionPhase::Idle && s.watched_channel_id.is_none() && s.running
        })
        .await;
        assert!(status.watched_channel.is_none());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.phase, SessionPhase::Idle);

        handle.shutdown().await.unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn discovery_failure_keeps_session_active_on_stale_inventory() {
        let fake = Arc::new(FakePlatform::new());
        *fake.campaigns.lock().unwrap() = vec![campaign("c1", "g1", "Game One")];
        let ch = live_channel("ch1", "g1", "Game One", 100);
        fake.directory
            .lock()
            .unwrap()
            .insert("g1".to_string(), vec![ch.clone()]);
        *fake.channels.lock().unwrap() = vec![ch];

        let (service, handle) = MiningService::new(fake.clone(), test_config());
        let task = tokio::spawn(service.run());
        handle.start().await.unwrap();
        wait_for(&handle, |s| s.phase == SessionPhase::Active).await;

        // Every refresh from here on fails; the loop must keep mining on
        // the inventory it already has.
        fake.fail_campaigns.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.phase, SessionPhase::Active);
        assert_eq!(status.watched_channel_id.as_deref(), Some("ch1"));
        assert_eq!(status.active_campaigns.len(), 1);
        assert_eq!(status.pending_drops.len(), 1);

        handle.shutdown().await.unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn auth_rejection_halts_scheduling() {
        let fake = Arc::new(FakePlatform::new());
        fake.reject_auth.store(true, Ordering::SeqCst);

        let (service, handle) = MiningService::new(fake.clone(), test_config());
        let task = tokio::spawn(service.run());
        handle.start().await.unwrap();

        wait_for(&handle, |s| s.halted).await;
        let calls_at_halt = fake.fetch_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        // Halted means halted: no further discovery attempts.
        assert_eq!(fake.fetch_calls.load(Ordering::SeqCst), calls_at_halt);

        // start() after external re-authentication resumes scheduling.
        fake.reject_auth.store(false, Ordering::SeqCst);
        handle.start().await.unwrap();
        wait_for(&handle, |s| !s.halted && s.running).await;

        handle.shutdown().await.unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn stop_and_start_are_idempotent() {
        let fake = Arc::new(FakePlatform::new());
        let (service, handle) = MiningService::new(fake.clone(), test_config());
        let task = tokio::spawn(service.run());

        handle.start().await.unwrap();
        handle.start().await.unwrap();
        let status = wait_for(&handle, |s| s.running).await;
        assert_eq!(status.phase, SessionPhase::Idle);

        handle.stop().await.unwrap();
        handle.stop().await.unwrap();
        let status = wait_for(&handle, |s| !s.running).await;
        assert_eq!(status.phase, SessionPhase::Idle);
        assert!(status.watched_channel.is_none());

        handle.shutdown().await.unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn preference_reload_drops_excluded_target() {
        let fake = Arc::new(FakePlatform::new());
        *fake.campaigns.lock().unwrap() = vec![campaign("c1", "g1", "Game One")];
        let ch = live_channel("ch1", "g1", "Game One", 100);
        fake.directory
            .lock()
            .unwrap()
            .insert("g1".to_string(), vec![ch.clone()]);
        *fake.channels.lock().unwrap() = vec![ch];

        let (service, handle) = MiningService::new(fake.clone(), test_config());
        let task = tokio::spawn(service.run());
        handle.start().await.unwrap();
        wait_for(&handle, |s| s.phase == SessionPhase::Active).await;

        // Excluding the watched game must end the session on the next
        // selection pass.
        let prefs = Preferences {
            excluded_games: ["Game One".to_string()].into_iter().collect(),
            ..Preferences::default()
        };
        handle.reload_preferences(prefs).await.unwrap();
        let status = wait_for(&handle, |s| {
            s.phase == SessionPhase::Idle && s.watched_channel_id.is_none()
        })
        .await;
        assert!(status.running);

        handle.shutdown().await.unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn completed_drop_is_claimed_and_reflected_in_status() {
        let fake = Arc::new(FakePlatform::new());
        *fake.campaigns.lock().unwrap() = vec![campaign("c1", "g1", "Game One")];
        let ch = live_channel("ch1", "g1", "Game One", 100);
        fake.directory
            .lock()
            .unwrap()
            .insert("g1".to_string(), vec![ch.clone()]);
        *fake.channels.lock().unwrap() = vec![ch];

        let (service, handle) = MiningService::new(fake.clone(), test_config());
        let task = tokio::spawn(service.run());
        handle.start().await.unwrap();
        wait_for(&handle, |s| s.phase == SessionPhase::Active).await;

        // The platform confirms the threshold was reached.
        fake.progress.lock().unwrap().push(DropProgressEvent {
            drop_id: "c1-d1".to_string(),
            minutes: 60,
        });

        // The campaign's only drop finishes: the channel loses eligibility
        // and the claim lands in the status counters.
        let status = wait_for(&handle, |s| s.claimed_drops == 1).await;
        assert!(status.pending_drops.is_empty());
        wait_for(&handle, |s| s.watched_channel_id.is_none()).await;

        handle.shutdown().await.unwrap();
        let _ = task.await;
    }
}
