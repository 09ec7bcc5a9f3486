use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::models::channel::ChannelState;

/// Where the single watch session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No target.
    Idle,
    /// Target chosen, first keep-alive not yet acknowledged.
    Switching,
    /// Keep-alive confirmed, minutes accruing.
    Active,
}

/// Outcome of a keep-alive failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// The result belonged to a superseded target or sequence.
    Ignored,
    /// Within budget; keep trying on the next fast tick.
    Retrying(u32),
    /// Budget exhausted; the caller must cool the candidate down and
    /// re-select.
    BudgetExhausted,
}

/// The one watch session in the process. Owned exclusively by the mining
/// loop; every transition passes through here, which is what preserves the
/// at-most-one-concurrent-session invariant.
pub struct WatchSession {
    phase: SessionPhase,
    target: Option<ChannelState>,
    campaign_id: Option<String>,
    /// Next keep-alive sequence for the current target. Resets to 0 on
    /// every switch so acknowledgments can never cross targets.
    sequence: u64,
    last_ack_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl WatchSession {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            target: None,
            campaign_id: None,
            sequence: 0,
            last_ack_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn target(&self) -> Option<&ChannelState> {
        self.target.as_ref()
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target.as_ref().map(|c| c.id.as_str())
    }

    pub fn campaign_id(&self) -> Option<&str> {
        self.campaign_id.as_deref()
    }

    pub fn last_ack_at(&self) -> Option<DateTime<Utc>> {
        self.last_ack_at
    }

    /// Points the session at a new target and resets all per-target state.
    /// Idle -> Switching, or a direct retarget from Switching/Active.
    pub fn begin_switch(&mut self, channel: ChannelState, campaign_id: String) {
        if let Some(prev) = &self.target {
            if prev.id != channel.id {
                info!(
                    "[Watch] switching {} -> {} (campaign {campaign_id})",
                    prev.name(),
                    channel.name()
                );
            }
        } else {
            info!("[Watch] watching {} (campaign {campaign_id})", channel.name());
        }
        self.phase = SessionPhase::Switching;
        self.target = Some(channel);
        self.campaign_id = Some(campaign_id);
        self.sequence = 0;
        self.last_ack_at = None;
        self.consecutive_failures = 0;
    }

    /// Sequence number for the next keep-alive send. Increments per call.
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }

    /// Applies an acknowledgment if it matches the current target and a
    /// sequence issued for it. Returns true when the session just became
    /// `Active`.
    pub fn on_keepalive_ack(&mut self, channel_id: &str, sequence: u64) -> bool {
        if self.target_id() != Some(channel_id) || sequence >= self.sequence {
            debug!(
                "[Watch] discarding stale ack for {channel_id} seq {sequence} \
                 (current target {:?})",
                self.target_id()
            );
            return false;
        }
        self.consecutive_failures = 0;
        self.last_ack_at = Some(Utc::now());
        if self.phase == SessionPhase::Switching {
            self.phase = SessionPhase::Active;
            if let Some(t) = &self.target {
                info!("[Watch] session active on {}", t.name());
            }
            return true;
        }
        false
    }

    /// Records a keep-alive failure. Failures count in both `Switching`
    /// and `Active`; past the budget the session must be torn down rather
    /// than retried forever.
    pub fn on_keepalive_fail(
        &mut self,
        channel_id: &str,
        sequence: u64,
        budget: u32,
    ) -> FailureVerdict {
        if self.target_id() != Some(channel_id) || sequence >= self.sequence {
            return FailureVerdict::Ignored;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= budget {
            warn!(
                "[Watch] {channel_id} failed {} keep-alives, giving up on it",
                self.consecutive_failures
            );
            FailureVerdict::BudgetExhausted
        } else {
            debug!(
                "[Watch] keep-alive failure {}/{budget} for {channel_id}",
                self.consecutive_failures
            );
            FailureVerdict::Retrying(self.consecutive_failures)
        }
    }

    /// Tears the session down (target offline, eligibility lost, or budget
    /// exhausted) and returns the abandoned target. The caller re-runs the
    /// ranker immediately; invalidation is never a resting state.
    pub fn invalidate(&mut self) -> Option<ChannelState> {
        let old = self.target.take();
        if let Some(ch) = &old {
            info!("[Watch] session on {} invalidated", ch.name());
        }
        self.reset();
        old
    }

    /// Explicit stop: any state -> Idle.
    pub fn stop(&mut self) {
        if self.target.is_some() {
            info!("[Watch] session stopped");
        }
        self.target = None;
        self.reset();
    }

    fn reset(&mut self) {
        self.phase = SessionPhase::Idle;
        self.campaign_id = None;
        self.sequence = 0;
        self.last_ack_at = None;
        self.consecutive_failures = 0;
    }
}

impl Default for WatchSession {
    fn default() -> Self {
        Self::new()
    }
}
