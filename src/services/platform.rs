use async_trait::async_trait;

use crate::error::PlatformError;
use crate::models::campaign::Campaign;
use crate::models::channel::ChannelState;

/// Acknowledgment of a single keep-alive send. The engine applies an ack
/// only when both fields match the current watch target, so acks for a
/// superseded target can never leak into a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveAck {
    pub channel_id: String,
    pub sequence: u64,
}

/// A confirmed watch-minutes reading for one drop, as reported by the
/// platform since the previous poll.
#[derive(Debug, Clone)]
pub struct DropProgressEvent {
    pub drop_id: String,
    pub minutes: u32,
}

/// The transport capabilities the engine consumes. The engine owns no
/// transport details; implementations handle wire formats, endpoints and
/// credentials. Every method is expected to resolve within the caller's
/// timeout or return an error.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Full refresh of the campaign/drop inventory for this account.
    async fn fetch_campaigns(&self) -> Result<Vec<Campaign>, PlatformError>;

    /// Current live status for a set of known channel ids.
    async fn poll_channel_status(&self, ids: &[String])
        -> Result<Vec<ChannelState>, PlatformError>;

    /// Live, drops-enabled channels currently streaming the given game.
    async fn discover_channels(
        &self,
        game_id: &str,
        game_name: &str,
    ) -> Result<Vec<ChannelState>, PlatformError>;

    /// One lightweight "still watching" signal for the channel.
    async fn send_keepalive(
        &self,
        channel: &ChannelState,
        sequence: u64,
    ) -> Result<KeepaliveAck, PlatformError>;

    /// Watch-minutes confirmed by the platform since the last call.
    async fn report_progress_since_last_tick(
        &self,
    ) -> Result<Vec<DropProgressEvent>, PlatformError>;

    /// Claims a completed drop. Returns true when the reward is (now or
    /// already) claimed.
    async fn claim_drop(&self, campaign_id: &str, drop_id: &str) -> Result<bool, PlatformError>;
}
