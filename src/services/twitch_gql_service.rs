use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::config::MinerConfig;
use crate::error::PlatformError;
use crate::models::campaign::{AclChannel, Campaign, TimedDrop};
use crate::models::channel::ChannelState;
use crate::services::platform::{DropProgressEvent, KeepaliveAck, PlatformApi};

const GQL_URL: &str = "https://gql.twitch.tv/gql";
const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

static SPADE_URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""spade_?url": ?"(https://video-edge-[.\w\-/]+\.ts(?:\?[^"]*)?)""#)
        .expect("hard-coded pattern")
});
static SETTINGS_JS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"src="(https://[\w.]+/config/settings\.[0-9a-f]{32}\.js)""#)
        .expect("hard-coded pattern")
});

#[derive(Debug, Deserialize)]
struct GqlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GqlError>>,
}

#[derive(Debug, Deserialize)]
struct GqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct DropCampaignsData {
    #[serde(rename = "currentUser")]
    current_user: Option<CurrentUserCampaigns>,
}

#[derive(Debug, Deserialize)]
struct CurrentUserCampaigns {
    #[serde(rename = "dropCampaigns")]
    drop_campaigns: Option<Vec<GqlDropCampaign>>,
}

#[derive(Debug, Deserialize)]
struct GqlDropCampaign {
    id: String,
    name: String,
    game: GqlGame,
    #[serde(rename = "startAt")]
    start_at: String,
    #[serde(rename = "endAt")]
    end_at: String,
    #[serde(default)]
    allow: Option<GqlAllow>,
    #[serde(rename = "self", default)]
    self_edge: Option<GqlCampaignSelf>,
    #[serde(rename = "timeBasedDrops", default)]
    time_based_drops: Vec<GqlTimeBasedDrop>,
}

#[derive(Debug, Deserialize)]
struct GqlGame {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GqlAllow {
    #[serde(default)]
    channels: Option<Vec<GqlAllowChannel>>,
    #[serde(rename = "isEnabled", default)]
    is_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct GqlAllowChannel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GqlCampaignSelf {
    #[serde(rename = "isAccountConnected", default)]
    is_account_connected: bool,
}

#[derive(Debug, Deserialize)]
struct GqlTimeBasedDrop {
    id: String,
    name: String,
    #[serde(rename = "requiredMinutesWatched")]
    required_minutes_watched: u32,
    #[serde(rename = "preconditionDrops", default)]
    precondition_drops: Option<Vec<GqlPreconditionDrop>>,
    #[serde(rename = "self", default)]
    self_edge: Option<GqlDropSelf>,
}

#[derive(Debug, Deserialize)]
struct GqlPreconditionDrop {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GqlDropSelf {
    #[serde(rename = "currentMinutesWatched", default)]
    current_minutes_watched: u32,
    #[serde(rename = "isClaimed", default)]
    is_claimed: bool,
}

#[derive(Debug, Deserialize)]
struct InventoryData {
    #[serde(rename = "currentUser")]
    current_user: Option<CurrentUserInventory>,
}

#[derive(Debug, Deserialize)]
struct CurrentUserInventory {
    inventory: Option<GqlInventory>,
}

#[derive(Debug, Deserialize)]
struct GqlInventory {
    #[serde(rename = "dropCampaignsInProgress", default)]
    drop_campaigns_in_progress: Option<Vec<GqlInventoryCampaign>>,
}

#[derive(Debug, Deserialize)]
struct GqlInventoryCampaign {
    #[serde(rename = "timeBasedDrops", default)]
    time_based_drops: Vec<GqlTimeBasedDrop>,
}

/// Talks to the platform's GraphQL endpoint and the spade telemetry sink.
/// This is the only module that knows wire formats; the engine sees it
/// purely through `PlatformApi`.
pub struct TwitchGqlService {
    client: Client,
    client_id: String,
    token: String,
    /// From token validation; fetched once and reused in watch payloads.
    user_id: RwLock<Option<String>>,
    /// Per-channel telemetry endpoint; re-extracted when the target
    /// changes.
    spade_url: RwLock<Option<(String, String)>>,
    directory_page_size: u32,
}

impl TwitchGqlService {
    pub fn new(config: &MinerConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            client_id: config.client_id.clone(),
            token: config.auth_token.clone(),
            user_id: RwLock::new(None),
            spade_url: RwLock::new(None),
            directory_page_size: config.directory_page_size,
        }
    }

    async fn gql(&self, body: serde_json::Value) -> Result<serde_json::Value, PlatformError> {
        let response = self
            .client
            .post(GQL_URL)
            .header("Client-Id", &self.client_id)
            .header(AUTHORIZATION, format!("OAuth {}", self.token))
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(PlatformError::AuthRejected);
        }
        if !status.is_success() {
            return Err(PlatformError::Transient(format!("GQL returned {status}")));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PlatformError::BadResponse(e.to_string()))?;
        Ok(value)
    }

    async fn gql_typed<T: serde::de::DeserializeOwned>(
        &self,
        body: serde_json::Value,
    ) -> Result<T, PlatformError> {
        let value = self.gql(body).await?;
        let parsed: GqlResponse<T> = serde_json::from_value(value)
            .map_err(|e| PlatformError::BadResponse(e.to_string()))?;
        if let Some(errors) = parsed.errors {
            if !errors.is_empty() {
                let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
                return Err(PlatformError::BadResponse(format!(
                    "GraphQL errors: {}",
                    messages.join("; ")
                )));
            }
        }
        parsed
            .data
            .ok_or_else(|| PlatformError::BadResponse("missing data".to_string()))
    }

    /// Validates the token and caches the account's user id.
    async fn user_id(&self) -> Result<String, PlatformError> {
        if let Some(id) = self.user_id.read().await.as_ref() {
            return Ok(id.clone());
        }
        let response = self
            .client
            .get(VALIDATE_URL)
            .header(AUTHORIZATION, format!("OAuth {}", self.token))
            .send()
            .await?;
        if response.status().as_u16() == 401 {
            return Err(PlatformError::AuthRejected);
        }
        if !response.status().is_success() {
            return Err(PlatformError::Transient(format!(
                "token validation returned {}",
                response.status()
            )));
        }
        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PlatformError::BadResponse(e.to_string()))?;
        let id = data["user_id"]
            .as_str()
            .ok_or_else(|| PlatformError::BadResponse("validation had no user_id".to_string()))?
            .to_string();
        *self.user_id.write().await = Some(id.clone());
        Ok(id)
    }

    /// Extracts the spade telemetry URL from the channel page, falling back
    /// to the settings JS bundle it references. Cached per channel login.
    async fn spade_url_for(&self, login: &str) -> Result<String, PlatformError> {
        if let Some((cached_login, url)) = self.spade_url.read().await.as_ref() {
            if cached_login == login {
                return Ok(url.clone());
            }
        }

        let page_url = format!("https://www.twitch.tv/{login}");
        let html = self
            .client
            .get(&page_url)
            .header(
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
            )
            .send()
            .await?
            .text()
            .await
            .map_err(|e| PlatformError::BadResponse(e.to_string()))?;

        let mut found = SPADE_URL_PATTERN
            .captures(&html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        if found.is_none() {
            if let Some(settings_url) = SETTINGS_JS_PATTERN
                .captures(&html)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
            {
                let settings_js = self
                    .client
                    .get(&settings_url)
                    .send()
                    .await?
                    .text()
                    .await
                    .map_err(|e| PlatformError::BadResponse(e.to_string()))?;
                found = SPADE_URL_PATTERN
                    .captures(&settings_js)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());
            }
        }

        let url = found.ok_or_else(|| {
            PlatformError::BadResponse(format!("no spade URL found for channel {login}"))
        })?;
        url::Url::parse(&url)
            .map_err(|e| PlatformError::BadResponse(format!("unusable spade URL: {e}")))?;
        debug!("[TwitchGql] spade URL for {login}: {url}");
        *self.spade_url.write().await = Some((login.to_string(), url.clone()));
        Ok(url)
    }
}

#[async_trait]
impl PlatformApi for TwitchGqlService {
    async fn fetch_campaigns(&self) -> Result<Vec<Campaign>, PlatformError> {
        let query = r#"
        query DropCampaigns {
            currentUser {
                dropCampaigns {
                    id
                    name
                    game {
                        id
                        name
                    }
                    startAt
                    endAt
                    allow {
                        channels {
                            id
                            name
                        }
                        isEnabled
                    }
                    self {
                        isAccountConnected
                    }
                    timeBasedDrops {
                        id
                        name
                        requiredMinutesWatched
                        preconditionDrops {
                            id
                        }
                        self {
                            currentMinutesWatched
                            isClaimed
                        }
                    }
                }
            }
        }
        "#;

        let data: DropCampaignsData = self
            .gql_typed(json!({ "query": query, "variables": {} }))
            .await?;
        let campaigns = data
            .current_user
            .and_then(|u| u.drop_campaigns)
            .unwrap_or_default();
        Ok(campaigns.into_iter().map(into_campaign).collect())
    }

    async fn poll_channel_status(
        &self,
        ids: &[String],
    ) -> Result<Vec<ChannelState>, PlatformError> {
        let query = r#"
        query ChannelStatus($channelID: ID!) {
            user(id: $channelID) {
                id
                login
                displayName
                stream {
                    id
                    viewersCount
                    game {
                        id
                        name
                    }
                }
            }
        }
        "#;

        let futures: Vec<_> = ids
            .iter()
            .map(|id| {
                self.gql(json!({
                    "query": query,
                    "variables": { "channelID": id }
                }))
            })
            .collect();

        let mut channels = Vec::new();
        let mut first_error: Option<PlatformError> = None;
        for (id, result) in ids.iter().zip(futures::future::join_all(futures).await) {
            match result {
                Ok(value) => {
                    if let Some(channel) = parse_channel_status(&value) {
                        channels.push(channel);
                    } else {
                        debug!("[TwitchGql] status query returned no user for {id}");
                    }
                }
                Err(PlatformError::AuthRejected) => return Err(PlatformError::AuthRejected),
                Err(err) => {
                    warn!("[TwitchGql] status check for {id} failed: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        if channels.is_empty() {
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        Ok(channels)
    }

    async fn discover_channels(
        &self,
        game_id: &str,
        game_name: &str,
    ) -> Result<Vec<ChannelState>, PlatformError> {
        let query = r#"
        query GameStreams($gameID: ID!, $first: Int!) {
            game(id: $gameID) {
                streams(first: $first, options: {systemFilters: [DROPS_ENABLED]}) {
                    edges {
                        node {
                            id
                            broadcaster {
                                id
                                login
                                displayName
                            }
                            viewersCount
                        }
                    }
                }
            }
        }
        "#;

        let value = self
            .gql(json!({
                "query": query,
                "variables": { "gameID": game_id, "first": self.directory_page_size }
            }))
            .await?;
        Ok(parse_game_streams(game_id, game_name, &value))
    }

    async fn send_keepalive(
        &self,
        channel: &ChannelState,
        sequence: u64,
    ) -> Result<KeepaliveAck, PlatformError> {
        let spade_url = self.spade_url_for(&channel.login).await?;
        let user_id = self.user_id().await?;
        let encoded = minute_watched_payload(channel, &user_id);

        let response = self
            .client
            .post(&spade_url)
            .form(&[("data", encoded)])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 204 {
            Ok(KeepaliveAck {
                channel_id: channel.id.clone(),
                sequence,
            })
        } else if status.as_u16() == 401 {
            Err(PlatformError::AuthRejected)
        } else {
            Err(PlatformError::Transient(format!(
                "watch payload returned {status}"
            )))
        }
    }

    async fn report_progress_since_last_tick(
        &self,
    ) -> Result<Vec<DropProgressEvent>, PlatformError> {
        let query = r#"
        query Inventory {
            currentUser {
                inventory {
                    dropCampaignsInProgress {
                        id
                        timeBasedDrops {
                            id
                            name
                            requiredMinutesWatched
                            self {
                                currentMinutesWatched
                                isClaimed
                            }
                        }
                    }
                }
            }
        }
        "#;

        let data: InventoryData = self
            .gql_typed(json!({ "query": query, "variables": {} }))
            .await?;
        let campaigns = data
            .current_user
            .and_then(|u| u.inventory)
            .and_then(|i| i.drop_campaigns_in_progress)
            .unwrap_or_default();

        let mut events = Vec::new();
        for campaign in campaigns {
            for drop in campaign.time_based_drops {
                if let Some(progress) = drop.self_edge {
                    let minutes = if progress.is_claimed {
                        drop.required_minutes_watched
                    } else {
                        progress.current_minutes_watched
                    };
                    events.push(DropProgressEvent {
                        drop_id: drop.id,
                        minutes,
                    });
                }
            }
        }
        Ok(events)
    }

    async fn claim_drop(&self, campaign_id: &str, drop_id: &str) -> Result<bool, PlatformError> {
        let user_id = self.user_id().await?;
        // Claim instance ids are assembled from ids we already hold.
        let instance_id = format!("{user_id}#{campaign_id}#{drop_id}");

        let mutation = r#"
        mutation ClaimDrop($input: ClaimDropRewardsInput!) {
            claimDropRewards(input: $input) {
                status
            }
        }
        "#;

        let value = self
            .gql(json!({
                "query": mutation,
                "variables": { "input": { "dropInstanceID": instance_id } }
            }))
            .await?;

        let status = value["data"]["claimDropRewards"]["status"]
            .as_str()
            .unwrap_or("");
        Ok(matches!(
            status,
            "ELIGIBLE_FOR_ALL" | "DROP_INSTANCE_ALREADY_CLAIMED"
        ))
    }
}

fn into_campaign(gql: GqlDropCampaign) -> Campaign {
    let allowed_channels = match gql.allow {
        Some(allow) if allow.is_enabled => allow
            .channels
            .unwrap_or_default()
            .into_iter()
            .map(|c| AclChannel {
                id: c.id,
                name: c.name,
            })
            .collect(),
        _ => Vec::new(),
    };
    let timed_drops = gql
        .time_based_drops
        .into_iter()
        .map(|drop| {
            let (current_minutes, is_claimed) = drop
                .self_edge
                .map(|s| (s.current_minutes_watched, s.is_claimed))
                .unwrap_or((0, false));
            TimedDrop {
                id: drop.id,
                name: drop.name,
                required_minutes: drop.required_minutes_watched,
                current_minutes,
                is_claimed,
                precondition_ids: drop
                    .precondition_drops
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| p.id)
                    .collect(),
            }
        })
        .collect();

    Campaign {
        id: gql.id,
        name: gql.name,
        game_id: gql.game.id,
        game_name: gql.game.name,
        start_at: parse_timestamp(&gql.start_at, "2000-01-01T00:00:00Z"),
        end_at: parse_timestamp(&gql.end_at, "2099-12-31T23:59:59Z"),
        account_linked: gql.self_edge.map(|s| s.is_account_connected).unwrap_or(false),
        allowed_channels,
        timed_drops,
    }
}

fn parse_timestamp(raw: &str, fallback: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(fallback))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_channel_status(value: &serde_json::Value) -> Option<ChannelState> {
    let user = value["data"]["user"].as_object()?;
    let id = user.get("id")?.as_str()?.to_string();
    let login = user
        .get("login")
        .and_then(|v| v.as_str())
        .unwrap_or(&id)
        .to_string();
    let display_name = user
        .get("displayName")
        .and_then(|v| v.as_str())
        .map(String::from);

    let mut channel = ChannelState::offline(id, login);
    channel.display_name = display_name;
    if let Some(stream) = user.get("stream").and_then(|v| v.as_object()) {
        channel.live = true;
        channel.viewers = stream
            .get("viewersCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        channel.drops_enabled = true;
        if let Some(game) = stream.get("game").and_then(|v| v.as_object()) {
            channel.game_id = game.get("id").and_then(|v| v.as_str()).map(String::from);
            channel.game_name = game.get("name").and_then(|v| v.as_str()).map(String::from);
        }
        channel.last_seen_live = Some(Utc::now());
    }
    Some(channel)
}

fn parse_game_streams(
    game_id: &str,
    game_name: &str,
    value: &serde_json::Value,
) -> Vec<ChannelState> {
    let mut channels = Vec::new();
    if let Some(edges) = value["data"]["game"]["streams"]["edges"].as_array() {
        for edge in edges {
            let node = &edge["node"];
            let Some(broadcaster) = node["broadcaster"].as_object() else {
                continue;
            };
            let Some(id) = broadcaster.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let login = broadcaster
                .get("login")
                .and_then(|v| v.as_str())
                .unwrap_or(id);
            let mut channel = ChannelState::offline(id, login);
            channel.display_name = broadcaster
                .get("displayName")
                .and_then(|v| v.as_str())
                .map(String::from);
            channel.live = true;
            channel.drops_enabled = true;
            channel.viewers = node["viewersCount"].as_u64().unwrap_or(0) as u32;
            channel.game_id = Some(game_id.to_string());
            channel.game_name = Some(game_name.to_string());
            channel.last_seen_live = Some(Utc::now());
            channels.push(channel);
        }
    }
    channels
}

/// Builds the base64-encoded `minute-watched` telemetry payload. Channels
/// without a known broadcast id fall back to the channel id.
fn minute_watched_payload(channel: &ChannelState, user_id: &str) -> String {
    let payload = json!([{
        "event": "minute-watched",
        "properties": {
            "broadcast_id": channel.id,
            "channel_id": channel.id,
            "channel": channel.login,
            "hidden": false,
            "live": true,
            "location": "channel",
            "logged_in": true,
            "muted": false,
            "player": "site",
            "user_id": user_id
        }
    }]);
    general_purpose::STANDARD.encode(payload.to_string().as_bytes())
}
