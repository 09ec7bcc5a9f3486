use chrono::{DateTime, Utc};

use crate::models::channel::ChannelState;
use crate::models::preferences::Preferences;
use crate::services::inventory_service::Inventory;

/// Why a channel cannot accrue progress right now. Closed set so callers
/// branch exhaustively and tests assert exact reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    Offline,
    NoCampaignForCategory,
    CategoryExcluded,
    /// Every matching campaign is outside its time window.
    CampaignExpired,
    /// Campaigns exist and are active, but every remaining drop is done.
    AllBenefitsComplete,
    /// The account's own eligibility flags block accrual: the platform has
    /// already settled entitlement for every matching campaign (account not
    /// linked where linking decides the reward), so watch time cannot help.
    AccountAlreadyEligible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible { campaign_id: String },
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible { .. })
    }
}

/// Decides whether progress can currently accrue on `channel`. Pure and
/// deterministic: identical inputs always produce identical output.
///
/// When several campaigns match the channel's game, the earnable one ending
/// soonest wins (ties broken by campaign id). When none is earnable, the
/// reported reason comes from the campaign that got closest to earnable:
/// finished beats account-blocked beats out-of-window beats not-applicable.
pub fn evaluate(
    channel: &ChannelState,
    inventory: &Inventory,
    preferences: &Preferences,
    now: DateTime<Utc>,
) -> Eligibility {
    if !channel.live {
        return Eligibility::Ineligible(IneligibleReason::Offline);
    }
    let (Some(game_id), Some(game_name)) = (&channel.game_id, &channel.game_name) else {
        return Eligibility::Ineligible(IneligibleReason::NoCampaignForCategory);
    };
    if !preferences.allows(game_name) {
        return Eligibility::Ineligible(IneligibleReason::CategoryExcluded);
    }

    let campaigns = inventory.campaigns_for_game(game_id);
    if campaigns.is_empty() {
        return Eligibility::Ineligible(IneligibleReason::NoCampaignForCategory);
    }

    let mut best: Option<(&DateTime<Utc>, &str)> = None;
    let mut saw_finished = false;
    let mut saw_account_blocked = false;
    let mut saw_out_of_window = false;

    for campaign in campaigns {
        if !campaign.allows_channel(&channel.id) {
            continue;
        }
        if !campaign.is_active(now) {
            saw_out_of_window = true;
            continue;
        }
        if !campaign.account_linked {
            saw_account_blocked = true;
            continue;
        }
        if !campaign.has_pending_drops() {
            saw_finished = true;
            continue;
        }
        let candidate = (&campaign.end_at, campaign.id.as_str());
        match best {
            Some(current) if current <= candidate => {}
            _ => best = Some(candidate),
        }
    }

    if let Some((_, campaign_id)) = best {
        return Eligibility::Eligible {
            campaign_id: campaign_id.to_string(),
        };
    }
    let reason = if saw_finished {
        IneligibleReason::AllBenefitsComplete
    } else if saw_account_blocked {
        IneligibleReason::AccountAlreadyEligible
    } else if saw_out_of_window {
        IneligibleReason::CampaignExpired
    } else {
        // Campaigns exist for the game but none applies to this channel
        // (ACL mismatch).
        IneligibleReason::NoCampaignForCategory
    };
    Eligibility::Ineligible(reason)
}
