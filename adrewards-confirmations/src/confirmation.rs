//! Confirmation types.

use crate::tokens::UnblindedTokenInfo;
use adrewards_privacy::{BlindedToken, Token};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// User interaction being confirmed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationType {
    View,
    Click,
    Dismiss,
    Landed,
    Flag,
    Upvote,
    Downvote,
    Conversion,
}

impl ConfirmationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Click => "click",
            Self::Dismiss => "dismiss",
            Self::Landed => "landed",
            Self::Flag => "flag",
            Self::Upvote => "upvote",
            Self::Downvote => "downvote",
            Self::Conversion => "conversion",
        }
    }
}

impl fmt::Display for ConfirmationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Surface the ad was shown on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdType {
    AdNotification,
    NewTabPageAd,
    PromotedContentAd,
    InlineContentAd,
    SearchResultAd,
}

impl AdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdNotification => "ad_notification",
            Self::NewTabPageAd => "new_tab_page_ad",
            Self::PromotedContentAd => "promoted_content_ad",
            Self::InlineContentAd => "inline_content_ad",
            Self::SearchResultAd => "search_result_ad",
        }
    }
}

impl fmt::Display for AdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ad event waiting to be confirmed.
///
/// This is what the confirmation queue persists. It carries no token
/// material, so nothing here links the event to a payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardConfirmation {
    pub transaction_id: String,
    pub creative_instance_id: String,
    pub placement_id: String,
    pub confirmation_type: ConfirmationType,
    pub ad_type: AdType,
    pub created_at: DateTime<Utc>,
}

impl RewardConfirmation {
    pub fn new(
        creative_instance_id: impl Into<String>,
        placement_id: impl Into<String>,
        confirmation_type: ConfirmationType,
        ad_type: AdType,
    ) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            creative_instance_id: creative_instance_id.into(),
            placement_id: placement_id.into(),
            confirmation_type,
            ad_type,
            created_at: Utc::now(),
        }
    }
}

/// One round trip with the confirmation server.
///
/// Holds the spent token and the payment token's blinding factor. It is kept
/// as a pending confirmation from just before it is first submitted until its
/// payment token has been unblinded or the server rejects it, and resent
/// unchanged on every retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationInfo {
    pub id: String,
    pub transaction_id: String,
    pub creative_instance_id: String,
    pub placement_id: String,
    pub confirmation_type: ConfirmationType,
    pub ad_type: AdType,
    pub unblinded_token: Option<UnblindedTokenInfo>,
    pub payment_token: Token,
    pub blinded_payment_token: BlindedToken,
    pub credential: Option<String>,
    pub created_at: DateTime<Utc>,
    pub was_created: bool,
}

impl ConfirmationInfo {
    /// Build a confirmation with a fresh payment token and no spent token yet.
    pub fn new(id: impl Into<String>, reward: &RewardConfirmation) -> Self {
        let payment_token = Token::random();
        let blinded_payment_token = payment_token.blind();
        Self {
            id: id.into(),
            transaction_id: reward.transaction_id.clone(),
            creative_instance_id: reward.creative_instance_id.clone(),
            placement_id: reward.placement_id.clone(),
            confirmation_type: reward.confirmation_type,
            ad_type: reward.ad_type,
            unblinded_token: None,
            payment_token,
            blinded_payment_token,
            credential: None,
            created_at: reward.created_at,
            was_created: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrewards_privacy::Base64Encoding;

    #[test]
    fn test_confirmation_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&ConfirmationType::View).unwrap(),
            "\"view\""
        );
        assert_eq!(ConfirmationType::Conversion.to_string(), "conversion");
        assert_eq!(
            serde_json::from_str::<ConfirmationType>("\"click\"").unwrap(),
            ConfirmationType::Click
        );
    }

    #[test]
    fn test_ad_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&AdType::NewTabPageAd).unwrap(),
            "\"new_tab_page_ad\""
        );
        assert_eq!(AdType::SearchResultAd.as_str(), "search_result_ad");
    }

    #[test]
    fn test_new_confirmation_blinds_its_payment_token() {
        let reward = RewardConfirmation::new(
            "546fe7b0-5047-4f28-a11c-81f14edcf0f6",
            "placement",
            ConfirmationType::View,
            AdType::AdNotification,
        );
        let confirmation = ConfirmationInfo::new("id", &reward);

        assert_eq!(confirmation.blinded_payment_token, confirmation.payment_token.blind());
        assert!(confirmation.blinded_payment_token.has_value());
        assert!(confirmation.unblinded_token.is_none());
        assert!(!confirmation.was_created);
        assert_eq!(confirmation.transaction_id, reward.transaction_id);
    }
}
