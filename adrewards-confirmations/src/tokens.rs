//! Token records held by the stores.

use crate::confirmation::{AdType, ConfirmationType};
use crate::wallet::WalletInfo;
use adrewards_privacy::{Base64Encoding, PublicKey, UnblindedToken};
use serde::{Deserialize, Serialize};

/// A spendable token together with the key that signed it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnblindedTokenInfo {
    pub value: UnblindedToken,
    pub public_key: PublicKey,
    /// Wallet signature over the value and key, see [`WalletInfo::sign`].
    pub signature: String,
}

impl UnblindedTokenInfo {
    /// Wrap a freshly unblinded token, signing it with the wallet.
    pub fn signed(value: UnblindedToken, public_key: PublicKey, wallet: &WalletInfo) -> Option<Self> {
        let message = signing_message(&value, &public_key)?;
        let signature = wallet.sign(&message)?;
        Some(Self {
            value,
            public_key,
            signature,
        })
    }

    /// True if this record was signed by `wallet` and has not been altered.
    pub fn is_signed_by(&self, wallet: &WalletInfo) -> bool {
        signing_message(&self.value, &self.public_key)
            .map(|message| wallet.verify(&message, &self.signature))
            .unwrap_or(false)
    }
}

fn signing_message(value: &UnblindedToken, public_key: &PublicKey) -> Option<Vec<u8>> {
    let mut message = value.encode_base64()?;
    message.push_str(&public_key.encode_base64()?);
    Some(message.into_bytes())
}

/// Reward for a confirmed ad event, redeemable for value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnblindedPaymentToken {
    pub value: UnblindedToken,
    pub public_key: PublicKey,
    pub confirmation_type: ConfirmationType,
    pub ad_type: AdType,
}
