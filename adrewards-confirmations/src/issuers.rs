//! Catalog issuers: the public keys the client accepts signatures from.

use crate::errors::{ConfirmationsError, Result};
use adrewards_privacy::{Base64Encoding, PublicKey};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerInfo {
    /// Redemption value, e.g. `"0.05BAT"`.
    pub name: String,
    pub public_key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogIssuers {
    pub public_key: String,
    pub issuers: Vec<IssuerInfo>,
}

impl CatalogIssuers {
    pub fn is_valid(&self) -> bool {
        !self.public_key.is_empty() && !self.issuers.is_empty()
    }

    fn find(&self, public_key: &PublicKey) -> Option<&IssuerInfo> {
        if !public_key.has_value() {
            return None;
        }
        self.issuers
            .iter()
            .find(|issuer| PublicKey::decode_base64(&issuer.public_key) == *public_key)
    }

    pub fn contains_public_key(&self, public_key: &PublicKey) -> bool {
        self.find(public_key).is_some()
    }

    /// Value attached to tokens signed by `public_key`, parsed from the issuer name.
    pub fn redemption_value(&self, public_key: &PublicKey) -> Option<f64> {
        let issuer = self.find(public_key)?;
        issuer.name.trim_end_matches("BAT").trim().parse().ok()
    }
}

/// Shared holder for the latest catalog issuers.
#[derive(Debug, Default)]
pub struct CatalogIssuersStore {
    issuers: RwLock<Option<CatalogIssuers>>,
}

impl CatalogIssuersStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, issuers: CatalogIssuers) -> Result<()> {
        if !issuers.is_valid() {
            return Err(ConfirmationsError::MissingIssuers);
        }
        let mut guard = self
            .issuers
            .write()
            .map_err(|_| ConfirmationsError::lock_poisoned("issuers"))?;
        *guard = Some(issuers);
        Ok(())
    }

    pub fn get(&self) -> Option<CatalogIssuers> {
        self.issuers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_known_public_key(&self, public_key: &PublicKey) -> bool {
        self.issuers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|issuers| issuers.contains_public_key(public_key))
            .unwrap_or(false)
    }

    pub fn has_issuers(&self) -> bool {
        self.issuers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrewards_privacy::SigningKey;

    fn issuers_for(key: &PublicKey, name: &str) -> CatalogIssuers {
        CatalogIssuers {
            public_key: SigningKey::random().public_key().to_string(),
            issuers: vec![IssuerInfo {
                name: name.to_string(),
                public_key: key.to_string(),
            }],
        }
    }

    #[test]
    fn test_known_public_key() {
        let key = SigningKey::random().public_key();
        let issuers = issuers_for(&key, "0.05BAT");
        assert!(issuers.contains_public_key(&key));
        assert!(!issuers.contains_public_key(&SigningKey::random().public_key()));
        assert!(!issuers.contains_public_key(&PublicKey::default()));
    }

    #[test]
    fn test_redemption_value_from_name() {
        let key = SigningKey::random().public_key();
        assert_eq!(issuers_for(&key, "0.05BAT").redemption_value(&key), Some(0.05));
        assert_eq!(issuers_for(&key, "free").redemption_value(&key), None);
    }

    #[test]
    fn test_store_rejects_empty_issuers() {
        let store = CatalogIssuersStore::new();
        assert!(store.set(CatalogIssuers::default()).is_err());
        assert!(!store.has_issuers());

        let key = SigningKey::random().public_key();
        store.set(issuers_for(&key, "0.1BAT")).unwrap();
        assert!(store.is_known_public_key(&key));
    }
}
