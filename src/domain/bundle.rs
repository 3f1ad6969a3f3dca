//! Trust bundles: the root CAs and JWT signing keys of one trust domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::id::TrustDomain;
use crate::errors::{Result, TrustplaneError};

/// An X.509 trust anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RootCa {
    /// Subject key identifier of the CA, shared with the CA journal
    #[validate(length(min = 1))]
    pub authority_id: String,
    #[validate(length(min = 1))]
    pub der: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub tainted: bool,
}

/// A JWT signing key as published in the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PublicKey {
    #[validate(length(min = 1))]
    pub key_id: String,
    #[validate(length(min = 1))]
    pub pkix_bytes: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub tainted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Bundle {
    pub trust_domain: TrustDomain,
    #[validate(nested)]
    pub root_cas: Vec<RootCa>,
    #[validate(nested)]
    pub jwt_signing_keys: Vec<PublicKey>,
    #[validate(range(min = 0))]
    pub refresh_hint_seconds: i64,
    /// Increases on every content change
    pub sequence_number: u64,
}

impl Bundle {
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            root_cas: Vec::new(),
            jwt_signing_keys: Vec::new(),
            refresh_hint_seconds: 0,
            sequence_number: 0,
        }
    }

    pub fn with_root_ca(mut self, root_ca: RootCa) -> Self {
        self.root_cas.push(root_ca);
        self
    }

    pub fn with_jwt_key(mut self, key: PublicKey) -> Self {
        self.jwt_signing_keys.push(key);
        self
    }

    /// Merge anchors and keys from `other` that are not yet present.
    ///
    /// Returns true when anything was added.
    pub fn merge(&mut self, other: &Bundle) -> bool {
        let mut changed = false;
        for ca in &other.root_cas {
            if !self.root_cas.iter().any(|c| c.der == ca.der) {
                self.root_cas.push(ca.clone());
                changed = true;
            }
        }
        for key in &other.jwt_signing_keys {
            if !self.jwt_signing_keys.iter().any(|k| k.key_id == key.key_id) {
                self.jwt_signing_keys.push(key.clone());
                changed = true;
            }
        }
        changed
    }

    /// Drop anchors and keys that expired before `expires_before`.
    ///
    /// Fails when every root CA would be removed. Returns true when the bundle changed.
    pub fn prune(&mut self, expires_before: DateTime<Utc>) -> Result<bool> {
        let kept_cas: Vec<RootCa> =
            self.root_cas.iter().filter(|ca| ca.expires_at >= expires_before).cloned().collect();
        if kept_cas.is_empty() && !self.root_cas.is_empty() {
            return Err(TrustplaneError::invalid_argument(format!(
                "pruning bundle for '{}' would remove all root CAs",
                self.trust_domain
            )));
        }
        let kept_keys: Vec<PublicKey> = self
            .jwt_signing_keys
            .iter()
            .filter(|k| k.expires_at >= expires_before)
            .cloned()
            .collect();

        let changed = kept_cas.len() != self.root_cas.len()
            || kept_keys.len() != self.jwt_signing_keys.len();
        self.root_cas = kept_cas;
        self.jwt_signing_keys = kept_keys;
        Ok(changed)
    }

    pub fn root_ca_mut(&mut self, authority_id: &str) -> Option<&mut RootCa> {
        self.root_cas.iter_mut().find(|ca| ca.authority_id == authority_id)
    }

    pub fn jwt_key_mut(&mut self, key_id: &str) -> Option<&mut PublicKey> {
        self.jwt_signing_keys.iter_mut().find(|k| k.key_id == key_id)
    }
}

/// Fields of a bundle that a masked update may replace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleMask {
    pub root_cas: bool,
    pub jwt_signing_keys: bool,
    pub refresh_hint_seconds: bool,
    pub sequence_number: bool,
}

impl BundleMask {
    pub const ALL: Self = Self {
        root_cas: true,
        jwt_signing_keys: true,
        refresh_hint_seconds: true,
        sequence_number: true,
    };

    /// Copy masked fields from `update` into `current`
    pub fn apply(&self, current: &mut Bundle, update: Bundle) {
        if self.root_cas {
            current.root_cas = update.root_cas;
        }
        if self.jwt_signing_keys {
            current.jwt_signing_keys = update.jwt_signing_keys;
        }
        if self.refresh_hint_seconds {
            current.refresh_hint_seconds = update.refresh_hint_seconds;
        }
        if self.sequence_number {
            current.sequence_number = update.sequence_number;
        }
    }
}

/// What happens to registration entries federating with a deleted bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Refuse to delete while entries still federate with the bundle
    #[default]
    Restrict,
    /// Delete the federating entries as well
    Delete,
    /// Remove the trust domain from the entries' federation lists
    Dissociate,
}
