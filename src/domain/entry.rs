//! Registration entries: which workloads may receive which SPIFFE ID.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::id::{EntryId, SpiffeId, TrustDomain};
use super::selector::{normalize, Selector};
use super::validation::{
    validate_dns_names, validate_entry_id, validate_selectors, validate_workload_id,
};

pub const MAX_HINT_LEN: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RegistrationEntry {
    #[validate(custom(function = "validate_entry_id"))]
    pub id: EntryId,
    pub parent_id: SpiffeId,
    #[validate(custom(function = "validate_workload_id"))]
    pub spiffe_id: SpiffeId,
    #[validate(length(min = 1), custom(function = "validate_selectors"))]
    pub selectors: Vec<Selector>,
    /// X.509-SVID lifetime in seconds, 0 selects the server default
    #[serde(default)]
    #[validate(range(min = 0))]
    pub x509_svid_ttl: i32,
    /// JWT-SVID lifetime in seconds, 0 selects the server default
    #[serde(default)]
    #[validate(range(min = 0))]
    pub jwt_svid_ttl: i32,
    #[serde(default)]
    pub federates_with: Vec<TrustDomain>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub downstream: bool,
    #[serde(default)]
    #[validate(custom(function = "validate_dns_names"))]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub entry_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revision_number: u64,
    #[serde(default)]
    pub store_svid: bool,
    #[serde(default)]
    #[validate(length(max = MAX_HINT_LEN))]
    pub hint: String,
    pub created_at: DateTime<Utc>,
}

/// Uniqueness key of a registration entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub parent_id: SpiffeId,
    pub spiffe_id: SpiffeId,
    pub selectors: Vec<Selector>,
}

impl RegistrationEntry {
    pub fn new(parent_id: SpiffeId, spiffe_id: SpiffeId, selectors: Vec<Selector>) -> Self {
        Self {
            id: EntryId::new(),
            parent_id,
            spiffe_id,
            selectors,
            x509_svid_ttl: 0,
            jwt_svid_ttl: 0,
            federates_with: Vec::new(),
            admin: false,
            downstream: false,
            dns_names: Vec::new(),
            entry_expiry: None,
            revision_number: 0,
            store_svid: false,
            hint: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }

    pub fn key(&self) -> EntryKey {
        EntryKey {
            parent_id: self.parent_id.clone(),
            spiffe_id: self.spiffe_id.clone(),
            selectors: normalize(self.selectors.clone()),
        }
    }

    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.entry_expiry.is_some_and(|expiry| expiry < at)
    }
}

/// Fields of a registration entry that a masked update may replace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationEntryMask {
    pub parent_id: bool,
    pub spiffe_id: bool,
    pub selectors: bool,
    pub x509_svid_ttl: bool,
    pub jwt_svid_ttl: bool,
    pub federates_with: bool,
    pub admin: bool,
    pub downstream: bool,
    pub dns_names: bool,
    pub entry_expiry: bool,
    pub store_svid: bool,
    pub hint: bool,
}

impl RegistrationEntryMask {
    pub const ALL: Self = Self {
        parent_id: true,
        spiffe_id: true,
        selectors: true,
        x509_svid_ttl: true,
        jwt_svid_ttl: true,
        federates_with: true,
        admin: true,
        downstream: true,
        dns_names: true,
        entry_expiry: true,
        store_svid: true,
        hint: true,
    };

    /// Copy masked fields from `update` into `current`. ID, revision and
    /// creation time are never taken from the update.
    pub fn apply(&self, current: &mut RegistrationEntry, update: RegistrationEntry) {
        if self.parent_id {
            current.parent_id = update.parent_id;
        }
        if self.spiffe_id {
            current.spiffe_id = update.spiffe_id;
        }
        if self.selectors {
            current.selectors = update.selectors;
        }
        if self.x509_svid_ttl {
            current.x509_svid_ttl = update.x509_svid_ttl;
        }
        if self.jwt_svid_ttl {
            current.jwt_svid_ttl = update.jwt_svid_ttl;
        }
        if self.federates_with {
            current.federates_with = update.federates_with;
        }
        if self.admin {
            current.admin = update.admin;
        }
        if self.downstream {
            current.downstream = update.downstream;
        }
        if self.dns_names {
            current.dns_names = update.dns_names;
        }
        if self.entry_expiry {
            current.entry_expiry = update.entry_expiry;
        }
        if self.store_svid {
            current.store_svid = update.store_svid;
        }
        if self.hint {
            current.hint = update.hint;
        }
    }
}
