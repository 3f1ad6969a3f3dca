//! Attested nodes: agents that completed node attestation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::id::SpiffeId;
use super::selector::Selector;
use super::validation::{validate_selectors, validate_workload_id};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AttestedNode {
    #[validate(custom(function = "validate_workload_id"))]
    pub spiffe_id: SpiffeId,
    #[validate(length(min = 1))]
    pub attestation_type: String,
    pub cert_serial_number: String,
    pub cert_not_after: DateTime<Utc>,
    /// Serial of the certificate being rotated in, kept during the overlap window
    #[serde(default)]
    pub new_cert_serial_number: String,
    #[serde(default)]
    pub new_cert_not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub can_reattest: bool,
    #[serde(default)]
    #[validate(custom(function = "validate_selectors"))]
    pub selectors: Vec<Selector>,
}

impl AttestedNode {
    pub fn new(
        spiffe_id: SpiffeId,
        attestation_type: impl Into<String>,
        cert_serial_number: impl Into<String>,
        cert_not_after: DateTime<Utc>,
    ) -> Self {
        Self {
            spiffe_id,
            attestation_type: attestation_type.into(),
            cert_serial_number: cert_serial_number.into(),
            cert_not_after,
            new_cert_serial_number: String::new(),
            new_cert_not_after: None,
            can_reattest: false,
            selectors: Vec::new(),
        }
    }

    /// A node with no current or pending certificate is banned
    pub fn is_banned(&self) -> bool {
        self.cert_serial_number.is_empty() && self.new_cert_serial_number.is_empty()
    }
}

/// Fields of an attested node that a masked update may replace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttestedNodeMask {
    pub cert_serial_number: bool,
    pub cert_not_after: bool,
    pub new_cert_serial_number: bool,
    pub new_cert_not_after: bool,
    pub can_reattest: bool,
}

impl AttestedNodeMask {
    pub const ALL: Self = Self {
        cert_serial_number: true,
        cert_not_after: true,
        new_cert_serial_number: true,
        new_cert_not_after: true,
        can_reattest: true,
    };

    pub fn apply(&self, current: &mut AttestedNode, update: AttestedNode) {
        if self.cert_serial_number {
            current.cert_serial_number = update.cert_serial_number;
        }
        if self.cert_not_after {
            current.cert_not_after = update.cert_not_after;
        }
        if self.new_cert_serial_number {
            current.new_cert_serial_number = update.new_cert_serial_number;
        }
        if self.new_cert_not_after {
            current.new_cert_not_after = update.new_cert_not_after;
        }
        if self.can_reattest {
            current.can_reattest = update.can_reattest;
        }
    }
}
