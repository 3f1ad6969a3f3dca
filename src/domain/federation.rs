//! Federation relationships with foreign trust domains.

use serde::{Deserialize, Serialize};
use url::Url;
use validator::Validate;

use super::bundle::Bundle;
use super::id::{SpiffeId, TrustDomain};
use super::validation::{
    validate_bundle_endpoint_url, validate_endpoint_profile, validate_federation_relationship,
};

/// How the foreign bundle endpoint is authenticated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum BundleEndpointProfile {
    /// Web PKI authenticated endpoint
    HttpsWeb,
    /// SPIFFE authenticated endpoint serving the given ID
    HttpsSpiffe { endpoint_spiffe_id: SpiffeId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_federation_relationship"))]
pub struct FederationRelationship {
    pub trust_domain: TrustDomain,
    #[validate(custom(function = "validate_bundle_endpoint_url"))]
    pub bundle_endpoint_url: Url,
    #[validate(custom(function = "validate_endpoint_profile"))]
    pub profile: BundleEndpointProfile,
    /// Cached copy of the foreign bundle
    #[serde(default)]
    #[validate(nested)]
    pub trust_domain_bundle: Option<Bundle>,
}

/// Fields of a federation relationship that a masked update may replace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FederationRelationshipMask {
    pub bundle_endpoint_url: bool,
    pub profile: bool,
    pub trust_domain_bundle: bool,
}

impl FederationRelationshipMask {
    pub const ALL: Self =
        Self { bundle_endpoint_url: true, profile: true, trust_domain_bundle: true };

    pub fn apply(&self, current: &mut FederationRelationship, update: FederationRelationship) {
        if self.bundle_endpoint_url {
            current.bundle_endpoint_url = update.bundle_endpoint_url;
        }
        if self.profile {
            current.profile = update.profile;
        }
        if self.trust_domain_bundle {
            current.trust_domain_bundle = update.trust_domain_bundle;
        }
    }
}
