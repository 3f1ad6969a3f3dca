//! Field rules referenced from the `#[validate(...)]` attributes on the
//! domain records.

use std::borrow::Cow;
use url::Url;
use validator::ValidationError;

use super::federation::{BundleEndpointProfile, FederationRelationship};
use super::id::{EntryId, SpiffeId};
use super::selector::Selector;

fn rejected(code: &'static str, message: String) -> ValidationError {
    ValidationError::new(code).with_message(Cow::Owned(message))
}

pub fn validate_entry_id(id: &EntryId) -> Result<(), ValidationError> {
    id.validate().map_err(|e| rejected("invalid_entry_id", e.to_string()))
}

/// The ID must name a workload, not the trust domain itself
pub fn validate_workload_id(id: &SpiffeId) -> Result<(), ValidationError> {
    if id.is_trust_domain_id() {
        return Err(rejected("missing_path", format!("SPIFFE ID '{}' has no path", id)));
    }
    Ok(())
}

pub fn validate_selectors(selectors: &Vec<Selector>) -> Result<(), ValidationError> {
    selectors
        .iter()
        .try_for_each(Selector::validate)
        .map_err(|e| rejected("invalid_selector", e.to_string()))
}

pub fn validate_dns_names(names: &Vec<String>) -> Result<(), ValidationError> {
    match names.iter().find(|dns| dns.is_empty() || dns.chars().any(char::is_whitespace)) {
        Some(dns) => Err(rejected("invalid_dns_name", format!("invalid DNS name '{}'", dns))),
        None => Ok(()),
    }
}

pub fn validate_bundle_endpoint_url(url: &Url) -> Result<(), ValidationError> {
    if url.scheme() != "https" {
        return Err(rejected("insecure_url", format!("'{}' must use https", url)));
    }
    if url.host_str().is_none() {
        return Err(rejected("missing_host", format!("'{}' has no host", url)));
    }
    Ok(())
}

pub fn validate_endpoint_profile(profile: &BundleEndpointProfile) -> Result<(), ValidationError> {
    match profile {
        BundleEndpointProfile::HttpsSpiffe { endpoint_spiffe_id } => {
            validate_workload_id(endpoint_spiffe_id)
        }
        BundleEndpointProfile::HttpsWeb => Ok(()),
    }
}

/// A cached foreign bundle must belong to the relationship's trust domain
pub fn validate_federation_relationship(
    relationship: &FederationRelationship,
) -> Result<(), ValidationError> {
    match &relationship.trust_domain_bundle {
        Some(bundle) if bundle.trust_domain != relationship.trust_domain => Err(rejected(
            "bundle_trust_domain_mismatch",
            format!(
                "bundle for '{}' does not belong to '{}'",
                bundle.trust_domain, relationship.trust_domain
            ),
        )),
        _ => Ok(()),
    }
}
