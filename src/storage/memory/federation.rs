use crate::domain::{FederationRelationship, FederationRelationshipMask, TrustDomain};
use crate::errors::{Result, TrustplaneError};
use crate::storage::request::{
    ListFederationRelationshipsRequest, ListFederationRelationshipsResponse,
};
use crate::storage::validation::validate_record;

use super::{paginate, State};

const RESOURCE: &str = "federation_relationship";

impl State {
    /// Relationships are stored without the bundle; reads attach the current
    /// bundle of the foreign trust domain.
    fn with_bundle(&self, mut relationship: FederationRelationship) -> FederationRelationship {
        let bundle = self.bundles.get(relationship.trust_domain.as_str()).cloned();
        relationship.trust_domain_bundle = bundle;
        relationship
    }

    fn store_relationship(
        &mut self,
        mut relationship: FederationRelationship,
    ) -> Result<FederationRelationship> {
        if let Some(bundle) = relationship.trust_domain_bundle.take() {
            self.set_bundle(bundle)?;
        }
        self.federations.insert(relationship.trust_domain.to_string(), relationship.clone());
        Ok(self.with_bundle(relationship))
    }

    pub(super) fn create_federation_relationship(
        &mut self,
        relationship: FederationRelationship,
    ) -> Result<FederationRelationship> {
        validate_record(&relationship)?;
        let key = relationship.trust_domain.to_string();
        if self.federations.contains_key(&key) {
            return Err(TrustplaneError::already_exists(RESOURCE, key));
        }
        self.store_relationship(relationship)
    }

    pub(super) fn fetch_federation_relationship(
        &self,
        trust_domain: &TrustDomain,
    ) -> Option<FederationRelationship> {
        self.federations.get(trust_domain.as_str()).cloned().map(|r| self.with_bundle(r))
    }

    pub(super) fn update_federation_relationship(
        &mut self,
        relationship: FederationRelationship,
        mask: FederationRelationshipMask,
    ) -> Result<FederationRelationship> {
        let key = relationship.trust_domain.to_string();
        let mut updated = self
            .federations
            .get(&key)
            .cloned()
            .ok_or_else(|| TrustplaneError::not_found(RESOURCE, key.clone()))?;
        mask.apply(&mut updated, relationship);
        validate_record(&updated)?;
        self.store_relationship(updated)
    }

    pub(super) fn delete_federation_relationship(
        &mut self,
        trust_domain: &TrustDomain,
    ) -> Result<()> {
        self.federations
            .remove(trust_domain.as_str())
            .map(|_| ())
            .ok_or_else(|| TrustplaneError::not_found(RESOURCE, trust_domain.as_str()))
    }

    pub(super) fn list_federation_relationships(
        &self,
        request: &ListFederationRelationshipsRequest,
    ) -> Result<ListFederationRelationshipsResponse> {
        let all = self.federations.iter().map(|(key, r)| (key, self.with_bundle(r.clone())));
        let (relationships, next_token) = paginate(all, request.pagination.as_ref())?;
        Ok(ListFederationRelationshipsResponse { relationships, next_token })
    }
}
