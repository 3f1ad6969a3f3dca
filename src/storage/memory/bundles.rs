use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::{Bundle, BundleMask, DeleteMode, EventOp, TrustDomain};
use crate::errors::{Result, TrustplaneError};
use crate::storage::request::{ListBundlesRequest, ListBundlesResponse};
use crate::storage::validation::validate_record;

use super::{paginate, State};

const RESOURCE: &str = "bundle";

impl State {
    pub(super) fn create_bundle(&mut self, bundle: Bundle) -> Result<Bundle> {
        validate_record(&bundle)?;
        let key = bundle.trust_domain.to_string();
        if self.bundles.contains_key(&key) {
            return Err(TrustplaneError::already_exists(RESOURCE, key));
        }
        self.bundles.insert(key, bundle.clone());
        Ok(bundle)
    }

    pub(super) fn fetch_bundle(&self, trust_domain: &TrustDomain) -> Option<Bundle> {
        self.bundles.get(trust_domain.as_str()).cloned()
    }

    pub(super) fn update_bundle(&mut self, bundle: Bundle, mask: BundleMask) -> Result<Bundle> {
        validate_record(&bundle)?;
        let current = self
            .bundles
            .get(bundle.trust_domain.as_str())
            .ok_or_else(|| TrustplaneError::not_found(RESOURCE, bundle.trust_domain.as_str()))?;

        let mut updated = current.clone();
        mask.apply(&mut updated, bundle);
        if !mask.sequence_number && &updated != current {
            updated.sequence_number = current.sequence_number + 1;
        }
        self.bundles.insert(updated.trust_domain.to_string(), updated.clone());
        Ok(updated)
    }

    pub(super) fn set_bundle(&mut self, mut bundle: Bundle) -> Result<Bundle> {
        validate_record(&bundle)?;
        if let Some(current) = self.bundles.get(bundle.trust_domain.as_str()) {
            let same_content = current.root_cas == bundle.root_cas
                && current.jwt_signing_keys == bundle.jwt_signing_keys
                && current.refresh_hint_seconds == bundle.refresh_hint_seconds;
            bundle.sequence_number = if same_content {
                current.sequence_number
            } else {
                bundle.sequence_number.max(current.sequence_number + 1)
            };
        }
        self.bundles.insert(bundle.trust_domain.to_string(), bundle.clone());
        Ok(bundle)
    }

    pub(super) fn append_bundle(&mut self, bundle: Bundle) -> Result<Bundle> {
        validate_record(&bundle)?;
        let key = bundle.trust_domain.to_string();
        let merged = match self.bundles.get(&key) {
            Some(current) => {
                let mut merged = current.clone();
                if merged.merge(&bundle) {
                    merged.sequence_number += 1;
                }
                merged
            }
            None => bundle,
        };
        self.bundles.insert(key, merged.clone());
        Ok(merged)
    }

    pub(super) fn delete_bundle(
        &mut self,
        trust_domain: &TrustDomain,
        mode: DeleteMode,
    ) -> Result<()> {
        if !self.bundles.contains_key(trust_domain.as_str()) {
            return Err(TrustplaneError::not_found(RESOURCE, trust_domain.as_str()));
        }

        let federated: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.federates_with.contains(trust_domain))
            .map(|e| e.id.clone())
            .collect();

        match mode {
            DeleteMode::Restrict if !federated.is_empty() => {
                return Err(TrustplaneError::invalid_argument(format!(
                    "cannot delete bundle for '{}': {} registration entries federate with it",
                    trust_domain,
                    federated.len()
                )));
            }
            DeleteMode::Restrict => {}
            DeleteMode::Delete => {
                for id in &federated {
                    self.remove_entry(id);
                }
            }
            DeleteMode::Dissociate => {
                for id in &federated {
                    if let Some(entry) = self.entries.get_mut(id.as_str()) {
                        entry.federates_with.retain(|td| td != trust_domain);
                        entry.revision_number += 1;
                    }
                    self.record_entry_event(id, EventOp::Updated);
                }
            }
        }

        self.bundles.remove(trust_domain.as_str());
        info!(
            trust_domain = %trust_domain,
            mode = ?mode,
            affected_entries = federated.len(),
            "Deleted bundle"
        );
        Ok(())
    }

    pub(super) fn list_bundles(&self, request: &ListBundlesRequest) -> Result<ListBundlesResponse> {
        let all = self.bundles.iter().map(|(k, b)| (k, b.clone()));
        let (bundles, next_token) = paginate(all, request.pagination.as_ref())?;
        Ok(ListBundlesResponse { bundles, next_token })
    }

    pub(super) fn count_bundles(&self) -> usize {
        self.bundles.len()
    }

    pub(super) fn prune_bundle(
        &mut self,
        trust_domain: &TrustDomain,
        expires_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut bundle = self
            .bundles
            .get(trust_domain.as_str())
            .cloned()
            .ok_or_else(|| TrustplaneError::not_found(RESOURCE, trust_domain.as_str()))?;

        let changed = bundle.prune(expires_before)?;
        if changed {
            bundle.sequence_number += 1;
            self.bundles.insert(trust_domain.to_string(), bundle);
        }
        Ok(changed)
    }
}
