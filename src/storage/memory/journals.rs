use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::{AuthorityKind, CaJournal, PublicKey, TrustDomain};
use crate::errors::{Result, TrustplaneError};

use super::State;

const RESOURCE: &str = "ca_journal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AuthorityChange {
    Taint,
    Revoke,
}

impl State {
    pub(super) fn set_ca_journal(&mut self, mut journal: CaJournal) -> Result<CaJournal> {
        journal.validate()?;
        let existing = self
            .journals
            .iter()
            .find(|(_, j)| j.trust_domain == journal.trust_domain)
            .map(|(id, _)| *id);

        let id = match (journal.id, existing) {
            (Some(id), Some(existing)) if id == existing => id,
            (Some(id), Some(existing)) => {
                return Err(TrustplaneError::invalid_argument(format!(
                    "journal {} does not belong to '{}' (journal {} does)",
                    id, journal.trust_domain, existing
                )));
            }
            (Some(id), None) => return Err(TrustplaneError::not_found(RESOURCE, id.to_string())),
            (None, Some(existing)) => existing,
            (None, None) => {
                self.next_journal_id += 1;
                self.next_journal_id
            }
        };

        journal.id = Some(id);
        self.journals.insert(id, journal.clone());
        Ok(journal)
    }

    pub(super) fn fetch_ca_journal(&self, active_x509_authority_id: &str) -> Option<CaJournal> {
        if active_x509_authority_id.is_empty() {
            return None;
        }
        self.journals
            .values()
            .find(|j| j.active_x509_authority_id == active_x509_authority_id)
            .cloned()
    }

    pub(super) fn list_ca_journals(&self) -> Vec<CaJournal> {
        self.journals.values().cloned().collect()
    }

    /// Whole journals only: a journal with any unexpired authority is kept intact.
    pub(super) fn prune_ca_journals(&mut self, all_cas_expire_before: DateTime<Utc>) -> usize {
        let before = self.journals.len();
        self.journals.retain(|id, journal| {
            let expired = journal.all_expired_before(all_cas_expire_before);
            if expired {
                info!(journal_id = id, trust_domain = %journal.trust_domain, "Pruned CA journal");
            }
            !expired
        });
        before - self.journals.len()
    }

    /// Taint or revoke an authority in both the journal and the bundle of the
    /// trust domain. Both are checked before either is written.
    pub(super) fn change_authority(
        &mut self,
        trust_domain: &TrustDomain,
        kind: AuthorityKind,
        authority_id: &str,
        change: AuthorityChange,
    ) -> Result<Option<PublicKey>> {
        let journal_entry = self
            .journals
            .iter()
            .find(|(_, j)| &j.trust_domain == trust_domain)
            .map(|(id, j)| (*id, j.clone()));
        let mut bundle = self.bundles.get(trust_domain.as_str()).cloned();

        let in_journal = journal_entry
            .as_ref()
            .is_some_and(|(_, j)| j.find(kind, authority_id).is_some());
        let in_bundle = bundle.as_ref().is_some_and(|b| match kind {
            AuthorityKind::X509 => b.root_cas.iter().any(|ca| ca.authority_id == authority_id),
            AuthorityKind::Jwt => b.jwt_signing_keys.iter().any(|k| k.key_id == authority_id),
        });
        if !in_journal && !in_bundle {
            return Err(TrustplaneError::invalid_argument(format!(
                "no {} authority '{}' found for trust domain '{}'",
                kind, authority_id, trust_domain
            )));
        }

        let updated_journal = match journal_entry {
            Some((id, mut journal)) if in_journal => {
                match change {
                    AuthorityChange::Taint => journal.taint(kind, authority_id)?,
                    AuthorityChange::Revoke => journal.revoke(kind, authority_id)?,
                }
                Some((id, journal))
            }
            _ => None,
        };

        let mut affected_key = updated_journal.as_ref().and_then(|(_, j)| {
            j.find(kind, authority_id).map(|a| PublicKey {
                key_id: a.authority_id.clone(),
                pkix_bytes: a.public_key.clone(),
                expires_at: a.expires_at,
                tainted: change == AuthorityChange::Taint,
            })
        });

        if let (Some(b), true) = (bundle.as_mut(), in_bundle) {
            match (kind, change) {
                (AuthorityKind::X509, AuthorityChange::Taint) => {
                    if let Some(ca) = b.root_ca_mut(authority_id) {
                        if ca.tainted && !in_journal {
                            return Err(TrustplaneError::invalid_argument(format!(
                                "root CA '{}' is already tainted",
                                authority_id
                            )));
                        }
                        ca.tainted = true;
                    }
                }
                (AuthorityKind::X509, AuthorityChange::Revoke) => {
                    b.root_cas.retain(|ca| ca.authority_id != authority_id);
                }
                (AuthorityKind::Jwt, AuthorityChange::Taint) => {
                    if let Some(key) = b.jwt_key_mut(authority_id) {
                        if key.tainted && !in_journal {
                            return Err(TrustplaneError::invalid_argument(format!(
                                "JWT key '{}' is already tainted",
                                authority_id
                            )));
                        }
                        key.tainted = true;
                        affected_key = Some(key.clone());
                    }
                }
                (AuthorityKind::Jwt, AuthorityChange::Revoke) => {
                    let position = b.jwt_signing_keys.iter().position(|k| k.key_id == authority_id);
                    if let Some(pos) = position {
                        affected_key = Some(b.jwt_signing_keys.remove(pos));
                    }
                }
            }
            b.sequence_number += 1;
        }

        if let Some((id, journal)) = updated_journal {
            self.journals.insert(id, journal);
        }
        if let (Some(b), true) = (bundle, in_bundle) {
            self.bundles.insert(trust_domain.to_string(), b);
        }

        warn!(
            trust_domain = %trust_domain,
            kind = %kind,
            authority_id = %authority_id,
            change = ?change,
            "Authority trust changed"
        );
        Ok(affected_key)
    }
}
