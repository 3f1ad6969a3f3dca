//! Request, filter and response types of the storage contract.

use chrono::{DateTime, Utc};

use crate::domain::{
    AttestedNode, Bundle, FederationRelationship, MatchBehavior, RegistrationEntry, Selector,
    SpiffeId, StoreEvent, TrustDomain,
};

/// Read consistency requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataConsistency {
    /// Read the latest committed state
    #[default]
    RequireCurrent,
    /// A replica that lags slightly is acceptable
    AllowStale,
}

/// Key-ordered page request. The token is the last key of the previous page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    pub token: Option<String>,
    pub page_size: usize,
}

impl Pagination {
    pub fn first(page_size: usize) -> Self {
        Self { token: None, page_size }
    }

    pub fn next(&self, token: Option<String>) -> Option<Self> {
        token.map(|token| Self { token: Some(token), page_size: self.page_size })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BySelectors {
    pub selectors: Vec<Selector>,
    pub match_behavior: MatchBehavior,
}

impl BySelectors {
    pub fn new(selectors: Vec<Selector>, match_behavior: MatchBehavior) -> Self {
        Self { selectors, match_behavior }
    }

    pub fn matches(&self, record: &[Selector]) -> bool {
        self.match_behavior.matches(record, &self.selectors)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListBundlesRequest {
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListBundlesResponse {
    pub bundles: Vec<Bundle>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttestedNodeFilter {
    pub by_attestation_type: Option<String>,
    pub by_banned: Option<bool>,
    pub by_expires_before: Option<DateTime<Utc>>,
    pub by_selectors: Option<BySelectors>,
    pub by_can_reattest: Option<bool>,
}

impl AttestedNodeFilter {
    pub fn matches(&self, node: &AttestedNode, selectors: &[Selector]) -> bool {
        if let Some(attestation_type) = &self.by_attestation_type {
            if &node.attestation_type != attestation_type {
                return false;
            }
        }
        if let Some(banned) = self.by_banned {
            if node.is_banned() != banned {
                return false;
            }
        }
        if let Some(before) = self.by_expires_before {
            if node.cert_not_after >= before {
                return false;
            }
        }
        if let Some(by_selectors) = &self.by_selectors {
            if !by_selectors.matches(selectors) {
                return false;
            }
        }
        if let Some(can_reattest) = self.by_can_reattest {
            if node.can_reattest != can_reattest {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListAttestedNodesRequest {
    pub filter: AttestedNodeFilter,
    /// Populate `AttestedNode::selectors` in the response
    pub fetch_selectors: bool,
    pub pagination: Option<Pagination>,
    pub consistency: DataConsistency,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListAttestedNodesResponse {
    pub nodes: Vec<AttestedNode>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationEntryFilter {
    pub by_parent_id: Option<SpiffeId>,
    pub by_spiffe_id: Option<SpiffeId>,
    pub by_selectors: Option<BySelectors>,
    /// Entries federating with any of these trust domains
    pub by_federates_with: Option<Vec<TrustDomain>>,
    pub by_hint: Option<String>,
    pub by_downstream: Option<bool>,
}

impl RegistrationEntryFilter {
    pub fn by_parent(parent_id: SpiffeId) -> Self {
        Self { by_parent_id: Some(parent_id), ..Default::default() }
    }

    pub fn by_spiffe_id(spiffe_id: SpiffeId) -> Self {
        Self { by_spiffe_id: Some(spiffe_id), ..Default::default() }
    }

    pub fn matches(&self, entry: &RegistrationEntry) -> bool {
        if let Some(parent_id) = &self.by_parent_id {
            if &entry.parent_id != parent_id {
                return false;
            }
        }
        if let Some(spiffe_id) = &self.by_spiffe_id {
            if &entry.spiffe_id != spiffe_id {
                return false;
            }
        }
        if let Some(by_selectors) = &self.by_selectors {
            if !by_selectors.matches(&entry.selectors) {
                return false;
            }
        }
        if let Some(domains) = &self.by_federates_with {
            if !entry.federates_with.iter().any(|td| domains.contains(td)) {
                return false;
            }
        }
        if let Some(hint) = &self.by_hint {
            if &entry.hint != hint {
                return false;
            }
        }
        if let Some(downstream) = self.by_downstream {
            if entry.downstream != downstream {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRegistrationEntriesRequest {
    pub filter: RegistrationEntryFilter,
    pub pagination: Option<Pagination>,
    pub consistency: DataConsistency,
}

impl ListRegistrationEntriesRequest {
    pub fn with_filter(filter: RegistrationEntryFilter) -> Self {
        Self { filter, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRegistrationEntriesResponse {
    pub entries: Vec<RegistrationEntry>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListNodeSelectorsRequest {
    /// Only nodes whose certificate is still valid at this time
    pub valid_at: Option<DateTime<Utc>>,
    pub consistency: DataConsistency,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFederationRelationshipsRequest {
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFederationRelationshipsResponse {
    pub relationships: Vec<FederationRelationship>,
    pub next_token: Option<String>,
}

/// Event range request: IDs strictly greater than `greater_than_event_id`
/// and, if set, strictly less than `less_than_event_id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListEventsRequest {
    pub greater_than_event_id: u64,
    pub less_than_event_id: Option<u64>,
    pub limit: Option<usize>,
}

impl ListEventsRequest {
    pub fn since(cursor: u64) -> Self {
        Self { greater_than_event_id: cursor, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEventsResponse<E: StoreEvent> {
    pub events: Vec<E>,
    /// Highest event ID ever issued for this kind
    pub latest_event_id: u64,
    /// Some event after the requested cursor has already been pruned
    pub cursor_too_old: bool,
}
