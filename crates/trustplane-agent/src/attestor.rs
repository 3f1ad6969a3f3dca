//! Node attestation.

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use tracing::{info, instrument};

use trustplane::domain::{AttestedNode, Bundle, SpiffeId, TrustDomain};
use trustplane::storage::DataStore;
use trustplane::utils::{Clock, SystemClock};

use crate::error::{AgentError, Result};

/// Identity and trust bundle granted by a successful attestation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationResult {
    pub agent_id: SpiffeId,
    pub bundle: Bundle,
}

#[async_trait]
pub trait NodeAttestor: Send + Sync {
    fn attestation_type(&self) -> &str;

    async fn attest(&self) -> Result<AttestationResult>;
}

/// Attests with a one-time join token. The token is consumed by the first
/// attempt, so a second attestation with the same token fails.
pub struct JoinTokenAttestor {
    store: Arc<dyn DataStore>,
    trust_domain: TrustDomain,
    token: String,
    svid_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl JoinTokenAttestor {
    pub const ATTESTATION_TYPE: &'static str = "join_token";

    pub fn new(store: Arc<dyn DataStore>, trust_domain: TrustDomain, token: String) -> Self {
        Self {
            store,
            trust_domain,
            token,
            svid_ttl: Duration::hours(1),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_svid_ttl(mut self, ttl: Duration) -> Self {
        self.svid_ttl = ttl;
        self
    }

    /// The ID a node attested with `token` receives
    pub fn agent_id(trust_domain: &TrustDomain, token: &str) -> Result<SpiffeId> {
        let segments = ["spire", "agent", Self::ATTESTATION_TYPE, token];
        Ok(SpiffeId::from_segments(trust_domain, &segments)?)
    }
}

#[async_trait]
impl NodeAttestor for JoinTokenAttestor {
    fn attestation_type(&self) -> &str {
        Self::ATTESTATION_TYPE
    }

    #[instrument(skip(self), fields(trust_domain = %self.trust_domain))]
    async fn attest(&self) -> Result<AttestationResult> {
        let now = self.clock.now();
        let token = self
            .store
            .fetch_join_token(&self.token)
            .await?
            .ok_or_else(|| AgentError::attestation("join token not found or already used"))?;

        // consumed whether or not it is still valid
        self.store.delete_join_token(&token.token).await?;
        if token.expires_at <= now {
            return Err(AgentError::attestation("join token expired"));
        }

        let agent_id = Self::agent_id(&self.trust_domain, &token.token)?;
        let serial = format!("{:x}", now.timestamp_micros());
        let not_after = now + self.svid_ttl;
        let node = AttestedNode::new(agent_id.clone(), Self::ATTESTATION_TYPE, serial, not_after);
        self.store.create_attested_node(node).await.map_err(|e| {
            if e.is_already_exists() {
                AgentError::attestation(format!("node '{}' is already attested", agent_id))
            } else {
                e.into()
            }
        })?;

        let bundle = self
            .store
            .fetch_bundle(&self.trust_domain)
            .await?
            .ok_or_else(|| AgentError::attestation("trust domain has no bundle"))?;

        info!(agent_id = %agent_id, "Node attested");
        Ok(AttestationResult { agent_id, bundle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustplane::domain::{JoinToken, RootCa};
    use trustplane::storage::MemoryDataStore;
    use trustplane::utils::ManualClock;

    fn td() -> TrustDomain {
        TrustDomain::new("example.org").unwrap()
    }

    async fn store_with_bundle() -> Arc<MemoryDataStore> {
        let store = Arc::new(MemoryDataStore::new());
        let bundle = Bundle::new(td()).with_root_ca(RootCa {
            authority_id: "ca-1".into(),
            der: vec![1],
            expires_at: chrono::Utc::now() + Duration::hours(1),
            tainted: false,
        });
        store.create_bundle(bundle).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_join_token_is_single_use() {
        let store = store_with_bundle().await;
        let clock = ManualClock::default();
        let token = JoinToken::new("abc", clock.now() + Duration::minutes(5));
        store.create_join_token(token).await.unwrap();

        let attestor = JoinTokenAttestor::new(store.clone(), td(), "abc".into())
            .with_clock(Arc::new(clock.clone()));
        let result = attestor.attest().await.unwrap();
        let expected = "spiffe://example.org/spire/agent/join_token/abc";
        assert_eq!(result.agent_id.to_string(), expected);
        assert_eq!(result.bundle.root_cas.len(), 1);

        let node = store.fetch_attested_node(&result.agent_id).await.unwrap().unwrap();
        assert_eq!(node.attestation_type, "join_token");
        assert!(store.fetch_join_token("abc").await.unwrap().is_none());

        let err = attestor.attest().await.unwrap_err();
        assert!(matches!(err, AgentError::Attestation { .. }));
    }

    #[tokio::test]
    async fn test_expired_token_rejected_and_consumed() {
        let store = store_with_bundle().await;
        let clock = ManualClock::default();
        let token = JoinToken::new("late", clock.now() + Duration::minutes(1));
        store.create_join_token(token).await.unwrap();
        clock.advance(Duration::minutes(2));

        let attestor = JoinTokenAttestor::new(store.clone(), td(), "late".into())
            .with_clock(Arc::new(clock));
        assert!(attestor.attest().await.is_err());
        assert!(store.fetch_join_token("late").await.unwrap().is_none());
        assert_eq!(store.count_attested_nodes(Default::default()).await.unwrap(), 0);
    }
}
