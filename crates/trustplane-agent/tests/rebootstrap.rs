//! Rebootstrap decisions driven through the agent loop

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use trustplane::domain::{Bundle, RegistrationEntry, RootCa, Selector, SpiffeId, TrustDomain};
use trustplane::storage::{DataStore, MemoryDataStore};
use trustplane::utils::ManualClock;
use trustplane_agent::{
    Agent, AgentConfig, AgentError, AttestationResult, NodeAttestor, RebootstrapConfig,
    RebootstrapMode, ServerIdentity, StoreEntrySource, SyncKind, TrustState,
};

fn td() -> TrustDomain {
    TrustDomain::new("example.org").unwrap()
}

fn agent_id() -> SpiffeId {
    SpiffeId::parse("spiffe://example.org/spire/agent/node-1").unwrap()
}

fn root_ca(authority_id: &str) -> RootCa {
    RootCa {
        authority_id: authority_id.to_string(),
        der: authority_id.as_bytes().to_vec(),
        expires_at: Utc::now() + Duration::days(1),
        tainted: false,
    }
}

/// Counts attestations; each one grants a bundle that includes `ca-2`.
/// The first `failures` attempts fail, and a gated attestor waits for
/// `release` before answering.
struct CountingAttestor {
    calls: AtomicUsize,
    failures: usize,
    entered: Notify,
    release: Option<Notify>,
}

impl CountingAttestor {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
            entered: Notify::new(),
            release: None,
        })
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: 0,
            entered: Notify::new(),
            release: Some(Notify::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeAttestor for CountingAttestor {
    fn attestation_type(&self) -> &str {
        "counting"
    }

    async fn attest(&self) -> trustplane_agent::Result<AttestationResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.entered.notify_one();
        if let Some(release) = &self.release {
            release.notified().await;
        }
        if call <= self.failures {
            return Err(AgentError::attestation("attestor unavailable"));
        }
        let bundle =
            Bundle::new(td()).with_root_ca(root_ca("ca-1")).with_root_ca(root_ca("ca-2"));
        Ok(AttestationResult { agent_id: agent_id(), bundle })
    }
}

struct Harness {
    agent: Agent,
    store: Arc<MemoryDataStore>,
    source: Arc<StoreEntrySource>,
    attestor: Arc<CountingAttestor>,
    clock: ManualClock,
}

async fn harness(rebootstrap: RebootstrapConfig, failures: usize) -> Harness {
    harness_with(rebootstrap, CountingAttestor::new(failures)).await
}

async fn harness_with(
    rebootstrap: RebootstrapConfig,
    attestor: Arc<CountingAttestor>,
) -> Harness {
    let store = Arc::new(MemoryDataStore::new());
    store.create_bundle(Bundle::new(td()).with_root_ca(root_ca("ca-1"))).await.unwrap();

    let mut config = AgentConfig::new(agent_id());
    config.rebootstrap = rebootstrap;
    let clock = ManualClock::default();
    let source = Arc::new(StoreEntrySource::new(store.clone(), td()));
    let agent =
        Agent::with_clock(config, source.clone(), attestor.clone(), Arc::new(clock.clone()))
            .unwrap();
    let trusted = Bundle::new(td()).with_root_ca(root_ca("ca-1"));
    agent.synchronizer().set_trust_bundle(trusted).unwrap();
    Harness { agent, store, source, attestor, clock }
}

/// The server moves to an authority the agent has never seen
async fn present_unknown_identity(h: &Harness) {
    let rotated = Bundle::new(td()).with_root_ca(root_ca("ca-2"));
    h.store.append_bundle(rotated).await.unwrap();
    let identity = ServerIdentity::new(td().server_id(), "ca-2");
    h.source.present_identity(Some(identity)).unwrap();
}

#[tokio::test]
async fn never_mode_stays_suspect_without_attesting() {
    let h = harness(RebootstrapConfig::default(), 0).await;
    let cancel = CancellationToken::new();
    assert!(h.agent.tick(&cancel).await.unwrap().is_some());

    present_unknown_identity(&h).await;
    for _ in 0..3 {
        h.clock.advance(Duration::hours(12));
        assert_eq!(h.agent.tick(&cancel).await.unwrap(), None);
    }
    assert_eq!(h.agent.rebootstrapper().state().unwrap(), TrustState::Suspect);
    assert_eq!(h.attestor.calls(), 0);
}

#[tokio::test]
async fn auto_mode_waits_for_rebootstrap_delay() {
    let config = RebootstrapConfig {
        mode: RebootstrapMode::Auto,
        delay: std::time::Duration::from_secs(3600),
        retry_bootstrap: true,
    };
    let h = harness(config, 0).await;
    let cancel = CancellationToken::new();

    // last rotation 30 minutes before the server changes identity
    h.agent.record_svid_rotation().unwrap();
    h.clock.advance(Duration::minutes(30));

    present_unknown_identity(&h).await;
    assert_eq!(h.agent.tick(&cancel).await.unwrap(), None);
    assert_eq!(h.agent.rebootstrapper().state().unwrap(), TrustState::Suspect);
    assert_eq!(h.attestor.calls(), 0);

    h.clock.advance(Duration::minutes(40));
    let report = h.agent.tick(&cancel).await.unwrap().unwrap();
    assert_eq!(report.kind, SyncKind::Full);
    assert_eq!(h.attestor.calls(), 1);
    assert_eq!(h.agent.rebootstrapper().state().unwrap(), TrustState::Trusted);
}

#[tokio::test]
async fn always_mode_rebootstraps_and_resyncs() {
    let config = RebootstrapConfig { mode: RebootstrapMode::Always, ..Default::default() };
    let h = harness(config, 0).await;
    let cancel = CancellationToken::new();

    present_unknown_identity(&h).await;
    let report = h.agent.tick(&cancel).await.unwrap().unwrap();
    assert_eq!(report.kind, SyncKind::Full);
    assert_eq!(h.attestor.calls(), 1);

    // the new authority is now part of the trusted bundle
    let next = h.agent.tick(&cancel).await.unwrap().unwrap();
    assert_eq!(next.kind, SyncKind::Incremental);
}

#[tokio::test]
async fn recognized_identity_clears_suspicion() {
    let h = harness(RebootstrapConfig::default(), 0).await;
    let cancel = CancellationToken::new();

    present_unknown_identity(&h).await;
    assert_eq!(h.agent.tick(&cancel).await.unwrap(), None);
    h.source.present_identity(None).unwrap();
    assert!(h.agent.tick(&cancel).await.unwrap().is_some());
    assert_eq!(h.agent.rebootstrapper().state().unwrap(), TrustState::Trusted);
}

#[tokio::test]
async fn failed_attestation_without_retry_is_terminal() {
    let config = RebootstrapConfig { mode: RebootstrapMode::Always, ..Default::default() };
    let h = harness(config, usize::MAX).await;
    let cancel = CancellationToken::new();

    present_unknown_identity(&h).await;
    let err = h.agent.tick(&cancel).await.unwrap_err();
    assert!(matches!(err, AgentError::Attestation { .. }));
    assert_eq!(h.agent.rebootstrapper().state().unwrap(), TrustState::Failed);

    h.clock.advance(Duration::days(1));
    assert_eq!(h.agent.tick(&cancel).await.unwrap(), None);
    assert_eq!(h.attestor.calls(), 1);
}

/// An entry the store gains after the agent last synced
async fn register_workload(h: &Harness) {
    let entry = RegistrationEntry::new(
        agent_id(),
        SpiffeId::parse("spiffe://example.org/late").unwrap(),
        vec![Selector::new("unix", "uid:7")],
    );
    h.store.create_registration_entry(entry).await.unwrap();
}

#[tokio::test]
async fn failed_agent_stops_syncing_with_recognized_server() {
    let config = RebootstrapConfig { mode: RebootstrapMode::Always, ..Default::default() };
    let h = harness(config, usize::MAX).await;
    let cancel = CancellationToken::new();

    present_unknown_identity(&h).await;
    assert!(h.agent.tick(&cancel).await.is_err());
    let bundle_before = h.agent.synchronizer().trust_bundle().unwrap();

    register_workload(&h).await;
    h.source.present_identity(None).unwrap();
    assert_eq!(h.agent.tick(&cancel).await.unwrap(), None);

    let sync = h.agent.synchronizer();
    assert!(sync.cache().snapshot().unwrap().is_empty());
    assert!(sync.cursor().await.is_none());
    assert_eq!(sync.trust_bundle().unwrap(), bundle_before);
    assert_eq!(h.agent.rebootstrapper().state().unwrap(), TrustState::Failed);
    assert_eq!(h.attestor.calls(), 1);
}

#[tokio::test]
async fn failed_agent_retries_before_syncing_again() {
    let config = RebootstrapConfig {
        mode: RebootstrapMode::Always,
        retry_bootstrap: true,
        ..Default::default()
    };
    let h = harness(config, 1).await;
    let cancel = CancellationToken::new();

    present_unknown_identity(&h).await;
    assert!(h.agent.tick(&cancel).await.is_err());
    register_workload(&h).await;
    h.source.present_identity(None).unwrap();

    // backoff not elapsed
    assert_eq!(h.agent.tick(&cancel).await.unwrap(), None);
    assert_eq!(h.attestor.calls(), 1);

    h.clock.advance(Duration::minutes(1));
    let report = h.agent.tick(&cancel).await.unwrap().unwrap();
    assert_eq!(report.kind, SyncKind::Full);
    assert_eq!(report.entries, 1);
    assert_eq!(h.attestor.calls(), 2);
    assert_eq!(h.agent.rebootstrapper().state().unwrap(), TrustState::Trusted);
}

#[tokio::test]
async fn rebootstrap_in_progress_holds_other_ticks() {
    let config = RebootstrapConfig { mode: RebootstrapMode::Always, ..Default::default() };
    let h = Arc::new(harness_with(config, CountingAttestor::gated()).await);
    let cancel = CancellationToken::new();

    present_unknown_identity(&h).await;
    let first = {
        let h = h.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { h.agent.tick(&cancel).await })
    };
    h.attestor.entered.notified().await;
    assert_eq!(h.agent.rebootstrapper().state().unwrap(), TrustState::Rebootstrapping);

    register_workload(&h).await;
    h.source.present_identity(None).unwrap();
    assert_eq!(h.agent.tick(&cancel).await.unwrap(), None);
    assert!(h.agent.synchronizer().cache().snapshot().unwrap().is_empty());

    if let Some(release) = &h.attestor.release {
        release.notify_one();
    }
    let report = first.await.unwrap().unwrap().unwrap();
    assert_eq!(report.kind, SyncKind::Full);
    assert_eq!(report.entries, 1);
    assert_eq!(h.agent.rebootstrapper().state().unwrap(), TrustState::Trusted);
}
