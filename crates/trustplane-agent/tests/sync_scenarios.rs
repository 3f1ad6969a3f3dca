//! End-to-end synchronization against an in-memory trust store

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use trustplane::domain::{
    AttestedNode, AttestedNodeEvent, Bundle, EntryId, RegistrationEntry, RegistrationEntryEvent,
    RootCa, Selector, SpiffeId, TrustDomain,
};
use trustplane::storage::{DataStore, FaultInjectingDataStore, MemoryDataStore};
use trustplane::TrustplaneError;
use trustplane_agent::source::{EventBatch, LatestEventIds};
use trustplane_agent::{
    AgentConfig, EntrySource, ServerIdentity, StoreEntrySource, SyncKind, Synchronizer,
};

fn td() -> TrustDomain {
    TrustDomain::new("example.org").unwrap()
}

fn id(path: &str) -> SpiffeId {
    SpiffeId::parse(&format!("spiffe://example.org{}", path)).unwrap()
}

fn agent_id() -> SpiffeId {
    id("/spire/agent/node-1")
}

fn bundle() -> Bundle {
    Bundle::new(td()).with_root_ca(RootCa {
        authority_id: "ca-1".into(),
        der: vec![1],
        expires_at: Utc::now() + Duration::hours(1),
        tainted: false,
    })
}

async fn seeded_store() -> Arc<MemoryDataStore> {
    let store = Arc::new(MemoryDataStore::new());
    store.create_bundle(bundle()).await.unwrap();
    store
}

fn synchronizer(store: Arc<dyn DataStore>) -> Synchronizer {
    let source = Arc::new(StoreEntrySource::new(store, td()));
    Synchronizer::new(&AgentConfig::new(agent_id()), source).with_trust_bundle(bundle())
}

async fn create(store: &dyn DataStore, parent: SpiffeId, path: &str) -> RegistrationEntry {
    create_with(store, parent, path, Selector::new("unix", "uid:1")).await
}

/// Node aliases match agents whose node selectors include `tag:blue`
async fn create_alias(store: &dyn DataStore, path: &str) -> RegistrationEntry {
    let server = agent_id().trust_domain().server_id();
    create_with(store, server, path, Selector::new("tag", "blue")).await
}

async fn create_with(
    store: &dyn DataStore,
    parent: SpiffeId,
    path: &str,
    selector: Selector,
) -> RegistrationEntry {
    let entry = RegistrationEntry::new(parent, id(path), vec![selector]);
    store.create_registration_entry(entry).await.unwrap()
}

fn cached_ids(sync: &Synchronizer) -> BTreeSet<EntryId> {
    sync.cache().snapshot().unwrap().ids().cloned().collect()
}

#[tokio::test]
async fn incremental_sync_applies_creates_and_deletes() -> anyhow::Result<()> {
    let store = seeded_store().await;
    let sync = synchronizer(store.clone());
    let cancel = CancellationToken::new();
    assert_eq!(sync.sync_once(&cancel).await?.kind, SyncKind::Full);

    let a = create(store.as_ref(), agent_id(), "/a").await;
    let b = create(store.as_ref(), agent_id(), "/b").await;
    store.delete_registration_entry(&a.id).await?;

    let report = sync.sync_once(&cancel).await?;
    assert_eq!(report.kind, SyncKind::Incremental);
    assert_eq!(report.cursor.entry_event_id, 3);
    assert_eq!(cached_ids(&sync), BTreeSet::from([b.id]));
    Ok(())
}

#[tokio::test]
async fn too_old_cursor_matches_full_sync() {
    let store = seeded_store().await;
    store.set_node_selectors(&agent_id(), vec![Selector::new("tag", "blue")]).await.unwrap();

    let sync = synchronizer(store.clone());
    let cancel = CancellationToken::new();
    sync.sync_once(&cancel).await.unwrap();

    create(store.as_ref(), agent_id(), "/direct").await;
    create_alias(store.as_ref(), "/blue").await;
    create(store.as_ref(), id("/blue"), "/blue-app").await;
    create(store.as_ref(), id("/spire/agent/other"), "/foreign").await;
    store.prune_registration_entry_events(std::time::Duration::ZERO).await.unwrap();

    let report = sync.sync_once(&cancel).await.unwrap();
    assert_eq!(report.kind, SyncKind::Full);

    let fresh = synchronizer(store.clone());
    fresh.sync_once(&cancel).await.unwrap();
    assert_eq!(cached_ids(&sync), cached_ids(&fresh));
    assert_eq!(cached_ids(&sync).len(), 3);
}

#[tokio::test]
async fn incremental_result_equals_full_sync() {
    let store = seeded_store().await;
    store.set_node_selectors(&agent_id(), vec![Selector::new("tag", "blue")]).await.unwrap();
    let blue = create_alias(store.as_ref(), "/blue").await;
    create(store.as_ref(), id("/blue"), "/blue-app").await;

    let sync = synchronizer(store.clone());
    let cancel = CancellationToken::new();
    sync.sync_once(&cancel).await.unwrap();
    assert_eq!(cached_ids(&sync).len(), 2);

    // re-parent the alias subtree under a second alias and drop the first
    create_alias(store.as_ref(), "/blue-2").await;
    create(store.as_ref(), id("/blue-2"), "/blue").await;
    store.delete_registration_entry(&blue.id).await.unwrap();
    let report = sync.sync_once(&cancel).await.unwrap();
    assert_eq!(report.kind, SyncKind::Incremental);

    let fresh = synchronizer(store.clone());
    fresh.sync_once(&cancel).await.unwrap();
    assert_eq!(cached_ids(&sync), cached_ids(&fresh));
}

#[tokio::test]
async fn own_node_event_forces_full_sync() {
    let store = seeded_store().await;
    let sync = synchronizer(store.clone());
    let cancel = CancellationToken::new();
    sync.sync_once(&cancel).await.unwrap();

    let node = AttestedNode::new(agent_id(), "join_token", "1", Utc::now() + Duration::hours(1));
    store.create_attested_node(node).await.unwrap();
    let report = sync.sync_once(&cancel).await.unwrap();
    assert_eq!(report.kind, SyncKind::Full);
    assert_eq!(report.cursor.node_event_id, 1);

    let not_after = Utc::now() + Duration::hours(1);
    let other = AttestedNode::new(id("/spire/agent/other"), "join_token", "2", not_after);
    store.create_attested_node(other).await.unwrap();
    let report = sync.sync_once(&cancel).await.unwrap();
    assert_eq!(report.kind, SyncKind::Incremental);
    assert_eq!(report.cursor.node_event_id, 2);
}

#[tokio::test]
async fn pre_canceled_sync_leaves_state_untouched() {
    let store = seeded_store().await;
    let sync = synchronizer(store.clone());
    create(store.as_ref(), agent_id(), "/a").await;
    sync.sync_once(&CancellationToken::new()).await.unwrap();
    let before_ids = cached_ids(&sync);
    let before_cursor = sync.cursor().await;

    create(store.as_ref(), agent_id(), "/b").await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = sync.sync_once(&cancel).await.unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(cached_ids(&sync), before_ids);
    assert_eq!(sync.cursor().await, before_cursor);
}

/// Cancels the pass while the changed entries are being fetched
struct CancelDuringFetch {
    inner: StoreEntrySource,
    cancel: CancellationToken,
}

#[async_trait]
impl EntrySource for CancelDuringFetch {
    async fn server_identity(&self) -> trustplane::Result<ServerIdentity> {
        self.inner.server_identity().await
    }

    async fn bundle(&self, trust_domain: &TrustDomain) -> trustplane::Result<Option<Bundle>> {
        self.inner.bundle(trust_domain).await
    }

    async fn authorized_entries(
        &self,
        agent_id: &SpiffeId,
    ) -> trustplane::Result<Vec<RegistrationEntry>> {
        self.inner.authorized_entries(agent_id).await
    }

    async fn latest_event_ids(&self) -> trustplane::Result<LatestEventIds> {
        self.inner.latest_event_ids().await
    }

    async fn entry_events_since(
        &self,
        cursor: u64,
    ) -> trustplane::Result<EventBatch<RegistrationEntryEvent>> {
        self.inner.entry_events_since(cursor).await
    }

    async fn node_events_since(
        &self,
        cursor: u64,
    ) -> trustplane::Result<EventBatch<AttestedNodeEvent>> {
        self.inner.node_events_since(cursor).await
    }

    async fn authorized_entries_for_ids(
        &self,
        agent_id: &SpiffeId,
        ids: &[EntryId],
    ) -> trustplane::Result<Vec<RegistrationEntry>> {
        let entries = self.inner.authorized_entries_for_ids(agent_id, ids).await;
        self.cancel.cancel();
        entries
    }
}

#[tokio::test]
async fn cancel_mid_pass_discards_partial_diff() {
    let store = seeded_store().await;
    let cancel = CancellationToken::new();
    let source = Arc::new(CancelDuringFetch {
        inner: StoreEntrySource::new(store.clone(), td()),
        cancel: cancel.clone(),
    });
    let sync =
        Synchronizer::new(&AgentConfig::new(agent_id()), source).with_trust_bundle(bundle());
    sync.sync_once(&cancel).await.unwrap();
    let before_cursor = sync.cursor().await;

    create(store.as_ref(), agent_id(), "/a").await;
    let err = sync.sync_once(&cancel).await.unwrap_err();
    assert!(err.is_canceled());
    assert!(cached_ids(&sync).is_empty());
    assert_eq!(sync.cursor().await, before_cursor);
}

#[tokio::test]
async fn store_failure_keeps_last_good_cache() {
    let faulty = Arc::new(FaultInjectingDataStore::new(MemoryDataStore::new()));
    faulty.create_bundle(bundle()).await.unwrap();
    create(faulty.as_ref(), agent_id(), "/a").await;

    let sync = synchronizer(faulty.clone());
    let cancel = CancellationToken::new();
    sync.sync_once(&cancel).await.unwrap();
    let before = cached_ids(&sync);

    faulty.set_next_error(TrustplaneError::internal("connection reset"));
    let err = sync.sync_once(&cancel).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(cached_ids(&sync), before);

    let report = sync.sync_once(&cancel).await.unwrap();
    assert_eq!(report.entries, 1);
}

#[tokio::test]
async fn event_sync_disabled_always_lists() {
    let store = seeded_store().await;
    let mut config = AgentConfig::new(agent_id());
    config.use_event_sync = false;
    let source = Arc::new(StoreEntrySource::new(store.clone(), td()));
    let sync = Synchronizer::new(&config, source).with_trust_bundle(bundle());
    let cancel = CancellationToken::new();

    sync.sync_once(&cancel).await.unwrap();
    create(store.as_ref(), agent_id(), "/a").await;
    let report = sync.sync_once(&cancel).await.unwrap();
    assert_eq!(report.kind, SyncKind::Full);
    assert_eq!(report.entries, 1);
}
