//! The call-counting decorator stacked over fault injection and the memory store

use std::sync::Arc;

use trustplane::domain::{
    EntryId, RegistrationEntry, RegistrationEntryMask, Selector, SpiffeId, TrustDomain,
};
use trustplane::observability::RecordingCallMetrics;
use trustplane::services::AuthorizedEntryResolver;
use trustplane::storage::{
    DataStore, EntityKind, FaultInjectingDataStore, MemoryDataStore, MetricsDataStore,
    Operation, RegistrationEntryFilter, Verb,
};
use trustplane::TrustplaneError;

type Stack = MetricsDataStore<FaultInjectingDataStore<MemoryDataStore>>;

fn stack() -> (Arc<Stack>, Arc<RecordingCallMetrics>) {
    let metrics = Arc::new(RecordingCallMetrics::new());
    let store = MetricsDataStore::new(
        FaultInjectingDataStore::new(MemoryDataStore::new()),
        metrics.clone(),
    )
    .with_trust_domain(TrustDomain::new("example.org").unwrap());
    (Arc::new(store), metrics)
}

fn agent_id() -> SpiffeId {
    SpiffeId::parse("spiffe://example.org/spire/agent/a").unwrap()
}

fn entry(n: usize) -> RegistrationEntry {
    RegistrationEntry::new(
        agent_id(),
        SpiffeId::parse(&format!("spiffe://example.org/w/{}", n)).unwrap(),
        vec![Selector::new("unix", "uid:1")],
    )
}

const ENTRY_CREATE: Operation = Operation::new(EntityKind::RegistrationEntry, Verb::Create);

#[tokio::test]
async fn every_status_is_recorded() {
    let (store, metrics) = stack();
    let created = store.create_registration_entry(entry(0)).await.unwrap();

    let err = store.create_registration_entry(entry(0)).await.unwrap_err();
    assert!(err.is_already_exists());

    let missing = entry(1).with_id(EntryId::from_string("missing".into()));
    let err = store
        .update_registration_entry(missing, RegistrationEntryMask::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = store
        .create_registration_entry(RegistrationEntry::new(agent_id(), agent_id(), vec![]))
        .await
        .unwrap_err();
    assert!(err.is_invalid_argument());

    store.inner().set_next_error(TrustplaneError::internal("connection reset"));
    let err = store.fetch_registration_entry(&created.id).await.unwrap_err();
    assert!(err.is_retryable());

    let update = Operation::new(EntityKind::RegistrationEntry, Verb::Update);
    let fetch = Operation::new(EntityKind::RegistrationEntry, Verb::Fetch);
    assert_eq!(metrics.count(ENTRY_CREATE, "ok"), 1);
    assert_eq!(metrics.count(ENTRY_CREATE, "already_exists"), 1);
    assert_eq!(metrics.count(ENTRY_CREATE, "invalid_argument"), 1);
    assert_eq!(metrics.count(update, "not_found"), 1);
    assert_eq!(metrics.count(fetch, "internal"), 1);
    assert!(metrics.calls().iter().all(|c| c.trust_domain.as_deref() == Some("example.org")));

    // the injected failure never reached the backend
    let stored = store.inner().inner().fetch_registration_entry(&created.id).await.unwrap();
    assert_eq!(stored, Some(created));
}

#[tokio::test]
async fn decorated_results_match_the_bare_store() {
    let (metered, metrics) = stack();
    let bare: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new());
    let metered_dyn: Arc<dyn DataStore> = metered.clone();

    for store in [&bare, &metered_dyn] {
        let alias = RegistrationEntry::new(
            agent_id().trust_domain().server_id(),
            SpiffeId::parse("spiffe://example.org/blue").unwrap(),
            vec![Selector::new("tag", "blue")],
        )
        .with_id(EntryId::parse("alias").unwrap());
        let child = RegistrationEntry::new(
            SpiffeId::parse("spiffe://example.org/blue").unwrap(),
            SpiffeId::parse("spiffe://example.org/blue/app").unwrap(),
            vec![Selector::new("unix", "uid:2")],
        )
        .with_id(EntryId::parse("child").unwrap());
        store.set_node_selectors(&agent_id(), vec![Selector::new("tag", "blue")]).await.unwrap();
        store.create_registration_entry(alias).await.unwrap();
        store.create_registration_entry(child).await.unwrap();
    }

    let ids = |entries: Vec<RegistrationEntry>| -> Vec<String> {
        entries.into_iter().map(|e| e.id.into_string()).collect()
    };
    let from_bare = AuthorizedEntryResolver::new(bare).authorized_entries(&agent_id()).await;
    let from_metered =
        AuthorizedEntryResolver::new(metered_dyn).authorized_entries(&agent_id()).await;
    assert_eq!(ids(from_bare.unwrap()), ids(from_metered.unwrap()));
    let listed = metered.list_registration_entries(Default::default()).await.unwrap();
    assert_eq!(ids(listed.entries), vec!["alias", "child"]);

    let list = Operation::new(EntityKind::RegistrationEntry, Verb::List);
    assert!(metrics.count(list, "ok") >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_are_each_counted() {
    let (store, metrics) = stack();
    let tasks: Vec<_> = (0..16)
        .map(|n| {
            let store = store.clone();
            tokio::spawn(async move { store.create_registration_entry(entry(n)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(metrics.count(ENTRY_CREATE, "ok"), 16);
    let count = store.count_registration_entries(RegistrationEntryFilter::default()).await;
    assert_eq!(count.unwrap(), 16);
}
