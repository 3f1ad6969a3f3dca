//! Trust store contract exercised through the in-memory backend

use anyhow::Result;
use chrono::{Duration, Utc};

use trustplane::domain::{
    AttestedNode, AttestedNodeMask, Bundle, EntryId, EventOp, JoinToken, MatchBehavior,
    RegistrationEntry, RegistrationEntryMask, Selector, SpiffeId, TrustDomain,
};
use trustplane::storage::{
    AttestedNodeFilter, BySelectors, DataStore, ListAttestedNodesRequest, ListEventsRequest,
    ListRegistrationEntriesRequest, MemoryDataStore, Pagination, RegistrationEntryFilter,
};

fn id(path: &str) -> SpiffeId {
    SpiffeId::parse(&format!("spiffe://example.org{}", path)).unwrap()
}

fn entry(parent: &str, spiffe: &str, selectors: &[&str]) -> RegistrationEntry {
    let selectors = selectors.iter().map(|s| Selector::parse(s).unwrap()).collect();
    RegistrationEntry::new(id(parent), id(spiffe), selectors)
}

async fn entry_event_count(store: &MemoryDataStore) -> usize {
    store
        .list_registration_entry_events(ListEventsRequest::since(0))
        .await
        .unwrap()
        .events
        .len()
}

#[tokio::test]
async fn fetch_returns_entry_until_deleted_or_pruned() -> Result<()> {
    let store = MemoryDataStore::new();
    let kept = store.create_registration_entry(entry("/agent", "/kept", &["unix:uid:1"])).await?;
    let deleted =
        store.create_registration_entry(entry("/agent", "/deleted", &["unix:uid:2"])).await?;
    let mut expiring = entry("/agent", "/expiring", &["unix:uid:3"]);
    expiring.entry_expiry = Some(Utc::now() - Duration::minutes(1));
    let expiring = store.create_registration_entry(expiring).await?;

    assert_eq!(store.fetch_registration_entry(&kept.id).await?, Some(kept.clone()));
    assert_eq!(store.fetch_registration_entry(&deleted.id).await?, Some(deleted.clone()));

    store.delete_registration_entry(&deleted.id).await?;
    assert_eq!(store.prune_registration_entries(Utc::now()).await?, 1);

    assert_eq!(store.fetch_registration_entry(&kept.id).await?, Some(kept));
    assert!(store.fetch_registration_entry(&deleted.id).await?.is_none());
    assert!(store.fetch_registration_entry(&expiring.id).await?.is_none());

    // both removals are logged as deletions
    let events = store.list_registration_entry_events(ListEventsRequest::since(3)).await?;
    let deletions: Vec<(EntryId, EventOp)> =
        events.events.into_iter().map(|e| (e.entry_id, e.op)).collect();
    assert_eq!(
        deletions,
        vec![(deleted.id, EventOp::Deleted), (expiring.id, EventOp::Deleted)]
    );
    Ok(())
}

#[tokio::test]
async fn create_or_return_is_idempotent() -> Result<()> {
    let store = MemoryDataStore::new();
    let (first, existed) = store
        .create_or_return_registration_entry(entry("/agent", "/web", &["a:1", "b:2"]))
        .await?;
    assert!(!existed);

    // same key with selectors in another order
    let (second, existed) = store
        .create_or_return_registration_entry(entry("/agent", "/web", &["b:2", "a:1"]))
        .await?;
    assert!(existed);
    assert_eq!(second.id, first.id);
    assert_eq!(entry_event_count(&store).await, 1);

    let err = store
        .create_registration_entry(entry("/agent", "/web", &["a:1", "b:2"]))
        .await
        .unwrap_err();
    assert!(err.is_already_exists());
    Ok(())
}

#[tokio::test]
async fn masked_update_leaves_unflagged_fields() -> Result<()> {
    let store = MemoryDataStore::new();
    let mut original = entry("/agent", "/web", &["unix:uid:1"]);
    original.hint = "frontend".into();
    original.x509_svid_ttl = 600;
    let created = store.create_registration_entry(original).await?;

    let mut update = entry("/other", "/changed", &["unix:uid:9"]).with_id(created.id.clone());
    update.hint = "ignored".into();
    update.x509_svid_ttl = 3600;
    let updated = store
        .update_registration_entry(
            update,
            RegistrationEntryMask { x509_svid_ttl: true, ..Default::default() },
        )
        .await?;

    assert_eq!(updated.x509_svid_ttl, 3600);
    assert_eq!(updated.hint, "frontend");
    assert_eq!(updated.parent_id, created.parent_id);
    assert_eq!(updated.spiffe_id, created.spiffe_id);
    assert_eq!(updated.selectors, created.selectors);
    assert_eq!(updated.revision_number, created.revision_number + 1);
    Ok(())
}

#[tokio::test]
async fn update_into_existing_key_is_rejected() -> Result<()> {
    let store = MemoryDataStore::new();
    let a = store.create_registration_entry(entry("/agent", "/a", &["unix:uid:1"])).await?;
    let b = store.create_registration_entry(entry("/agent", "/b", &["unix:uid:1"])).await?;

    let mut collide = b.clone();
    collide.spiffe_id = a.spiffe_id.clone();
    let err = store
        .update_registration_entry(
            collide,
            RegistrationEntryMask { spiffe_id: true, ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(err.is_already_exists());
    assert_eq!(store.fetch_registration_entry(&b.id).await?, Some(b));
    Ok(())
}

#[tokio::test]
async fn invalid_input_changes_nothing() -> Result<()> {
    let store = MemoryDataStore::new();
    let existing = store.create_registration_entry(entry("/agent", "/web", &["unix:uid:1"])).await?;

    let no_selectors = entry("/agent", "/empty", &[]);
    let mut negative_ttl = entry("/agent", "/ttl", &["unix:uid:2"]);
    negative_ttl.jwt_svid_ttl = -1;
    let bad_id = entry("/agent", "/bad-id", &["unix:uid:3"])
        .with_id(EntryId::from_string("not a valid id".into()));
    for invalid in [no_selectors, negative_ttl, bad_id] {
        let err = store.create_registration_entry(invalid).await.unwrap_err();
        assert!(err.is_invalid_argument(), "unexpected error: {}", err);
    }

    let mut emptied = existing.clone();
    emptied.selectors.clear();
    let err = store
        .update_registration_entry(
            emptied,
            RegistrationEntryMask { selectors: true, ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(err.is_invalid_argument());

    let count = store.count_registration_entries(RegistrationEntryFilter::default()).await?;
    assert_eq!(count, 1);
    assert_eq!(store.fetch_registration_entry(&existing.id).await?, Some(existing));
    assert_eq!(entry_event_count(&store).await, 1);
    Ok(())
}

#[tokio::test]
async fn fetch_many_omits_missing_ids() -> Result<()> {
    let store = MemoryDataStore::new();
    let a = store.create_registration_entry(entry("/agent", "/a", &["unix:uid:1"])).await?;
    let b = store.create_registration_entry(entry("/agent", "/b", &["unix:uid:1"])).await?;
    let missing = EntryId::from_string("missing".into());

    let found = store.fetch_registration_entries(&[a.id.clone(), missing, b.id.clone()]).await?;
    assert_eq!(found.len(), 2);
    assert_eq!(found.get(&a.id), Some(&a));
    assert_eq!(found.get(&b.id), Some(&b));
    Ok(())
}

#[tokio::test]
async fn pages_cover_every_entry_in_key_order() -> Result<()> {
    let store = MemoryDataStore::new();
    for i in 0..5 {
        let e = entry("/agent", &format!("/w{}", i), &["unix:uid:1"])
            .with_id(EntryId::parse(&format!("entry-{}", i))?);
        store.create_registration_entry(e).await?;
    }

    let mut seen = Vec::new();
    let mut pagination = Some(Pagination::first(2));
    while let Some(page) = pagination {
        let response = store
            .list_registration_entries(ListRegistrationEntriesRequest {
                pagination: Some(page.clone()),
                ..Default::default()
            })
            .await?;
        assert!(response.entries.len() <= 2);
        seen.extend(response.entries.into_iter().map(|e| e.id.into_string()));
        pagination = page.next(response.next_token);
    }
    assert_eq!(seen, vec!["entry-0", "entry-1", "entry-2", "entry-3", "entry-4"]);
    Ok(())
}

#[tokio::test]
async fn selector_filters_follow_match_behavior() -> Result<()> {
    let store = MemoryDataStore::new();
    let both = store.create_registration_entry(entry("/agent", "/both", &["a:1", "b:2"])).await?;
    let only_a = store.create_registration_entry(entry("/agent", "/a", &["a:1"])).await?;

    let list = |behavior: MatchBehavior, selectors: &[&str]| {
        let selectors = selectors.iter().map(|s| Selector::parse(s).unwrap()).collect();
        let filter = RegistrationEntryFilter {
            by_selectors: Some(BySelectors::new(selectors, behavior)),
            ..Default::default()
        };
        let store = &store;
        async move {
            let request = ListRegistrationEntriesRequest::with_filter(filter);
            let mut ids: Vec<EntryId> = store
                .list_registration_entries(request)
                .await
                .unwrap()
                .entries
                .into_iter()
                .map(|e| e.id)
                .collect();
            ids.sort();
            ids
        }
    };

    assert_eq!(list(MatchBehavior::Exact, &["a:1"]).await, vec![only_a.id.clone()]);
    assert_eq!(list(MatchBehavior::Superset, &["b:2"]).await, vec![both.id.clone()]);
    let mut all = vec![both.id.clone(), only_a.id.clone()];
    all.sort();
    assert_eq!(list(MatchBehavior::Subset, &["a:1", "b:2", "c:3"]).await, all);
    assert_eq!(list(MatchBehavior::MatchAny, &["a:1"]).await, all);
    assert!(list(MatchBehavior::MatchAny, &["c:3"]).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn node_lifecycle_and_missing_keys() -> Result<()> {
    let store = MemoryDataStore::new();
    let node_id = id("/spire/agent/join_token/abc");
    let not_after = Utc::now() + Duration::hours(1);

    assert!(store.fetch_attested_node(&node_id).await?.is_none());
    let missing = AttestedNode::new(node_id.clone(), "join_token", "1", not_after);
    let err = store
        .update_attested_node(missing.clone(), AttestedNodeMask::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(store.delete_attested_node(&node_id).await.unwrap_err().is_not_found());

    store.create_attested_node(missing.clone()).await?;
    assert!(store.create_attested_node(missing).await.unwrap_err().is_already_exists());
    store.set_node_selectors(&node_id, vec![Selector::new("tag", "blue")]).await?;

    let response = store
        .list_attested_nodes(ListAttestedNodesRequest {
            filter: AttestedNodeFilter {
                by_attestation_type: Some("join_token".into()),
                ..Default::default()
            },
            fetch_selectors: true,
            ..Default::default()
        })
        .await?;
    assert_eq!(response.nodes.len(), 1);
    assert_eq!(response.nodes[0].selectors, vec![Selector::new("tag", "blue")]);

    store.delete_attested_node(&node_id).await?;
    let ops: Vec<EventOp> = store
        .list_attested_node_events(ListEventsRequest::since(0))
        .await?
        .events
        .into_iter()
        .map(|e| e.op)
        .collect();
    assert_eq!(ops.first(), Some(&EventOp::Created));
    assert_eq!(ops.last(), Some(&EventOp::Deleted));
    Ok(())
}

#[tokio::test]
async fn join_tokens_and_bundles_reject_duplicates() -> Result<()> {
    let store = MemoryDataStore::new();
    let now = Utc::now();
    store.create_join_token(JoinToken::new("fresh", now + Duration::hours(1))).await?;
    store.create_join_token(JoinToken::new("stale", now - Duration::hours(1))).await?;
    let duplicate = JoinToken::new("fresh", now + Duration::hours(2));
    assert!(store.create_join_token(duplicate).await.unwrap_err().is_already_exists());

    assert_eq!(store.prune_join_tokens(now).await?, 1);
    assert!(store.fetch_join_token("fresh").await?.is_some());
    assert!(store.fetch_join_token("stale").await?.is_none());

    let td = TrustDomain::new("example.org")?;
    store.create_bundle(Bundle::new(td.clone())).await?;
    let err = store.create_bundle(Bundle::new(td.clone())).await.unwrap_err();
    assert!(err.is_already_exists());
    assert_eq!(store.count_bundles().await?, 1);
    Ok(())
}
