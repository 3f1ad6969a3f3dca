//! Keeps the agent's entry cache in step with the server.
//!
//! A pass is either full (list every authorized entry) or incremental
//! (replay entry and node events after the stored cursor and re-resolve the
//! changed entries). Nothing is published until the pass completes: the new
//! snapshot and the new cursor are swapped in together, so a failed or
//! canceled pass leaves both exactly as they were.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use trustplane::domain::{Bundle, EntryId, RegistrationEntry, SpiffeId, TrustDomain};

use crate::cache::{CacheSnapshot, EntryCache};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::source::EntrySource;
use crate::svid_cache::{Svid, SvidCache};

/// Highest event IDs already applied to the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub entry_event_id: u64,
    pub node_event_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Full,
    Incremental,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// Result of one completed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub kind: SyncKind,
    /// Entries in the cache after the pass
    pub entries: usize,
    /// Entry IDs re-resolved by an incremental pass; every entry for a full one
    pub changed: usize,
    /// Cached X.509 credentials dropped because their entry went away
    pub dropped_svids: usize,
    pub cursor: SyncCursor,
}

struct Pass {
    kind: SyncKind,
    snapshot: CacheSnapshot,
    cursor: SyncCursor,
    changed: usize,
}

pub struct Synchronizer {
    agent_id: SpiffeId,
    trust_domain: TrustDomain,
    use_event_sync: bool,
    source: Arc<dyn EntrySource>,
    cache: Arc<EntryCache>,
    x509_svids: Arc<SvidCache<Svid>>,
    jwt_svids: Arc<SvidCache<Svid>>,
    trust_bundle: RwLock<Option<Bundle>>,
    // held for the whole pass, which also serializes passes
    cursor: Mutex<Option<SyncCursor>>,
}

impl Synchronizer {
    pub fn new(config: &AgentConfig, source: Arc<dyn EntrySource>) -> Self {
        Self {
            agent_id: config.agent_id.clone(),
            trust_domain: config.trust_domain.clone(),
            use_event_sync: config.use_event_sync,
            source,
            cache: Arc::new(EntryCache::new()),
            x509_svids: Arc::new(SvidCache::new("x509", config.x509_svid_cache_max_size)),
            jwt_svids: Arc::new(SvidCache::new("jwt", config.jwt_svid_cache_max_size)),
            trust_bundle: RwLock::new(None),
            cursor: Mutex::new(None),
        }
    }

    /// Trust `bundle` for verifying the server from now on
    pub fn with_trust_bundle(self, bundle: Bundle) -> Self {
        Self { trust_bundle: RwLock::new(Some(bundle)), ..self }
    }

    pub fn agent_id(&self) -> &SpiffeId {
        &self.agent_id
    }

    pub fn cache(&self) -> Arc<EntryCache> {
        self.cache.clone()
    }

    pub fn x509_svids(&self) -> Arc<SvidCache<Svid>> {
        self.x509_svids.clone()
    }

    pub fn jwt_svids(&self) -> Arc<SvidCache<Svid>> {
        self.jwt_svids.clone()
    }

    pub fn trust_bundle(&self) -> Result<Option<Bundle>> {
        Ok(self.trust_bundle.read()?.clone())
    }

    pub fn set_trust_bundle(&self, bundle: Bundle) -> Result<()> {
        *self.trust_bundle.write()? = Some(bundle);
        Ok(())
    }

    pub async fn cursor(&self) -> Option<SyncCursor> {
        *self.cursor.lock().await
    }

    /// Run one pass: incremental when a cursor is stored and event sync is
    /// enabled, full otherwise
    pub async fn sync_once(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        self.run_pass(cancel, false).await
    }

    /// Run a full pass regardless of the stored cursor
    pub async fn force_full_sync(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        self.run_pass(cancel, true).await
    }

    #[instrument(skip(self, cancel), fields(agent_id = %self.agent_id))]
    async fn run_pass(&self, cancel: &CancellationToken, force_full: bool) -> Result<SyncReport> {
        let started = Instant::now();
        let mut stored = self.cursor.lock().await;

        let result = self.build_pass(cancel, force_full, *stored).await;
        let (pass, bundle) = match result {
            Ok(built) => built,
            Err(e) => {
                metrics::counter!("agent_sync_total", "kind" => "none", "status" => e.code())
                    .increment(1);
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            let kind = pass.kind.as_str();
            metrics::counter!("agent_sync_total", "kind" => kind, "status" => "canceled")
                .increment(1);
            return Err(AgentError::canceled("swap entry cache"));
        }

        // commit: nothing below awaits
        if let Some(bundle) = bundle {
            *self.trust_bundle.write()? = Some(bundle);
        }
        self.cache.replace(pass.snapshot)?;
        let snapshot = self.cache.snapshot()?;
        *stored = Some(pass.cursor);
        let dropped_svids = self.x509_svids.retain_ids(|id| snapshot.contains(id))?;

        let report = SyncReport {
            kind: pass.kind,
            entries: snapshot.len(),
            changed: pass.changed,
            dropped_svids,
            cursor: pass.cursor,
        };
        self.record(&report, started);
        debug!(?report, "Sync pass complete");
        Ok(report)
    }

    async fn build_pass(
        &self,
        cancel: &CancellationToken,
        force_full: bool,
        cursor: Option<SyncCursor>,
    ) -> Result<(Pass, Option<Bundle>)> {
        self.verify_server(cancel).await?;
        let pass = match cursor {
            Some(cursor) if self.use_event_sync && !force_full => {
                self.incremental(cancel, cursor).await?
            }
            _ => self.full(cancel).await?,
        };
        let bundle =
            guarded(cancel, "fetch bundle", self.source.bundle(&self.trust_domain)).await?;
        Ok((pass, bundle))
    }

    /// Fails with [`AgentError::UntrustedServer`] unless the server's
    /// identity chains to the trusted bundle
    async fn verify_server(&self, cancel: &CancellationToken) -> Result<()> {
        let identity = guarded(cancel, "server identity", self.source.server_identity()).await?;
        let trusted = self.trust_bundle.read()?.clone();
        match trusted {
            Some(bundle) if identity.is_trusted_by(&self.trust_domain, &bundle) => Ok(()),
            Some(_) => {
                warn!(
                    server_id = %identity.spiffe_id,
                    authority_id = %identity.authority_id,
                    "Server presented an untrusted identity"
                );
                Err(AgentError::UntrustedServer {
                    server_id: identity.spiffe_id,
                    authority_id: identity.authority_id,
                })
            }
            None => {
                warn!(server_id = %identity.spiffe_id, "No trust bundle yet, accepting server");
                Ok(())
            }
        }
    }

    async fn full(&self, cancel: &CancellationToken) -> Result<Pass> {
        // read the counters first so a write racing the listing is replayed
        let latest = guarded(cancel, "latest event ids", self.source.latest_event_ids()).await?;
        let entries = guarded(
            cancel,
            "list authorized entries",
            self.source.authorized_entries(&self.agent_id),
        )
        .await?;
        let snapshot = CacheSnapshot::from_entries(entries);
        info!(entries = snapshot.len(), "Full sync");
        Ok(Pass {
            kind: SyncKind::Full,
            changed: snapshot.len(),
            snapshot,
            cursor: SyncCursor {
                entry_event_id: latest.entry_event_id,
                node_event_id: latest.node_event_id,
            },
        })
    }

    async fn incremental(&self, cancel: &CancellationToken, cursor: SyncCursor) -> Result<Pass> {
        let entry_events = guarded(
            cancel,
            "list entry events",
            self.source.entry_events_since(cursor.entry_event_id),
        )
        .await?;
        let node_events = guarded(
            cancel,
            "list node events",
            self.source.node_events_since(cursor.node_event_id),
        )
        .await?;

        if entry_events.too_old || node_events.too_old {
            info!(
                entry_cursor = cursor.entry_event_id,
                node_cursor = cursor.node_event_id,
                "Event cursor predates retained events, falling back to full sync"
            );
            return self.full(cancel).await;
        }
        if node_events.events.iter().any(|event| event.spiffe_id == self.agent_id) {
            debug!("Agent node changed, running full sync");
            return self.full(cancel).await;
        }

        let next = SyncCursor {
            entry_event_id: entry_events
                .events
                .iter()
                .map(|e| e.event_id)
                .fold(cursor.entry_event_id, u64::max),
            node_event_id: node_events
                .events
                .iter()
                .map(|e| e.event_id)
                .fold(cursor.node_event_id, u64::max),
        };

        let current = self.cache.snapshot()?;
        let changed: BTreeSet<EntryId> =
            entry_events.events.iter().map(|event| event.entry_id.clone()).collect();
        if changed.is_empty() {
            return Ok(Pass {
                kind: SyncKind::Incremental,
                snapshot: (*current).clone(),
                cursor: next,
                changed: 0,
            });
        }

        let mut affected = changed.clone();
        for id in &changed {
            if let Some(entry) = current.get(id) {
                affected.extend(current.descendants_of(&entry.spiffe_id));
            }
        }
        let ids: Vec<EntryId> = affected.iter().cloned().collect();
        let refreshed = guarded(
            cancel,
            "fetch changed entries",
            self.source.authorized_entries_for_ids(&self.agent_id, &ids),
        )
        .await?;

        let mut entries: BTreeMap<EntryId, RegistrationEntry> = current
            .entries()
            .filter(|entry| !affected.contains(&entry.id))
            .map(|entry| (entry.id.clone(), entry.clone()))
            .collect();
        for entry in refreshed {
            entries.insert(entry.id.clone(), entry);
        }
        debug!(
            events = entry_events.events.len(),
            affected = affected.len(),
            "Applied entry events"
        );

        Ok(Pass {
            kind: SyncKind::Incremental,
            snapshot: CacheSnapshot::from_entries(entries.into_values()),
            cursor: next,
            changed: affected.len(),
        })
    }

    fn record(&self, report: &SyncReport, started: Instant) {
        let kind = report.kind.as_str();
        metrics::counter!("agent_sync_total", "kind" => kind, "status" => "ok").increment(1);
        metrics::histogram!("agent_sync_duration_seconds", "kind" => kind)
            .record(started.elapsed().as_secs_f64());
        metrics::gauge!("agent_cached_entries").set(report.entries as f64);
        if let Ok(len) = self.x509_svids.len() {
            metrics::gauge!("agent_svid_cache_entries", "cache" => "x509").set(len as f64);
        }
        if let Ok(len) = self.jwt_svids.len() {
            metrics::gauge!("agent_svid_cache_entries", "cache" => "jwt").set(len as f64);
        }
    }
}

/// Await `call` unless `cancel` fires first
async fn guarded<T, F>(cancel: &CancellationToken, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = trustplane::Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(AgentError::canceled(operation));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::canceled(operation)),
        result = call => result.map_err(AgentError::from),
    }
}
