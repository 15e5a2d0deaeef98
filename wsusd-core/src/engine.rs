//! Update-graph engine
//!
//! Owns the attached metadata source and every map derived from it: the
//! prerequisite graph, the current-revision index per GUID, per-update
//! summaries, and the driver matcher. One reader-writer lock gates the lot;
//! sync requests hold the read side for their full duration, attach/detach/
//! reindex swap a fully built replacement under the write side so readers
//! never observe a half-built graph.

use crate::drivers::DriverMatcher;
use crate::graph::PrerequisiteGraph;
use crate::identity::{RevisionIndex, UpdateIdentity};
use crate::package::PackageKind;
use crate::store::{Error, MetadataStore, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use uuid::Uuid;

/// Cancellation signal for bulk operations, checked at package boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What the sync layer needs to know about one current-revision update
/// without going back to the store.
#[derive(Debug, Clone)]
pub struct UpdateSummary {
    pub identity: UpdateIdentity,
    pub index: RevisionIndex,
    pub kind: PackageKind,
    /// Contains other updates as payload.
    pub is_bundle: bool,
    /// Contained inside at least one bundle.
    pub is_bundled: bool,
}

/// A metadata source with all derived maps built.
pub struct AttachedSource {
    pub store: Arc<dyn MetadataStore>,
    pub graph: PrerequisiteGraph,
    /// GUID → index of its highest revision.
    pub id_to_revision_index: HashMap<Uuid, RevisionIndex>,
    /// GUID → full identity of its highest revision.
    pub id_to_full_identity: HashMap<Uuid, UpdateIdentity>,
    pub summaries: HashMap<Uuid, UpdateSummary>,
    pub driver_matcher: DriverMatcher,
}

impl AttachedSource {
    /// Enumerate the store and build every derived map.
    pub async fn build(store: Arc<dyn MetadataStore>) -> Result<Self> {
        // Latest-revision selection: one linear pass into a per-GUID bucket,
        // never trusting the store's iteration order.
        let mut current: HashMap<Uuid, (UpdateIdentity, RevisionIndex)> = HashMap::new();
        for (identity, index) in store.identities().await? {
            match current.entry(identity.guid) {
                std::collections::hash_map::Entry::Occupied(mut e) => {
                    if identity.revision > e.get().0.revision {
                        e.insert((identity, index));
                    }
                }
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert((identity, index));
                }
            }
        }

        let mut packages = Vec::with_capacity(current.len());
        for (identity, _) in current.values() {
            packages.push(store.package(identity).await?);
        }

        let graph = PrerequisiteGraph::build(&packages);
        let driver_matcher = DriverMatcher::build(&packages);

        let mut id_to_revision_index = HashMap::with_capacity(current.len());
        let mut id_to_full_identity = HashMap::with_capacity(current.len());
        for (guid, (identity, index)) in &current {
            id_to_revision_index.insert(*guid, *index);
            id_to_full_identity.insert(*guid, *identity);
        }

        let summaries = packages
            .iter()
            .map(|pkg| {
                let guid = pkg.identity.guid;
                (
                    guid,
                    UpdateSummary {
                        identity: pkg.identity,
                        index: current[&guid].1,
                        kind: pkg.kind,
                        is_bundle: pkg.is_bundle(),
                        is_bundled: pkg.is_bundled(),
                    },
                )
            })
            .collect();

        tracing::info!(
            updates = current.len(),
            roots = graph.roots().len(),
            non_leafs = graph.non_leafs().len(),
            leaves = graph.leaves().len(),
            "metadata source indexed"
        );

        Ok(Self {
            store,
            graph,
            id_to_revision_index,
            id_to_full_identity,
            summaries,
            driver_matcher,
        })
    }

    /// Translate a wire index into the GUID of a known update. Superseded
    /// revisions still translate; the graph decides what their GUID means.
    pub async fn guid_for_index(&self, index: u32) -> Result<Uuid> {
        let identity = self
            .store
            .package_identity(RevisionIndex(index))
            .await?
            .ok_or(Error::InvalidRevisionIndex(index))?;
        Ok(identity.guid)
    }
}

/// Process-wide engine: at most one attached source, swapped atomically.
pub struct UpdateEngine {
    source: RwLock<Option<AttachedSource>>,
}

impl UpdateEngine {
    pub fn new() -> Self {
        Self {
            source: RwLock::new(None),
        }
    }

    /// Attach a store, replacing any current source. The derived maps are
    /// built before the write lock is taken so readers are blocked only for
    /// the swap itself.
    pub async fn attach(&self, store: Arc<dyn MetadataStore>) -> Result<()> {
        let built = AttachedSource::build(store).await?;
        *self.source.write().await = Some(built);
        Ok(())
    }

    pub async fn detach(&self) {
        *self.source.write().await = None;
    }

    /// Rebuild the derived maps from the attached store, e.g. after an
    /// ingestion batch landed new packages.
    pub async fn reindex(&self) -> Result<()> {
        let store = {
            let guard = self.source.read().await;
            guard
                .as_ref()
                .map(|s| Arc::clone(&s.store))
                .ok_or(Error::NoMetadataSource)?
        };
        let built = AttachedSource::build(store).await?;
        *self.source.write().await = Some(built);
        Ok(())
    }

    /// Read-locked view for the duration of a request.
    pub async fn source(&self) -> RwLockReadGuard<'_, Option<AttachedSource>> {
        self.source.read().await
    }

    /// Copy every package of the attached store into another store,
    /// checking the cancellation flag between packages.
    pub async fn copy_to(&self, dst: &dyn MetadataStore, cancel: &CancelFlag) -> Result<u32> {
        let guard = self.source.read().await;
        let source = guard.as_ref().ok_or(Error::NoMetadataSource)?;

        let mut copied = 0u32;
        for (identity, _) in source.store.identities().await? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let pkg = source.store.package(&identity).await?;
            dst.add_package(&pkg).await?;
            copied += 1;
        }
        dst.flush().await?;
        tracing::info!(copied, "bulk metadata copy finished");
        Ok(copied)
    }
}

impl Default for UpdateEngine {
    fn default() -> Self {
        Self::new()
    }
}
