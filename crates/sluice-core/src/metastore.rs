//! Per-(processor, source) latest-seen source-metadata store.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::error::BoxError;
use crate::message::Metadata;
use crate::topology::NodeId;

/// Records the greatest source-metadata token seen per (processor, source).
///
/// Writers are pump pipes (one mark per message); the reader is the
/// supervisor, which drains the store during a commit pass.
pub trait Metastore: Send + Sync {
    /// Records `token` as the latest seen for (`owner`, `source`), folding
    /// it over any previously marked token via [`Metadata::merge`].
    ///
    /// # Errors
    ///
    /// Implementation-defined; errors abort the marking pipe operation.
    fn mark(&self, owner: NodeId, source: NodeId, token: Arc<dyn Metadata>)
        -> Result<(), BoxError>;

    /// Returns the token currently marked for (`owner`, `source`).
    fn get(&self, owner: NodeId, source: NodeId) -> Option<Arc<dyn Metadata>>;

    /// Drains all marks, folding them per source across owners. The result
    /// is sorted by source id for deterministic commit order.
    fn take_merged(&self) -> Vec<(NodeId, Arc<dyn Metadata>)>;
}

/// Lock-guarded in-memory metastore.
#[derive(Default)]
pub struct InMemoryMetastore {
    marks: Mutex<FxHashMap<(NodeId, NodeId), Arc<dyn Metadata>>>,
}

impl InMemoryMetastore {
    /// Creates an empty metastore.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metastore for InMemoryMetastore {
    fn mark(
        &self,
        owner: NodeId,
        source: NodeId,
        token: Arc<dyn Metadata>,
    ) -> Result<(), BoxError> {
        let mut marks = self.marks.lock();
        match marks.entry((owner, source)) {
            Entry::Occupied(mut entry) => {
                let merged = token.merge(entry.get());
                entry.insert(merged);
            }
            Entry::Vacant(entry) => {
                entry.insert(token);
            }
        }
        Ok(())
    }

    fn get(&self, owner: NodeId, source: NodeId) -> Option<Arc<dyn Metadata>> {
        self.marks.lock().get(&(owner, source)).cloned()
    }

    fn take_merged(&self) -> Vec<(NodeId, Arc<dyn Metadata>)> {
        let drained = std::mem::take(&mut *self.marks.lock());

        let mut per_source: FxHashMap<NodeId, Arc<dyn Metadata>> = FxHashMap::default();
        for ((_owner, source), token) in drained {
            match per_source.entry(source) {
                Entry::Occupied(mut entry) => {
                    let merged = token.merge(entry.get());
                    entry.insert(merged);
                }
                Entry::Vacant(entry) => {
                    entry.insert(token);
                }
            }
        }

        let mut merged: Vec<(NodeId, Arc<dyn Metadata>)> = per_source.into_iter().collect();
        merged.sort_unstable_by_key(|(source, _)| *source);
        merged
    }
}

impl std::fmt::Debug for InMemoryMetastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMetastore")
            .field("marked", &self.marks.lock().len())
            .finish()
    }
}
