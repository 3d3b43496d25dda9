//! Immutable DAG of processor nodes.
//!
//! A [`Topology`] is built once, validated, and then consumed by a task,
//! which materializes one pump per node and one buffer per async edge.
//! Validation covers duplicate names, unknown nodes, edges into sources,
//! self-loops, and cycles (Kahn's algorithm with deterministic ordering).

use std::fmt;

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::processor::{Processor, Source};

/// Unique identifier for a node in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Execution mode of a processor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// The node runs on its own execution unit behind a message buffer.
    #[default]
    Async,
    /// The node runs inline on the calling pump's execution unit.
    Sync,
}

/// What a node does: produce messages, or process them.
pub(crate) enum NodeKind {
    /// Entry point; drives a [`Source`] implementation.
    Source(Box<dyn Source>),
    /// Interior or terminal node; drives a [`Processor`] implementation.
    Processor(Box<dyn Processor>),
}

/// A node in the topology.
pub struct TopologyNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) mode: Mode,
    pub(crate) kind: NodeKind,
    /// Downstream nodes, in forward order.
    pub(crate) children: SmallVec<[NodeId; 4]>,
    /// Number of upstream edges (drives buffer writer mode).
    pub(crate) parent_count: usize,
}

impl TopologyNode {
    /// Returns the node id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the node's execution mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns the node's children in forward order.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

impl fmt::Debug for TopologyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("children", &self.children)
            .field("parent_count", &self.parent_count)
            .finish_non_exhaustive()
    }
}

/// The complete processor graph. Immutable once finalized; a task finalizes
/// it on construction if the application has not already done so.
pub struct Topology {
    nodes: FxHashMap<NodeId, TopologyNode>,
    name_index: FxHashMap<String, NodeId>,
    /// Topologically sorted execution order (upstream first).
    execution_order: Vec<NodeId>,
    /// Source nodes, sorted by id.
    source_nodes: Vec<NodeId>,
    next_node_id: u32,
    finalized: bool,
}

impl Topology {
    /// Creates an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            name_index: FxHashMap::default(),
            execution_order: Vec::new(),
            source_nodes: Vec::new(),
            next_node_id: 0,
            finalized: false,
        }
    }

    /// Adds a source node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateNode`] if the name is already taken.
    pub fn add_source(&mut self, name: &str, source: Box<dyn Source>) -> Result<NodeId> {
        self.add_node(name, Mode::Async, NodeKind::Source(source))
    }

    /// Adds an asynchronous processor node (its own execution unit).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateNode`] if the name is already taken.
    pub fn add_processor(&mut self, name: &str, processor: Box<dyn Processor>) -> Result<NodeId> {
        self.add_node(name, Mode::Async, NodeKind::Processor(processor))
    }

    /// Adds a synchronous (inline) processor node, invoked on the parent
    /// pump's execution unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateNode`] if the name is already taken.
    pub fn add_sync_processor(
        &mut self,
        name: &str,
        processor: Box<dyn Processor>,
    ) -> Result<NodeId> {
        self.add_node(name, Mode::Sync, NodeKind::Processor(processor))
    }

    fn add_node(&mut self, name: &str, mode: Mode, kind: NodeKind) -> Result<NodeId> {
        if self.name_index.contains_key(name) {
            return Err(Error::DuplicateNode(name.to_string()));
        }

        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;

        self.nodes.insert(
            id,
            TopologyNode {
                id,
                name: name.to_string(),
                mode,
                kind,
                children: SmallVec::new(),
                parent_count: 0,
            },
        );
        self.name_index.insert(name.to_string(), id);
        self.finalized = false;

        Ok(id)
    }

    /// Adds an edge from `parent` to `child`. Child order is forward order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] if either node does not exist,
    /// [`Error::CycleDetected`] for a self-loop, and
    /// [`Error::SourceHasParent`] if `child` is a source node.
    pub fn connect(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if parent == child {
            let name = self.node_name(parent).unwrap_or_default().to_string();
            return Err(Error::CycleDetected(name));
        }
        if !self.nodes.contains_key(&parent) {
            return Err(Error::NodeNotFound(format!("{parent}")));
        }
        let Some(child_node) = self.nodes.get_mut(&child) else {
            return Err(Error::NodeNotFound(format!("{child}")));
        };
        if matches!(child_node.kind, NodeKind::Source(_)) {
            return Err(Error::SourceHasParent(child_node.name.clone()));
        }
        child_node.parent_count += 1;

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(child);
        }
        self.finalized = false;

        Ok(())
    }

    /// Finalizes the topology: validates it and computes the execution order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTopology`] if there are no nodes and
    /// [`Error::CycleDetected`] if the graph contains a cycle.
    pub fn finalize(&mut self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::EmptyTopology);
        }

        let order = self.kahn_topo_sort();
        if order.len() < self.nodes.len() {
            let ordered: FxHashSet<NodeId> = order.iter().copied().collect();
            let stuck = self
                .nodes
                .values()
                .find(|n| !ordered.contains(&n.id))
                .map_or_else(|| "unknown".to_string(), |n| n.name.clone());
            return Err(Error::CycleDetected(stuck));
        }
        self.execution_order = order;

        self.source_nodes = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Source(_)))
            .map(|n| n.id)
            .collect();
        self.source_nodes.sort_unstable();

        self.finalized = true;
        Ok(())
    }

    /// Kahn's algorithm with deterministic (id-sorted) tie-breaking.
    fn kahn_topo_sort(&self) -> Vec<NodeId> {
        let mut in_degree: FxHashMap<NodeId, usize> =
            self.nodes.values().map(|n| (n.id, n.parent_count)).collect();

        let mut ready: Vec<NodeId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        ready.sort_unstable();

        let mut queue: std::collections::VecDeque<NodeId> = ready.into();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);

            if let Some(node) = self.nodes.get(&id) {
                let mut unlocked: Vec<NodeId> = Vec::new();
                for &child in &node.children {
                    if let Some(deg) = in_degree.get_mut(&child) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            unlocked.push(child);
                        }
                    }
                }
                unlocked.sort_unstable();
                queue.extend(unlocked);
            }
        }

        order
    }

    // ---- Accessors ----

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&TopologyNode> {
        self.nodes.get(&id)
    }

    /// Returns the id for a node name.
    #[must_use]
    pub fn node_id_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_index.get(name).copied()
    }

    /// Returns the name of a node.
    #[must_use]
    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|n| n.name.as_str())
    }

    /// Returns the source node ids, sorted. Empty before finalization.
    #[must_use]
    pub fn sources(&self) -> &[NodeId] {
        &self.source_nodes
    }

    /// Returns nodes in topological execution order (upstream first).
    /// Empty before finalization.
    #[must_use]
    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    /// Returns whether the topology has been finalized.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Decomposes a finalized topology for runtime wiring.
    pub(crate) fn into_parts(self) -> (FxHashMap<NodeId, TopologyNode>, Vec<NodeId>) {
        (self.nodes, self.execution_order)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("node_count", &self.nodes.len())
            .field("source_nodes", &self.source_nodes)
            .field("execution_order", &self.execution_order)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::message::Message;
    use crate::pipe::Pipe;

    struct NoopSource;

    impl Source for NoopSource {
        fn consume(&mut self) -> std::result::Result<Message, BoxError> {
            Ok(Message::new(None, None))
        }

        fn commit(
            &mut self,
            _token: Option<&std::sync::Arc<dyn crate::message::Metadata>>,
        ) -> std::result::Result<(), BoxError> {
            Ok(())
        }

        fn close(&mut self) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    struct NoopProcessor;

    impl Processor for NoopProcessor {
        fn with_pipe(&mut self, _pipe: Pipe) {}

        fn process(&mut self, _msg: Message) -> std::result::Result<(), BoxError> {
            Ok(())
        }

        fn close(&mut self) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    fn linear() -> (Topology, NodeId, NodeId, NodeId) {
        let mut topo = Topology::new();
        let src = topo.add_source("src", Box::new(NoopSource)).unwrap();
        let map = topo.add_processor("map", Box::new(NoopProcessor)).unwrap();
        let sink = topo.add_processor("sink", Box::new(NoopProcessor)).unwrap();
        topo.connect(src, map).unwrap();
        topo.connect(map, sink).unwrap();
        (topo, src, map, sink)
    }

    #[test]
    fn test_empty_topology() {
        let mut topo = Topology::new();
        assert_eq!(topo.node_count(), 0);
        assert!(matches!(topo.finalize(), Err(Error::EmptyTopology)));
    }

    #[test]
    fn test_linear_topology() {
        let (mut topo, src, map, sink) = linear();
        topo.finalize().unwrap();

        assert!(topo.is_finalized());
        assert_eq!(topo.node_count(), 3);
        assert_eq!(topo.sources(), &[src]);
        assert_eq!(topo.execution_order(), &[src, map, sink]);
        assert_eq!(topo.node(map).unwrap().children(), &[sink]);
        assert_eq!(topo.node(sink).unwrap().parent_count, 1);
    }

    #[test]
    fn test_duplicate_node() {
        let mut topo = Topology::new();
        topo.add_source("src", Box::new(NoopSource)).unwrap();
        let result = topo.add_processor("src", Box::new(NoopProcessor));
        assert!(matches!(result, Err(Error::DuplicateNode(_))));
    }

    #[test]
    fn test_connect_unknown_node() {
        let mut topo = Topology::new();
        let src = topo.add_source("src", Box::new(NoopSource)).unwrap();
        let result = topo.connect(src, NodeId(99));
        assert!(matches!(result, Err(Error::NodeNotFound(_))));
        let result = topo.connect(NodeId(99), src);
        assert!(matches!(result, Err(Error::NodeNotFound(_))));
    }

    #[test]
    fn test_self_loop() {
        let mut topo = Topology::new();
        let map = topo.add_processor("map", Box::new(NoopProcessor)).unwrap();
        assert!(matches!(
            topo.connect(map, map),
            Err(Error::CycleDetected(_))
        ));
    }

    #[test]
    fn test_edge_into_source() {
        let mut topo = Topology::new();
        let src = topo.add_source("src", Box::new(NoopSource)).unwrap();
        let map = topo.add_processor("map", Box::new(NoopProcessor)).unwrap();
        let result = topo.connect(map, src);
        assert!(matches!(result, Err(Error::SourceHasParent(name)) if name == "src"));
    }

    #[test]
    fn test_cycle_detection() {
        let mut topo = Topology::new();
        let a = topo.add_processor("a", Box::new(NoopProcessor)).unwrap();
        let b = topo.add_processor("b", Box::new(NoopProcessor)).unwrap();
        let c = topo.add_processor("c", Box::new(NoopProcessor)).unwrap();
        topo.connect(a, b).unwrap();
        topo.connect(b, c).unwrap();
        topo.connect(c, a).unwrap();

        assert!(matches!(topo.finalize(), Err(Error::CycleDetected(_))));
    }

    #[test]
    fn test_merge_topology() {
        let mut topo = Topology::new();
        let s1 = topo.add_source("s1", Box::new(NoopSource)).unwrap();
        let s2 = topo.add_source("s2", Box::new(NoopSource)).unwrap();
        let merge = topo.add_processor("merge", Box::new(NoopProcessor)).unwrap();
        topo.connect(s1, merge).unwrap();
        topo.connect(s2, merge).unwrap();
        topo.finalize().unwrap();

        assert_eq!(topo.sources(), &[s1, s2]);
        assert_eq!(topo.node(merge).unwrap().parent_count, 2);
        assert_eq!(topo.execution_order(), &[s1, s2, merge]);
    }

    #[test]
    fn test_fan_out_child_order() {
        let mut topo = Topology::new();
        let src = topo.add_source("src", Box::new(NoopSource)).unwrap();
        let b = topo.add_processor("b", Box::new(NoopProcessor)).unwrap();
        let a = topo.add_processor("a", Box::new(NoopProcessor)).unwrap();
        // Forward order follows connect order, not id order.
        topo.connect(src, b).unwrap();
        topo.connect(src, a).unwrap();
        topo.finalize().unwrap();

        assert_eq!(topo.node(src).unwrap().children(), &[b, a]);
    }

    #[test]
    fn test_deterministic_order() {
        for _ in 0..10 {
            let (mut topo, src, map, sink) = linear();
            topo.finalize().unwrap();
            assert_eq!(topo.execution_order(), &[src, map, sink]);
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let (mut topo, src, ..) = linear();
        topo.finalize().unwrap();
        assert_eq!(topo.node_id_by_name("src"), Some(src));
        assert_eq!(topo.node_name(src), Some("src"));
        assert!(topo.node_id_by_name("nope").is_none());
    }
}
