use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use super::node::{GraphNode, NodeIndex, NodeKey, Processable};
use crate::error::GraphError;

/// Mutable node set used while compiling. Turned into an immutable
/// [`Generation`] by [`GraphBuilder::finish`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<GraphNode>,
    lookup: HashMap<NodeKey, NodeIndex>,
    tempo: Vec<NodeIndex>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node for `key`, or returns the existing one.
    pub fn add_node(&mut self, key: NodeKey, payload: Arc<dyn Processable>) -> NodeIndex {
        if let Some(&index) = self.lookup.get(&key) {
            return index;
        }
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(GraphNode::new(index, key, payload));
        self.lookup.insert(key, index);
        index
    }

    pub fn find(&self, key: NodeKey) -> Option<NodeIndex> {
        self.lookup.get(&key).copied()
    }

    pub fn node(&self, index: NodeIndex) -> &GraphNode {
        &self.nodes[index.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds the edge `parent -> child`. Returns `Ok(false)` if it already exists.
    pub fn connect(&mut self, parent: NodeIndex, child: NodeIndex) -> Result<bool, GraphError> {
        if parent == child {
            return Err(GraphError::SelfLoop(self.nodes[parent.0].key));
        }
        if self.nodes[parent.0].children.contains(&child) {
            return Ok(false);
        }
        self.nodes[parent.0].children.push(child);
        self.nodes[child.0].init_refcount += 1;
        Ok(true)
    }

    /// Records a node the router processes ahead of the bulk pass.
    pub fn mark_tempo(&mut self, index: NodeIndex) {
        if !self.tempo.contains(&index) {
            self.tempo.push(index);
        }
    }

    pub fn finish(mut self) -> Generation {
        let mut initial = Vec::new();
        let mut terminal = Vec::new();
        for node in &mut self.nodes {
            node.initial = node.init_refcount == 0;
            node.terminal = node.children.is_empty();
            node.refcount.store(node.init_refcount, Ordering::Relaxed);
            if node.initial {
                initial.push(node.index);
            }
            if node.terminal {
                terminal.push(node.index);
            }
        }
        let capacity = self.nodes.len().max(1);
        Generation {
            nodes: self.nodes,
            lookup: self.lookup,
            initial,
            terminal,
            tempo: self.tempo,
            trigger_queue: ArrayQueue::new(capacity),
        }
    }
}

/// One compiled, immutable node set. Workers only ever see a whole
/// generation; rebuilding produces a new one.
pub struct Generation {
    nodes: Vec<GraphNode>,
    lookup: HashMap<NodeKey, NodeIndex>,
    initial: Vec<NodeIndex>,
    terminal: Vec<NodeIndex>,
    tempo: Vec<NodeIndex>,
    pub(crate) trigger_queue: ArrayQueue<NodeIndex>,
}

impl Generation {
    pub fn empty() -> Self {
        GraphBuilder::new().finish()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> &GraphNode {
        &self.nodes[index.0]
    }

    pub fn find(&self, key: NodeKey) -> Option<&GraphNode> {
        self.lookup.get(&key).map(|index| &self.nodes[index.0])
    }

    pub fn initial(&self) -> &[NodeIndex] {
        &self.initial
    }

    pub fn terminal(&self) -> &[NodeIndex] {
        &self.terminal
    }

    /// Tempo port nodes processed by the router before the rest of the graph.
    pub fn tempo_nodes(&self) -> &[NodeIndex] {
        &self.tempo
    }

    pub fn is_tempo_node(&self, index: NodeIndex) -> bool {
        self.tempo.contains(&index)
    }

    /// Peels the graph from its initial nodes using copies of the counters.
    /// Any node left with unvisited edges sits on a cycle.
    pub fn is_valid(&self) -> bool {
        self.peel().is_some()
    }

    /// Nodes ordered so every parent precedes its children, or `None` when
    /// the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<NodeIndex>> {
        self.peel()
    }

    fn peel(&self) -> Option<Vec<NodeIndex>> {
        if self.initial.is_empty() && !self.nodes.is_empty() {
            return None;
        }
        let mut refcounts: Vec<usize> = self.nodes.iter().map(|node| node.init_refcount).collect();
        let mut remaining: Vec<usize> = self.nodes.iter().map(|node| node.children.len()).collect();
        let mut queue: VecDeque<NodeIndex> = self.initial.iter().copied().collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &child in &self.nodes[index.0].children {
                remaining[index.0] -= 1;
                refcounts[child.0] -= 1;
                if refcounts[child.0] == 0 {
                    queue.push_back(child);
                }
            }
        }

        let peeled = remaining.iter().all(|&n| n == 0) && refcounts.iter().all(|&n| n == 0);
        peeled.then_some(order)
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("nodes", &self.nodes.len())
            .field("initial", &self.initial.len())
            .field("terminal", &self.terminal.len())
            .finish()
    }
}
