use std::collections::BTreeMap;

use serde::Serialize;

use crate::frame::{Frame, FrameKey, StackPath};

/// Index of a node inside its [`CallTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A (method, file) pair reached through one specific chain of callers.
#[derive(Debug, Clone, Serialize)]
pub struct CallTreeNode {
    key: FrameKey,
    parent: Option<NodeId>,
    total_count: u64,
    self_count: u64,
    /// Samples allocated directly in this frame, by allocation line.
    line_counts: BTreeMap<u32, u64>,
    /// Samples that passed through this frame, by call-site line.
    caller_line_counts: BTreeMap<u32, u64>,
    children: Vec<NodeId>,
}

impl CallTreeNode {
    fn new(key: FrameKey, parent: Option<NodeId>) -> Self {
        CallTreeNode {
            key,
            parent,
            total_count: 0,
            self_count: 0,
            line_counts: BTreeMap::new(),
            caller_line_counts: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn key(&self) -> &FrameKey {
        &self.key
    }

    pub fn file(&self) -> &str {
        &self.key.file
    }

    pub fn qualified_name(&self) -> String {
        self.key.qualified_name()
    }

    /// The caller's node; `None` for a root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn self_count(&self) -> u64 {
        self.self_count
    }

    pub fn line_counts(&self) -> &BTreeMap<u32, u64> {
        &self.line_counts
    }

    pub fn caller_line_counts(&self) -> &BTreeMap<u32, u64> {
        &self.caller_line_counts
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    fn matches(&self, frame: &Frame) -> bool {
        frame.matches(&self.key)
    }
}

/// Trie of call stacks stored as an arena.
///
/// Children hold indices of their nodes and every node holds the index of its
/// caller, so no node owns another.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallTree {
    nodes: Vec<CallTreeNode>,
    roots: Vec<NodeId>,
}

impl CallTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files one sample. Every node on the path gains one total; the
    /// innermost node also gains one self sample on the allocation line.
    ///
    /// Returns the innermost node, or `None` for an empty path.
    pub fn insert(&mut self, path: &StackPath) -> Option<NodeId> {
        let last = path.len().checked_sub(1)?;
        let mut parent = None;

        for (depth, frame) in path.iter().enumerate() {
            let id = self.find_or_insert(parent, frame);
            let node = &mut self.nodes[id.0];
            node.total_count += 1;
            if depth == last {
                node.self_count += 1;
                *node.line_counts.entry(frame.line).or_insert(0) += 1;
            } else {
                *node.caller_line_counts.entry(frame.line).or_insert(0) += 1;
            }
            parent = Some(id);
        }

        parent
    }

    fn find_or_insert(&mut self, parent: Option<NodeId>, frame: &Frame) -> NodeId {
        let siblings = match parent {
            Some(parent) => &self.nodes[parent.0].children,
            None => &self.roots,
        };
        if let Some(found) = siblings.iter().find(|id| self.nodes[id.0].matches(frame)) {
            return *found;
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(CallTreeNode::new(frame.key(), parent));
        match parent {
            Some(parent) => self.nodes[parent.0].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    /// Outermost frames of every distinct entry point, in creation order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> Option<&CallTreeNode> {
        self.nodes.get(id.0)
    }

    /// All nodes with their ids, in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &CallTreeNode)> {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeId(i), node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids from the root down to `id`, inclusive.
    pub fn path_to(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = self.node(id).map(|_| id);
        while let Some(id) = current {
            path.push(id);
            current = self.nodes[id.0].parent;
        }
        path.reverse();
        path
    }

    /// Checks `total == self + sum(child totals)` for every node.
    pub fn counts_are_consistent(&self) -> bool {
        self.nodes.iter().all(|node| {
            let children: u64 = node
                .children
                .iter()
                .map(|child| self.nodes[child.0].total_count)
                .sum();
            node.total_count == node.self_count + children
        })
    }
}
