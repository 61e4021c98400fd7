use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::{
    frame::StackPath,
    tree::{CallTree, CallTreeNode},
};

/// All call stacks that allocated instances of one type.
#[derive(Debug, Clone, Serialize)]
pub struct TypeAggregation {
    type_name: String,
    tree: CallTree,
    /// Store-wide sequence number of the first sample per (file, line).
    #[serde(skip_serializing)]
    first_seen: HashMap<String, HashMap<u32, u64>>,
}

impl TypeAggregation {
    fn new(type_name: &str) -> Self {
        TypeAggregation {
            type_name: type_name.to_string(),
            tree: CallTree::new(),
            first_seen: HashMap::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    /// Root nodes: the outermost frame of each distinct entry point.
    pub fn roots(&self) -> impl Iterator<Item = &CallTreeNode> {
        self.tree
            .roots()
            .iter()
            .filter_map(|root| self.tree.node(*root))
    }

    pub fn sample_count(&self) -> u64 {
        self.roots().map(CallTreeNode::total_count).sum()
    }

    pub(crate) fn first_seen(&self, file: &str, line: u32) -> Option<u64> {
        self.first_seen.get(file)?.get(&line).copied()
    }

    fn mark_seen(&mut self, file: &str, line: u32, sequence: u64) {
        match self.first_seen.get_mut(file) {
            Some(lines) => {
                lines.entry(line).or_insert(sequence);
            }
            None => {
                self.first_seen
                    .insert(file.to_string(), HashMap::from([(line, sequence)]));
            }
        }
    }
}

/// Aggregated samples of one enable/disable cycle, keyed by type name.
///
/// Types never share nodes, even when they are allocated at the same site.
#[derive(Debug, Default)]
pub struct AggregationStore {
    types: HashMap<String, TypeAggregation>,
    samples: u64,
    dropped: u64,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files one sampled allocation of `type_name` under its call stack.
    ///
    /// A sample without frames cannot be placed in a tree; it is counted as
    /// dropped and `false` is returned.
    pub fn record(&mut self, type_name: &str, path: &StackPath) -> bool {
        let Some(site) = path.innermost() else {
            self.dropped += 1;
            return false;
        };

        if !self.types.contains_key(type_name) {
            self.types
                .insert(type_name.to_string(), TypeAggregation::new(type_name));
        }
        let Some(aggregation) = self.types.get_mut(type_name) else {
            return false;
        };

        aggregation.tree.insert(path);
        aggregation.mark_seen(&site.file, site.line, self.samples);
        self.samples += 1;
        true
    }

    pub fn reset(&mut self) {
        self.types.clear();
        self.samples = 0;
        self.dropped = 0;
    }

    pub fn get(&self, type_name: &str) -> Option<&TypeAggregation> {
        self.types.get(type_name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeAggregation> {
        self.types.values()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Samples filed into a tree.
    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// Sampled events that carried no frames.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped
    }

    /// Every type with the ids of its root nodes, sorted by type name.
    pub fn raw_result(&self) -> BTreeMap<String, TypeAggregation> {
        self.types
            .iter()
            .map(|(name, aggregation)| (name.clone(), aggregation.clone()))
            .collect()
    }
}
