//! Flattened views over an [`AggregationStore`].

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
};

use serde::Serialize;

use crate::{
    store::{AggregationStore, TypeAggregation},
    tree::{CallTree, NodeId},
};

/// type name -> file -> line -> samples.
pub type LocationCounts = BTreeMap<String, BTreeMap<String, BTreeMap<u32, u64>>>;

/// One frame of a representative call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallStackFrame {
    /// `owner#method`
    pub name: String,
    pub file: String,
    /// Allocation line for the innermost frame, most frequent call-site line
    /// for callers.
    pub line: Option<u32>,
    pub total_count: u64,
    pub self_count: u64,
}

/// Samples of one type at one (file, line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationEntry {
    pub count: u64,
    pub type_name: String,
    pub file: String,
    pub line: u32,
    /// Outermost caller first, allocation site last.
    pub call_stack: Vec<CallStackFrame>,
}

/// Sums the allocation-line counts of every node, grouped by type and file.
///
/// A method reached over several call paths has several nodes; their counts
/// for the same line add up.
pub fn per_location_counts(store: &AggregationStore) -> LocationCounts {
    let mut counts = LocationCounts::new();

    for aggregation in store.types() {
        let files = counts
            .entry(aggregation.type_name().to_string())
            .or_default();
        for (_, node) in aggregation.tree().nodes() {
            if node.line_counts().is_empty() {
                continue;
            }
            let lines = files.entry(node.file().to_string()).or_default();
            for (line, count) in node.line_counts() {
                *lines.entry(*line).or_insert(0) += count;
            }
        }
    }

    counts
}

struct Accumulator {
    count: u64,
    best_node: NodeId,
    best_count: u64,
}

/// Ranks every (type, file, line) by descending sample count.
///
/// Equal counts keep the order in which the locations were first sampled.
/// Each entry carries the call stack of the node that contributed the most
/// samples to it.
pub fn heaviest_locations(store: &AggregationStore) -> Vec<LocationEntry> {
    let mut ranked: Vec<(u64, LocationEntry)> = Vec::new();

    for aggregation in store.types() {
        for ((file, line), accumulator) in accumulate(aggregation) {
            let sequence = aggregation.first_seen(file, line).unwrap_or(u64::MAX);
            ranked.push((
                sequence,
                LocationEntry {
                    count: accumulator.count,
                    type_name: aggregation.type_name().to_string(),
                    file: file.to_string(),
                    line,
                    call_stack: call_stack(aggregation.tree(), accumulator.best_node, line),
                },
            ));
        }
    }

    ranked.sort_by_key(|(sequence, entry)| (Reverse(entry.count), *sequence));
    ranked.into_iter().map(|(_, entry)| entry).collect()
}

fn accumulate(aggregation: &TypeAggregation) -> HashMap<(&str, u32), Accumulator> {
    let mut locations: HashMap<(&str, u32), Accumulator> = HashMap::new();

    for (id, node) in aggregation.tree().nodes() {
        for (line, count) in node.line_counts() {
            let accumulator = locations
                .entry((node.file(), *line))
                .or_insert(Accumulator {
                    count: 0,
                    best_node: id,
                    best_count: 0,
                });
            accumulator.count += count;
            if *count > accumulator.best_count {
                accumulator.best_node = id;
                accumulator.best_count = *count;
            }
        }
    }

    locations
}

fn call_stack(tree: &CallTree, leaf: NodeId, line: u32) -> Vec<CallStackFrame> {
    tree.path_to(leaf)
        .into_iter()
        .filter_map(|id| {
            let node = tree.node(id)?;
            let line = if id == leaf {
                Some(line)
            } else {
                node.caller_line_counts()
                    .iter()
                    .max_by_key(|(line, count)| (**count, Reverse(**line)))
                    .map(|(line, _)| *line)
            };
            Some(CallStackFrame {
                name: node.qualified_name(),
                file: node.file().to_string(),
                line,
                total_count: node.total_count(),
                self_count: node.self_count(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, StackPath};
    use pretty_assertions::assert_eq;

    fn site(method: &str, line: u32) -> StackPath {
        StackPath::new(vec![
            Frame::new("main", "app.rs", 1),
            Frame::new(method, "app.rs", line),
        ])
    }

    #[test]
    fn counts_are_summed_across_call_paths() {
        let mut store = AggregationStore::new();
        // `helper` allocates on line 9, reached from two callers.
        let via_a = StackPath::new(vec![
            Frame::new("a", "app.rs", 3),
            Frame::new("helper", "app.rs", 9),
        ]);
        let via_b = StackPath::new(vec![
            Frame::new("b", "app.rs", 5),
            Frame::new("helper", "app.rs", 9),
        ]);
        store.record("Object", &via_a);
        store.record("Object", &via_b);
        store.record("Object", &via_b);

        let counts = per_location_counts(&store);
        assert_eq!(counts["Object"]["app.rs"], BTreeMap::from([(9, 3)]));
    }

    #[test]
    fn per_location_counts_is_idempotent() {
        let mut store = AggregationStore::new();
        store.record("Object", &site("a", 2));
        store.record("Object", &site("b", 3));
        assert_eq!(per_location_counts(&store), per_location_counts(&store));
    }

    #[test]
    fn heaviest_locations_ranks_by_count() {
        let mut store = AggregationStore::new();
        store.record("Object", &site("a", 2));
        for _ in 0..3 {
            store.record("String", &site("b", 3));
        }
        store.record("Object", &site("c", 4));
        store.record("Object", &site("a", 2));

        let ranked: Vec<(u64, String, u32)> = heaviest_locations(&store)
            .into_iter()
            .map(|entry| (entry.count, entry.type_name, entry.line))
            .collect();

        assert_eq!(
            ranked,
            vec![
                (3, "String".to_string(), 3),
                (2, "Object".to_string(), 2),
                (1, "Object".to_string(), 4),
            ]
        );
    }

    #[test]
    fn ties_keep_first_observed_order() {
        let mut store = AggregationStore::new();
        store.record("B", &site("x", 7));
        store.record("A", &site("y", 8));
        store.record("B", &site("z", 6));

        let lines: Vec<u32> = heaviest_locations(&store).iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![7, 8, 6]);
    }

    #[test]
    fn call_stack_runs_from_root_to_site() {
        let mut store = AggregationStore::new();
        let path = StackPath::new(vec![
            Frame::new("main", "app.rs", 1).with_owner("App"),
            Frame::new("load", "app.rs", 12).with_owner("App"),
            Frame::new("parse", "parse.rs", 40).with_owner("Parser"),
        ]);
        store.record("Node", &path);
        store.record("Node", &path);

        let entries = heaviest_locations(&store);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].call_stack,
            vec![
                CallStackFrame {
                    name: "App#main".to_string(),
                    file: "app.rs".to_string(),
                    line: Some(1),
                    total_count: 2,
                    self_count: 0,
                },
                CallStackFrame {
                    name: "App#load".to_string(),
                    file: "app.rs".to_string(),
                    line: Some(12),
                    total_count: 2,
                    self_count: 0,
                },
                CallStackFrame {
                    name: "Parser#parse".to_string(),
                    file: "parse.rs".to_string(),
                    line: Some(40),
                    total_count: 2,
                    self_count: 2,
                },
            ]
        );
    }

    #[test]
    fn representative_stack_is_the_heaviest_path() {
        let mut store = AggregationStore::new();
        let rare = StackPath::new(vec![
            Frame::new("rare", "app.rs", 2),
            Frame::new("helper", "app.rs", 9),
        ]);
        let hot = StackPath::new(vec![
            Frame::new("hot", "app.rs", 4),
            Frame::new("helper", "app.rs", 9),
        ]);
        store.record("Object", &rare);
        store.record("Object", &hot);
        store.record("Object", &hot);

        let entries = heaviest_locations(&store);
        assert_eq!(entries[0].count, 3);
        assert_eq!(entries[0].call_stack[0].name, "hot");
    }
}
