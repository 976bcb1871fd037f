//! Graph traversal: bounded, deterministic expansion over the
//! symbol/relation graph. Cycles are expected (mutual calls/imports) and
//! are handled with a seen-set, never an unbounded walk.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::GraphCaps;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolRole {
    /// function/const-like: capped at the utility fanout (default 3).
    Utility,
    /// class/struct/interface/module-like: capped at the class fanout
    /// (default 10).
    ClassLike,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub dst_symbol_id: String,
    pub dst_name: String,
    pub dst_role: SymbolRole,
    pub kind: String,
}

/// Anything that can answer "what does this symbol point to" — implemented
/// against the structural store's `relations` table by callers.
pub trait SymbolGraph {
    fn outgoing(&self, symbol_id: &str) -> Vec<GraphEdge>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionHit {
    pub symbol_id: String,
    pub name: String,
    pub distance: u32,
}

/// Bounded, deterministic BFS expansion from `roots`. Ordering within each depth level is lexicographic on symbol name,
/// matching the retrieval pipeline's composite rerank key.
pub fn expand(
    graph: &dyn SymbolGraph,
    roots: &[(String, String)],
    caps: &GraphCaps,
    depth: Option<u32>,
) -> Vec<ExpansionHit> {
    let max_depth = depth.unwrap_or(caps.default_depth).min(caps.max_depth);

    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, String, u32)> = VecDeque::new();
    let mut hits = Vec::new();

    for (id, name) in roots {
        if seen.insert(id.clone()) {
            queue.push_back((id.clone(), name.clone(), 0));
        }
    }

    while let Some((symbol_id, name, distance)) = queue.pop_front() {
        hits.push(ExpansionHit {
            symbol_id: symbol_id.clone(),
            name,
            distance,
        });
        if distance >= max_depth {
            continue;
        }
        let mut edges = graph.outgoing(&symbol_id);
        edges.sort_by(|a, b| a.dst_name.cmp(&b.dst_name));

        let mut utility_taken = 0usize;
        let mut class_taken = 0usize;
        for edge in edges {
            let cap = match edge.dst_role {
                SymbolRole::Utility => caps.utility_fanout,
                SymbolRole::ClassLike => caps.class_fanout,
            };
            let taken = match edge.dst_role {
                SymbolRole::Utility => &mut utility_taken,
                SymbolRole::ClassLike => &mut class_taken,
            };
            if *taken >= cap {
                continue;
            }
            if seen.insert(edge.dst_symbol_id.clone()) {
                *taken += 1;
                queue.push_back((edge.dst_symbol_id, edge.dst_name, distance + 1));
            }
        }
    }

    hits.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.name.cmp(&b.name)));
    hits
}
