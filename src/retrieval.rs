//! Retrieval pipeline: lexical match, bounded graph expansion,
//! deterministic rerank. A pure function of the current index snapshot —
//! it never mutates the index and never returns source text.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::GraphCaps;
use crate::index::graph::{expand, SymbolGraph};
use crate::index::lexical::LexicalIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchQuality {
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub path: PathBuf,
    pub symbol_id: Option<String>,
    pub symbol_name: Option<String>,
    pub quality: MatchQuality,
    pub graph_distance: u32,
    pub is_test_file: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalQuery {
    pub text: String,
    pub include_test_files: bool,
}

fn is_test_file(path: &std::path::Path) -> bool {
    let s = path.to_string_lossy();
    s.contains("test") || s.contains("spec")
}

/// Fixed lexicographic composite rerank key: exact before
/// fuzzy, ascending graph distance, test files deranked unless requested,
/// ties broken by path then symbol name.
fn rerank_key(hit: &RetrievalHit, include_test_files: bool) -> (u8, u32, u8, String, String) {
    let quality_rank = match hit.quality {
        MatchQuality::Exact => 0,
        MatchQuality::Fuzzy => 1,
    };
    let test_rank = if hit.is_test_file && !include_test_files {
        1
    } else {
        0
    };
    (
        quality_rank,
        hit.graph_distance,
        test_rank,
        hit.path.to_string_lossy().into_owned(),
        hit.symbol_name.clone().unwrap_or_default(),
    )
}

/// Runs the full pipeline: lexical match over `query.text`, bounded graph
/// expansion around each hit, deterministic rerank.
pub fn retrieve(
    lexical: &LexicalIndex,
    graph: &dyn SymbolGraph,
    graph_caps: &GraphCaps,
    symbol_lookup: impl Fn(&std::path::Path) -> Option<(String, String)>,
    query: &RetrievalQuery,
) -> Vec<RetrievalHit> {
    let postings = lexical.query(&query.text);

    let mut hits: Vec<RetrievalHit> = Vec::new();
    let mut roots = Vec::new();

    for posting in &postings {
        let symbol = symbol_lookup(&posting.path);
        hits.push(RetrievalHit {
            path: posting.path.clone(),
            symbol_id: symbol.as_ref().map(|(id, _)| id.clone()),
            symbol_name: symbol.as_ref().map(|(_, name)| name.clone()),
            quality: MatchQuality::Exact,
            graph_distance: 0,
            is_test_file: is_test_file(&posting.path),
        });
        if let Some((id, name)) = symbol {
            roots.push((id, name));
        }
    }

    if !roots.is_empty() {
        let expansion = expand(graph, &roots, graph_caps, None);
        for e in expansion {
            if e.distance == 0 {
                continue;
            }
            hits.push(RetrievalHit {
                path: PathBuf::new(),
                symbol_id: Some(e.symbol_id),
                symbol_name: Some(e.name),
                quality: MatchQuality::Fuzzy,
                graph_distance: e.distance,
                is_test_file: false,
            });
        }
    }

    hits.sort_by(|a, b| {
        rerank_key(a, query.include_test_files).cmp(&rerank_key(b, query.include_test_files))
    });
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::graph::GraphEdge;
    use crate::index::lexical::{MatchKind, Posting};

    struct EmptyGraph;
    impl SymbolGraph for EmptyGraph {
        fn outgoing(&self, _symbol_id: &str) -> Vec<GraphEdge> {
            vec![]
        }
    }

    #[test]
    fn test_files_are_deranked_unless_requested() {
        let mut lex = LexicalIndex::new(30);
        lex.append_segment(vec![
            Posting {
                path: PathBuf::from("src/foo.rs"),
                token: "foo".into(),
                kind: MatchKind::IdentifierToken,
                line: 1,
            },
            Posting {
                path: PathBuf::from("tests/foo_test.rs"),
                token: "foo".into(),
                kind: MatchKind::IdentifierToken,
                line: 1,
            },
        ]);
        let graph = EmptyGraph;
        let caps = GraphCaps::default();
        let hits = retrieve(
            &lex,
            &graph,
            &caps,
            |_| None,
            &RetrievalQuery {
                text: "foo".into(),
                include_test_files: false,
            },
        );
        assert_eq!(hits[0].path, PathBuf::from("src/foo.rs"));
    }

    #[test]
    fn is_pure_given_same_snapshot() {
        let mut lex = LexicalIndex::new(30);
        lex.append_segment(vec![Posting {
            path: PathBuf::from("a.rs"),
            token: "x".into(),
            kind: MatchKind::IdentifierToken,
            line: 1,
        }]);
        let graph = EmptyGraph;
        let caps = GraphCaps::default();
        let q = RetrievalQuery {
            text: "x".into(),
            include_test_files: true,
        };
        let a = retrieve(&lex, &graph, &caps, |_| None, &q);
        let b = retrieve(&lex, &graph, &caps, |_| None, &q);
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].path, b[0].path);
    }
}
