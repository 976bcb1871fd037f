//! Lexical token index: a segmented, append-only inverted index
//! over path tokens and parser-extracted identifier tokens. Segments are
//! immutable; updates append a new segment and mark superseded documents
//! deleted. Query never returns source text, only spans and match kinds.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::errors::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    PathToken,
    IdentifierToken,
    DocstringToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub path: PathBuf,
    pub token: String,
    pub kind: MatchKind,
    pub line: u32,
}

/// One immutable append-only segment. A segment's `deleted` set marks
/// documents (by path) superseded by a later segment without rewriting
/// this segment's postings in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Segment {
    pub id: u64,
    pub postings: Vec<Posting>,
    pub deleted: std::collections::HashSet<PathBuf>,
}

impl Segment {
    fn live_postings(&self) -> impl Iterator<Item = &Posting> {
        self.postings
            .iter()
            .filter(move |p| !self.deleted.contains(&p.path))
    }

    fn deleted_ratio_pct(&self) -> u8 {
        if self.postings.is_empty() {
            return 0;
        }
        let deleted_docs = self
            .postings
            .iter()
            .map(|p| &p.path)
            .collect::<std::collections::HashSet<_>>()
            .iter()
            .filter(|p| self.deleted.contains(**p))
            .count();
        let total_docs = self
            .postings
            .iter()
            .map(|p| &p.path)
            .collect::<std::collections::HashSet<_>>()
            .len()
            .max(1);
        ((deleted_docs * 100) / total_docs) as u8
    }
}

/// Segmented lexical index held in memory and mirrored to
/// `flate2`-compressed append-only files on disk.
pub struct LexicalIndex {
    segments: Vec<Segment>,
    next_segment_id: u64,
    merge_threshold_pct: u8,
}

impl LexicalIndex {
    pub fn new(merge_threshold_pct: u8) -> Self {
        Self {
            segments: Vec::new(),
            next_segment_id: 0,
            merge_threshold_pct,
        }
    }

    /// Appends a new segment for the given paths, marking any prior
    /// posting for those paths as deleted.
    pub fn append_segment(&mut self, postings: Vec<Posting>) {
        let touched_paths: std::collections::HashSet<PathBuf> =
            postings.iter().map(|p| p.path.clone()).collect();
        for segment in self.segments.iter_mut() {
            for path in &touched_paths {
                segment.deleted.insert(path.clone());
            }
        }
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        self.segments.push(Segment {
            id,
            postings,
            deleted: Default::default(),
        });
        self.maybe_merge();
    }

    /// Opportunistic merge when a segment's deleted-doc ratio exceeds the
    /// configured threshold.
    fn maybe_merge(&mut self) {
        let mergeable: Vec<usize> = self
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.deleted_ratio_pct() >= self.merge_threshold_pct)
            .map(|(i, _)| i)
            .collect();
        if mergeable.len() < 2 {
            return;
        }
        let mut merged = Segment {
            id: self.next_segment_id,
            postings: Vec::new(),
            deleted: Default::default(),
        };
        self.next_segment_id += 1;
        for &idx in &mergeable {
            merged
                .postings
                .extend(self.segments[idx].live_postings().cloned());
        }
        let mut kept: Vec<Segment> = self
            .segments
            .drain(..)
            .enumerate()
            .filter(|(i, _)| !mergeable.contains(i))
            .map(|(_, s)| s)
            .collect();
        kept.push(merged);
        self.segments = kept;
    }

    /// Lexical match over identifiers and paths.
    /// Returns spans and match kinds; never source text.
    pub fn query(&self, token: &str) -> Vec<Posting> {
        let mut hits: HashMap<PathBuf, Posting> = HashMap::new();
        for segment in &self.segments {
            for posting in segment.live_postings() {
                if posting.token == token {
                    hits.insert(posting.path.clone(), posting.clone());
                }
            }
        }
        let mut out: Vec<Posting> = hits.into_values().collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Persists all segments to a single gzip-compressed append-only file.
    pub fn persist(&self, path: &Path) -> CoreResult<()> {
        let json = serde_json::to_vec(&self.segments)?;
        let file = std::fs::File::create(path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&json)?;
        encoder.finish()?;
        Ok(())
    }

    pub fn load(path: &Path, merge_threshold_pct: u8) -> CoreResult<Self> {
        let file = std::fs::File::open(path)?;
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf)?;
        let segments: Vec<Segment> = serde_json::from_slice(&buf)?;
        let next_segment_id = segments.iter().map(|s| s.id).max().map(|m| m + 1).unwrap_or(0);
        Ok(Self {
            segments,
            next_segment_id,
            merge_threshold_pct,
        })
    }
}
