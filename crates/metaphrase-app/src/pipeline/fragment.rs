//! Core data model: logical file ids, ordered records, context batches and
//! translated spans.
//!
//! Everything here is plain data. A [`Record`] belongs to exactly one file and
//! carries a stable in-file index; a [`Batch`] is a contiguous window over one
//! file's records together with the target sub-range the LLM must produce
//! output for; a [`SpanResult`] is a validated slice of that output. Nothing
//! in this module crosses file boundaries.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable in-file record position, strictly increasing from 0.
pub type Index = i64;

/// Optional key/value metadata attached to records and spans.
///
/// The orchestration core never reads the keys; they carry container-format
/// specifics (subtitle sequence number, timecode) between splitter, decoder
/// and assembler. `BTreeMap` keeps serialization order deterministic.
pub type Meta = BTreeMap<String, String>;

/// Maps a global record index to the source record's metadata, for decoders
/// that reconstruct container fields. The dispatcher injects the source text
/// under the reserved `_src_text` key.
pub type IndexMetaMap = BTreeMap<Index, Meta>;

/// Reserved [`IndexMetaMap`] key carrying the source record text.
pub const SRC_TEXT_META_KEY: &str = "_src_text";

/// Span meta key carrying the bare translation before any container
/// rendering; the sidecar prefers it over the rendered output.
pub const DST_TEXT_META_KEY: &str = "dst_text";

/// Logical file identifier, normalized to forward slashes and cleaned of
/// redundant separators so it is stable across platforms.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

/// Persisted artifact identifier. Same representation as [`FileId`]; the
/// alias marks values that name an output rather than an input.
pub type ArtifactId = FileId;

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the sidecar artifact id (`<file_id>.jsonl`).
    pub fn sidecar(&self) -> ArtifactId {
        FileId(format!("{}.jsonl", self.0))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Normalizes a path-like string into a [`FileId`]: backslashes become
/// forward slashes, then the path is cleaned POSIX-style (`.` and `..`
/// segments resolved, duplicate separators collapsed). Relative/absolute
/// semantics are preserved; nothing is made absolute implicitly.
pub fn normalize_file_id(path: &str) -> FileId {
    let unified = path.replace('\\', "/");
    FileId(clean_path(&unified))
}

fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                match segments.last() {
                    Some(&"..") | None => {
                        if !absolute {
                            segments.push("..");
                        }
                    }
                    Some(_) => {
                        segments.pop();
                    }
                }
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Atomic input fragment produced by a splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub index: Index,
    pub file_id: FileId,
    pub text: String,
    pub meta: Option<Meta>,
}

/// Unprocessed LLM response payload, passed through verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Raw {
    pub text: String,
}

/// Read-only view of a batch's target range, handed to decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub file_id: FileId,
    pub from: Index,
    pub to: Index,
}

/// Decoder intermediate before coverage validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanCandidate {
    pub from: Index,
    pub to: Index,
    pub output: String,
    pub meta: Option<Meta>,
}

/// Validated output for a contiguous sub-range of a batch target.
///
/// Invariants: `from <= to`, the range lies inside the owning batch's target
/// range, and spans of one batch are strictly ascending by `from` with no
/// overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanResult {
    pub file_id: FileId,
    pub from: Index,
    pub to: Index,
    pub output: String,
    pub meta: Option<Meta>,
}

/// Context batch: a contiguous window `[left ctx][target][right ctx]` over one
/// file's records. Only the target range produces committed output.
///
/// The record storage is shared (`Arc`) with every other batch of the same
/// file, so cloning a batch for a worker is cheap and the window stays valid
/// until the file finishes.
#[derive(Debug, Clone)]
pub struct Batch {
    pub file_id: FileId,
    /// 0-based, strictly ascending per file; the commit-ordering key.
    pub batch_index: i64,
    pub target_from: Index,
    pub target_to: Index,
    records: Arc<[Record]>,
    window: Range<usize>,
}

impl Batch {
    pub fn new(
        file_id: FileId,
        batch_index: i64,
        records: Arc<[Record]>,
        window: Range<usize>,
        target_from: Index,
        target_to: Index,
    ) -> Self {
        debug_assert!(window.end <= records.len());
        debug_assert!(window.start < window.end);
        Self {
            file_id,
            batch_index,
            target_from,
            target_to,
            records,
            window,
        }
    }

    /// The batch window: left context, target range, right context, in
    /// ascending index order.
    pub fn records(&self) -> &[Record] {
        &self.records[self.window.clone()]
    }

    pub fn target(&self) -> Target {
        Target {
            file_id: self.file_id.clone(),
            from: self.target_from,
            to: self.target_to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: Index, text: &str) -> Record {
        Record {
            index,
            file_id: FileId::from("a.srt"),
            text: text.to_string(),
            meta: None,
        }
    }

    #[test]
    fn normalize_unifies_separators() {
        assert_eq!(normalize_file_id(r"dir\sub\file.srt").as_str(), "dir/sub/file.srt");
        assert_eq!(normalize_file_id("dir//sub/./file.srt").as_str(), "dir/sub/file.srt");
        assert_eq!(normalize_file_id("dir/sub/../file.srt").as_str(), "dir/file.srt");
    }

    #[test]
    fn normalize_preserves_relative_and_absolute() {
        assert_eq!(normalize_file_id("/abs/./path").as_str(), "/abs/path");
        assert_eq!(normalize_file_id("../up/file").as_str(), "../up/file");
        assert_eq!(normalize_file_id("/../rooted").as_str(), "/rooted");
        assert_eq!(normalize_file_id("").as_str(), ".");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [r"a\b\..\c", "x//y/./z", "/", "..", "plain.srt"] {
            let once = normalize_file_id(raw);
            let twice = normalize_file_id(once.as_str());
            assert_eq!(once, twice, "normalizing {raw:?} twice changed the id");
        }
    }

    #[test]
    fn sidecar_id_appends_jsonl() {
        assert_eq!(FileId::from("dir/a.srt").sidecar().as_str(), "dir/a.srt.jsonl");
    }

    #[test]
    fn batch_window_exposes_only_its_slice() {
        let records: Arc<[Record]> =
            (0..5).map(|i| record(i, "x")).collect::<Vec<_>>().into();
        let batch = Batch::new(FileId::from("a.srt"), 0, records, 1..4, 2, 3);
        let window = batch.records();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].index, 1);
        assert_eq!(window[2].index, 3);
        assert_eq!(batch.target().from, 2);
    }
}
