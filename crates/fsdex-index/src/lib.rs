//! The concurrently readable, per-file-partitioned inverted index (§4.3 of the spec).
//!
//! `IndexDb` holds one [`SingleFileIndex`] per currently-indexed file behind a fair
//! reader-writer lock over the outer map. Readers never block each other and always observe a
//! whole file's index or its predecessor, never a partial mixture, because each entry is
//! replaced wholesale rather than mutated in place.

use std::{
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use fsdex_tokenizer::TokenMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// An occurrence of a token: an absolute path plus the half-open byte range of the occurrence
/// within that file's contents at the revision the index currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePosition {
    pub file_path: PathBuf,
    pub range: Range<usize>,
}

/// The complete index for one file at one revision. Never mutated in place: a modification
/// replaces the whole value.
#[derive(Debug, Clone)]
pub struct SingleFileIndex {
    tokens: FxHashMap<String, Vec<FilePosition>>,
    revision: Instant,
}

impl SingleFileIndex {
    /// Builds an index entry for `path` from a tokenizer's raw output.
    ///
    /// Each byte range the tokenizer produced is promoted into a [`FilePosition`] by attaching
    /// `path`, per §4.4.
    pub fn from_tokens(path: &Path, tokens: TokenMap, revision: Instant) -> Self {
        let tokens = tokens
            .into_iter()
            .map(|(token, ranges)| {
                let positions = ranges
                    .into_iter()
                    .map(|range| FilePosition {
                        file_path: path.to_path_buf(),
                        range,
                    })
                    .collect();
                (token, positions)
            })
            .collect();
        Self { tokens, revision }
    }

    pub fn revision(&self) -> Instant {
        self.revision
    }

    pub fn query(&self, token: &str) -> &[FilePosition] {
        self.tokens.get(token).map_or(&[], |v| v.as_slice())
    }
}

/// The process-lifetime map from absolute path to that file's current index.
#[derive(Default)]
pub struct IndexDb {
    files: RwLock<FxHashMap<PathBuf, Arc<SingleFileIndex>>>,
}

impl IndexDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the entry for `path` unconditionally.
    ///
    /// Used for `Created` notifications: a file that is created and then rapidly re-created
    /// (see the back-fill duplicate-Created open question in the spec) must always win with its
    /// latest contents, regardless of any revision already present.
    pub fn create_file_index(&self, path: PathBuf, entry: SingleFileIndex) {
        self.files.write().insert(path, Arc::new(entry));
    }

    /// Installs `entry` only if an existing entry is present and its revision is not strictly
    /// newer than `entry`'s (P7: revision monotonicity).
    ///
    /// A `Modified` notification for a file that was never `Created` (e.g. the initial scan
    /// raced with an early Modified event) is dropped rather than silently creating an entry —
    /// a fresh Created or a rescan will eventually supply one.
    pub fn modify_file_index(&self, path: PathBuf, entry: SingleFileIndex) {
        let mut files = self.files.write();
        match files.get(&path) {
            Some(existing) if existing.revision() > entry.revision() => {
                // Strictly newer revision already stored: drop this stale update.
            }
            Some(_) => {
                files.insert(path, Arc::new(entry));
            }
            None => {}
        }
    }

    /// Removes the entry for `path` if present; a no-op otherwise.
    pub fn delete_file_index(&self, path: &Path) {
        self.files.write().remove(path);
    }

    /// Returns every `FilePosition` for `needle` across every currently indexed file.
    ///
    /// An empty needle returns an empty list by convention, not an error.
    pub fn query(&self, needle: &str) -> Vec<FilePosition> {
        if needle.is_empty() {
            return Vec::new();
        }
        self.files
            .read()
            .values()
            .flat_map(|index| index.query(needle).to_vec())
            .collect()
    }

    /// Number of currently indexed files. Exposed for tests and CLI status reporting.
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }
}
