//! Target resolution: the content the loop fingerprints, describes, and
//! measures.
//!
//! The controller does not care whether the target is a diff, a file list, or
//! a whole tree; it only needs a snapshot for fingerprinting, a description
//! for prompts, and a change-magnitude measure. `FileSet` is the concrete
//! implementation; tests substitute in-memory targets.

use crate::util::sha256_hex;
use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

/// Point-in-time content of every target file, keyed by display path.
/// Content is raw bytes: the fingerprint must see every byte difference,
/// UTF-8 or not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<String, Vec<u8>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), content.into());
    }

    /// Iterate files in sorted path order.
    pub fn files(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.files.iter()
    }
}

/// What the convergence loop needs from a target.
pub trait Target {
    /// Short textual description handed to prompts.
    fn describe(&self) -> String;

    /// Read current content. Only meaningful once any subprocess that may
    /// edit the target has fully exited.
    fn snapshot(&self) -> Result<Snapshot>;
}

/// An explicit list of files under review.
pub struct FileSet {
    files: Vec<PathBuf>,
}

impl FileSet {
    pub fn new(files: Vec<PathBuf>) -> Result<Self> {
        if files.is_empty() {
            return Err(anyhow!("no target files given"));
        }
        for file in &files {
            if !file.is_file() {
                return Err(anyhow!("target file missing: {}", file.display()));
            }
        }
        Ok(Self { files })
    }

    /// Stable identity key for locking and log directories: a digest of the
    /// sorted canonical paths, so the same file set maps to the same session
    /// regardless of argument order or relative spelling.
    pub fn identity(&self) -> Result<String> {
        let mut canonical = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let resolved = file
                .canonicalize()
                .with_context(|| format!("resolve target file {}", file.display()))?;
            canonical.push(resolved.display().to_string());
        }
        canonical.sort();
        let digest = sha256_hex(canonical.join("\n").as_bytes());
        Ok(digest[..12].to_string())
    }
}

impl Target for FileSet {
    fn describe(&self) -> String {
        self.files
            .iter()
            .map(|file| format!("- {}", file.display()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for file in &self.files {
            let bytes =
                fs::read(file).with_context(|| format!("read target file {}", file.display()))?;
            snapshot.insert(file.display().to_string(), bytes);
        }
        Ok(snapshot)
    }
}

/// Total lines touched between two snapshots: per file, lines present on one
/// side but not the other (counted with multiplicity); added or deleted files
/// count all their lines. Order-insensitive within a file and strictly
/// monotone in edit size, which is all the runaway ceiling needs. Content is
/// decoded lossily here; exact byte sensitivity lives in the fingerprint,
/// this is only a size measure.
pub fn change_magnitude(before: &Snapshot, after: &Snapshot) -> usize {
    let paths: BTreeSet<&String> = before.files.keys().chain(after.files.keys()).collect();
    let mut total = 0;
    for path in paths {
        total += match (before.files.get(path), after.files.get(path)) {
            (Some(old), Some(new)) => {
                line_delta(&String::from_utf8_lossy(old), &String::from_utf8_lossy(new))
            }
            (Some(old), None) => String::from_utf8_lossy(old).lines().count(),
            (None, Some(new)) => String::from_utf8_lossy(new).lines().count(),
            (None, None) => 0,
        };
    }
    total
}

fn line_delta(before: &str, after: &str) -> usize {
    let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
    for line in before.lines() {
        *counts.entry(line).or_default() += 1;
    }
    for line in after.lines() {
        *counts.entry(line).or_default() -= 1;
    }
    counts.values().map(|count| count.unsigned_abs() as usize).sum()
}
