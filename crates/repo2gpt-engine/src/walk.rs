//! Filesystem walk feeding the filter engine.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::filter::{FilterEngine, Reason};

const BINARY_SNIFF_BYTES: usize = 1024;

/// A file selected for the bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncludedFile {
    /// `/`-separated path relative to the tree root.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    pub reason: Reason,
}

#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Sorted by `relative_path`.
    pub files: Vec<IncludedFile>,
    pub excluded: BTreeMap<&'static str, usize>,
    pub warnings: Vec<String>,
}

/// Walk `root` and return the included files in path order.
///
/// Blocking; run it on a blocking thread from async code.
pub fn collect_files(root: &Path, filter: &FilterEngine) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            match relative(root, entry.path()) {
                Some(rel) => !filter.should_prune_dir(&rel),
                None => true,
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                outcome.warnings.push(format!("walk error: {e}"));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative(root, entry.path()) else {
            outcome
                .warnings
                .push(format!("skipping non-UTF-8 path: {}", entry.path().display()));
            continue;
        };
        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                outcome.warnings.push(format!("{rel}: {e}"));
                continue;
            }
        };

        let decision = filter.decide(&rel, size);
        if !decision.include {
            *outcome.excluded.entry(decision.reason.as_str()).or_default() += 1;
            continue;
        }
        if is_binary(entry.path()) {
            *outcome.excluded.entry(Reason::Binary.as_str()).or_default() += 1;
            continue;
        }

        outcome.files.push(IncludedFile {
            relative_path: rel,
            absolute_path: entry.path().to_path_buf(),
            size,
            reason: decision.reason,
        });
    }

    outcome
        .files
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    outcome
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

/// A NUL byte in the first KiB marks a file as binary. Unreadable files count as binary.
pub fn is_binary(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return true;
    };
    let mut buf = Vec::with_capacity(BINARY_SNIFF_BYTES);
    if file
        .take(BINARY_SNIFF_BYTES as u64)
        .read_to_end(&mut buf)
        .is_err()
    {
        return true;
    }
    buf.contains(&0)
}
