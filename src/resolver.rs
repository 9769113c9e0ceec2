//! Locates `<anchor>/.../<file>` references anywhere below the upload root.
//!
//! A ROS `package://` reference names a package directory, not a location, so
//! the uploaded tree is searched for a directory carrying the anchor name whose
//! subtree holds the rest of the path. When several directories share the
//! anchor name the first one found wins; iteration order is whatever the
//! filesystem reports.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::sandbox::sandbox_check;

/// Finds `target_path` below `root`, returning its canonical absolute path.
pub fn resolve(root: &Path, target_path: &str) -> Option<PathBuf> {
    let segments = split_segments(target_path)?;
    let (anchor, rest) = segments.split_first()?;
    let file_name = *segments.last()?;
    let root = root.canonicalize().ok()?;
    let root = root.as_path();

    if segments.len() == 2
        && let Some(found) = accept(root, &root.join(segments.join("/")), file_name)
    {
        return Some(found);
    }

    let rest: PathBuf = rest.iter().collect();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if dir.file_name() == Some(OsStr::new(anchor)) {
            if let Some(found) = accept(root, &dir.join(&rest), file_name) {
                return Some(found);
            }
        }

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = ?dir, error = %err, "skipping unreadable directory");
                continue;
            }
        };
        let mut children = Vec::new();
        for entry in entries.flatten() {
            // DirEntry::file_type does not follow symlinks.
            if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                children.push(entry.path());
            }
        }
        // Reversed so the first child read is the next one visited.
        stack.extend(children.into_iter().rev());
    }

    None
}

/// A candidate counts only if it is a regular file inside the root whose
/// canonical name is still the requested one.
fn accept(root: &Path, candidate: &Path, file_name: &str) -> Option<PathBuf> {
    let found = sandbox_check(root, candidate).ok()?;
    if found.file_name() != Some(OsStr::new(file_name)) {
        return None;
    }
    fs::metadata(&found)
        .is_ok_and(|metadata| metadata.is_file())
        .then_some(found)
}

fn split_segments(target_path: &str) -> Option<Vec<&str>> {
    let segments: Vec<&str> = target_path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    if segments.len() < 2 || segments.iter().any(|segment| *segment == "..") {
        return None;
    }
    Some(segments)
}
