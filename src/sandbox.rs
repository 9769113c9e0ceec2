//! Upload-root containment checks shared by every filesystem read.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::storage::StorageError;

/// Collapses `.` and `..` without touching the filesystem.
///
/// `..` at the filesystem root is dropped, the same way the OS treats it.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normalized.push(component.as_os_str()),
            },
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Verifies that `candidate` resolves to `root` or something below it.
///
/// Relative candidates are taken relative to `root`. The lexical check runs
/// first, so a traversal attempt is rejected before the candidate is looked
/// up on disk. The returned path is canonical.
pub fn sandbox_check(root: &Path, candidate: &Path) -> Result<PathBuf, StorageError> {
    let lexical_root = normalize_lexically(root);
    let joined = if candidate.is_absolute() {
        normalize_lexically(candidate)
    } else {
        normalize_lexically(&lexical_root.join(candidate))
    };

    let canonical_root = root.canonicalize()?;
    if !joined.starts_with(&lexical_root) && !joined.starts_with(&canonical_root) {
        return Err(StorageError::InvalidPath);
    }

    let canonical = match joined.canonicalize() {
        Ok(path) => path,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(StorageError::Io(err)),
        Err(_) => return Err(StorageError::InvalidPath),
    };
    if !canonical.starts_with(&canonical_root) {
        return Err(StorageError::InvalidPath);
    }
    Ok(canonical)
}

/// Forward-slash relative path of `path` below `root`, both already canonical.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments = relative
        .components()
        .map(|component| match component {
            Component::Normal(segment) => segment.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_root() -> (tempfile::TempDir, PathBuf) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        std::fs::create_dir_all(root.join("models")).expect("create root");
        (temp, root)
    }

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c/d.stl")),
            PathBuf::from("/a/c/d.stl")
        );
    }

    #[test]
    fn accepts_existing_descendant() {
        let (_temp, root) = make_root();
        std::fs::write(root.join("models/arm.stl"), b"solid").expect("write mesh");

        let checked = sandbox_check(&root, Path::new("models/./arm.stl")).expect("inside root");
        let canonical_root = root.canonicalize().expect("canonical root");
        assert_eq!(checked, canonical_root.join("models/arm.stl"));
        assert_eq!(
            relative_to(&canonical_root, &checked).as_deref(),
            Some("models/arm.stl")
        );
    }

    #[test]
    fn rejects_parent_escape() {
        let (temp, root) = make_root();
        std::fs::write(temp.path().join("secret.txt"), b"secret").expect("write outside");

        let result = sandbox_check(&root, Path::new("models/../../secret.txt"));
        assert!(matches!(result, Err(StorageError::InvalidPath)));
        let result = sandbox_check(&root, Path::new("../../etc/passwd"));
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[test]
    fn rejects_absolute_override() {
        let (_temp, root) = make_root();
        let result = sandbox_check(&root, Path::new("/etc/passwd"));
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_temp, root) = make_root();
        let result = sandbox_check(&root, Path::new("models/missing.stl"));
        assert!(matches!(result, Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_leading_outside() {
        use std::os::unix::fs::symlink;

        let (temp, root) = make_root();
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("create outside");
        std::fs::write(outside.join("mesh.stl"), b"solid").expect("write outside");
        symlink(&outside, root.join("escape")).expect("symlink");

        let result = sandbox_check(&root, Path::new("escape/mesh.stl"));
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[test]
    fn relative_to_root_itself_is_none() {
        let (_temp, root) = make_root();
        assert_eq!(relative_to(&root, &root), None);
    }
}
