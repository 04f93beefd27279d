//! Common utilities and types module.
// Shared entry type and path helpers used by scanner, writer and reader.

use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// One scanned filesystem entry on its way into a writer.
///
/// Born in the scanner (or the remote agent), consumed exactly once by one writer
/// worker, dropped after its bytes are framed.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Full path as scanned (root joined with the relative part).
    pub path: PathBuf,
    /// `lstat` metadata; symlinks are not followed.
    pub metadata: Metadata,
    /// Stored path of the scan root this entry was found under. Directories
    /// above it are not announced.
    pub floor: Option<Arc<str>>,
}

impl DirEntry {
    pub fn new(path: impl Into<PathBuf>, metadata: Metadata) -> Self {
        Self { path: path.into(), metadata, floor: None }
    }

    pub fn with_floor(mut self, floor: Arc<str>) -> Self {
        self.floor = Some(floor);
        self
    }

    /// Reads metadata for `path` without following a final symlink.
    pub fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let metadata = std::fs::symlink_metadata(&path)?;
        Ok(Self { path, metadata, floor: None })
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.metadata.file_type().is_file()
    }

    pub fn size(&self) -> u64 {
        self.metadata.len()
    }

    /// The path as stored in section headers.
    pub fn archive_path(&self) -> String {
        archive_path(&self.path)
    }
}

/// Normalize path by replacing backslashes with forward slashes.
/// Leading `./` and repeated slashes are dropped; everything else is kept.
/// Example: "./dir1//dir2/file.txt" becomes "dir1/dir2/file.txt"
pub fn normalize_path(path: &str) -> String {
    let s = path.replace('\\', "/");
    let mut out = String::with_capacity(s.len());
    let mut last_slash = false;
    for ch in s.chars() {
        if ch == '/' {
            if last_slash {
                continue;
            }
            last_slash = true;
        } else {
            last_slash = false;
        }
        out.push(ch);
    }
    let mut trimmed: &str = &out;
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    if trimmed.len() > 1 {
        trimmed = trimmed.trim_end_matches('/');
    }
    trimmed.to_string()
}

pub fn archive_path(path: &Path) -> String {
    normalize_path(&path.to_string_lossy())
}

/// Parent of a stored path, or `None` when `path` is a top-level entry
/// (nothing above it needs announcing).
pub fn archive_parent(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    let parent = &path[..idx];
    if parent.is_empty() || parent == "." {
        return None;
    }
    Some(parent)
}

/// Lexically cleans a path: removes `.` components and folds `name/..` pairs.
/// Leading `..` components that cannot be folded are kept.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(comp),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().map(|c| c.as_os_str()).collect()
}

/// Turns a stored path into a path relative to an extraction root.
/// Returns `None` for paths that would escape the root.
pub fn safe_relative(stored: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in Path::new(stored).components() {
        match comp {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dot_and_doubles() {
        assert_eq!(normalize_path("./dir1//dir2/file.txt"), "dir1/dir2/file.txt");
        assert_eq!(normalize_path("dir\\sub\\x"), "dir/sub/x");
        assert_eq!(normalize_path("/abs/dir/"), "/abs/dir");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn parents_stop_at_top_level() {
        assert_eq!(archive_parent("a/b/c"), Some("a/b"));
        assert_eq!(archive_parent("a"), None);
        assert_eq!(archive_parent("/abs"), None);
        assert_eq!(archive_parent("/abs/x"), Some("/abs"));
    }

    #[test]
    fn clean_folds_parent_components() {
        assert_eq!(clean_path(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(clean_path(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(clean_path(Path::new("a/../..")), PathBuf::from(".."));
        assert_eq!(clean_path(Path::new("./")), PathBuf::from("."));
    }

    #[test]
    fn safe_relative_refuses_escapes() {
        assert_eq!(safe_relative("/abs/dir/f"), Some(PathBuf::from("abs/dir/f")));
        assert_eq!(safe_relative("dir/../../etc"), None);
        assert_eq!(safe_relative("./x"), Some(PathBuf::from("x")));
    }
}
