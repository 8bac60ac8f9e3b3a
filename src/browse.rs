//! Supplemental filesystem endpoints (§2.5): `GET /api/fs/browse` and
//! `POST /api/mkdir`, used by clients to pick a working directory before
//! creating a session, plus static file serving for an externally built web
//! frontend bundle.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{CoreError, Result};

#[derive(Debug, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Serialize)]
pub struct BrowseResult {
    pub path: String,
    pub entries: Vec<DirEntry>,
}

/// Expands a leading `~` the way `POST /sessions`'s `workingDir` does
/// (§4.7).
#[must_use]
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        return if rest.is_empty() {
            home
        } else {
            home.join(rest.trim_start_matches('/'))
        };
    }
    PathBuf::from(path)
}

/// Lists the contents of `path`, sorted directories-first then by name.
pub fn browse(path: &str) -> Result<BrowseResult> {
    let resolved = expand_tilde(path);
    if !resolved.is_dir() {
        return Err(CoreError::InvalidArgument(format!("not a directory: {}", resolved.display())));
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&resolved)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path().to_string_lossy().into_owned(),
            is_dir: file_type.is_dir(),
        });
    }
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

    Ok(BrowseResult {
        path: resolved.to_string_lossy().into_owned(),
        entries,
    })
}

/// Creates a directory (and its parents), mirroring the teacher's
/// `handle_mkdir`.
pub fn mkdir(path: &str) -> Result<()> {
    let resolved = expand_tilde(path);
    std::fs::create_dir_all(resolved)?;
    Ok(())
}

/// Resolves a request path against a configured static root, refusing any
/// path that would escape it via `..` traversal. A request that resolves to
/// a directory falls back to that directory's own `index.html`, matching
/// the teacher's `serve_static_file` (a directory with no `index.html`
/// resolves to nothing, not a listing).
pub fn resolve_static_file(root: &Path, request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let candidate = if trimmed.is_empty() {
        root.join("index.html")
    } else {
        root.join(trimmed)
    };

    let root = root.canonicalize().ok()?;
    let mut resolved = candidate.canonicalize().ok()?;
    if !resolved.starts_with(&root) {
        return None;
    }
    if resolved.is_dir() {
        resolved = resolved.join("index.html");
        if !resolved.is_file() {
            return None;
        }
    }
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browse_lists_directory_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("file.txt"), b"x").unwrap();

        let result = browse(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(result.entries.len(), 2);
        assert!(result.entries[0].is_dir);
    }

    #[test]
    fn browse_rejects_non_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(browse(file.to_str().unwrap()).is_err());
    }

    #[test]
    fn mkdir_creates_nested_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        mkdir(nested.to_str().unwrap()).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn resolve_static_file_rejects_traversal() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), b"hi").unwrap();
        assert!(resolve_static_file(dir.path(), "/../etc/passwd").is_none());
        assert!(resolve_static_file(dir.path(), "/").is_some());
    }

    #[test]
    fn resolve_static_file_falls_back_to_subdirectory_index() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/index.html"), b"hi").unwrap();
        let resolved = resolve_static_file(dir.path(), "/sub/").unwrap();
        assert_eq!(resolved, dir.path().join("sub/index.html").canonicalize().unwrap());
        assert!(resolve_static_file(dir.path(), "/missing/").is_none());
    }
}
