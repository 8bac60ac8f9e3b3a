//! On-disk layout helpers for the control directory (§4.1): one directory
//! per session holding `session.json`, `stream-out`, and the `stdin`/
//! `control` FIFOs.

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::error::Result;

pub const SESSION_JSON: &str = "session.json";
pub const STREAM_OUT: &str = "stream-out";
pub const STDIN_FIFO: &str = "stdin";
pub const CONTROL_FIFO: &str = "control";
pub const NOTIFICATION_STREAM: &str = "notification-stream";

#[must_use]
pub fn session_dir(control_root: &Path, id: &str) -> PathBuf {
    control_root.join(id)
}

#[must_use]
pub fn session_json_path(control_root: &Path, id: &str) -> PathBuf {
    session_dir(control_root, id).join(SESSION_JSON)
}

#[must_use]
pub fn stream_out_path(control_root: &Path, id: &str) -> PathBuf {
    session_dir(control_root, id).join(STREAM_OUT)
}

#[must_use]
pub fn stdin_fifo_path(control_root: &Path, id: &str) -> PathBuf {
    session_dir(control_root, id).join(STDIN_FIFO)
}

#[must_use]
pub fn control_fifo_path(control_root: &Path, id: &str) -> PathBuf {
    session_dir(control_root, id).join(CONTROL_FIFO)
}

#[must_use]
pub fn notification_stream_path(control_root: &Path, id: &str) -> PathBuf {
    session_dir(control_root, id).join(NOTIFICATION_STREAM)
}

/// Creates `<root>/<id>` (§3 "Session directory is created atomically before
/// the child is spawned").
pub fn create_session_dir(control_root: &Path, id: &str) -> Result<PathBuf> {
    let dir = session_dir(control_root, id);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Creates a FIFO at `path`, tolerating "already exists" so retries are
/// idempotent.
pub fn mkfifo_atomic(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(err) => Err(std::io::Error::from(err).into()),
    }
}

/// Removes the session directory and everything under it (§4.2 `Cleanup`).
pub fn remove_session_dir(control_root: &Path, id: &str) -> Result<()> {
    let dir = session_dir(control_root, id);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

/// Lists session ids currently present under the control root, i.e. every
/// subdirectory that contains a `session.json`.
pub fn list_session_ids(control_root: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    if !control_root.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(control_root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && path.join(SESSION_JSON).exists() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                ids.push(name.to_string());
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_list_session_dirs() {
        let root = tempfile::TempDir::new().unwrap();
        let dir = create_session_dir(root.path(), "abc").unwrap();
        std::fs::write(dir.join(SESSION_JSON), "{}").unwrap();
        let ids = list_session_ids(root.path()).unwrap();
        assert_eq!(ids, vec!["abc".to_string()]);
    }

    #[test]
    fn mkfifo_atomic_is_idempotent() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("stdin");
        mkfifo_atomic(&path).unwrap();
        mkfifo_atomic(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn remove_session_dir_is_idempotent() {
        let root = tempfile::TempDir::new().unwrap();
        create_session_dir(root.path(), "abc").unwrap();
        remove_session_dir(root.path(), "abc").unwrap();
        remove_session_dir(root.path(), "abc").unwrap();
        assert!(!session_dir(root.path(), "abc").exists());
    }
}
