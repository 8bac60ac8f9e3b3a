//! Session manager (§4.2, §4.7): composes the PTY supervisor, recorder, and
//! emulator cache into the operations the HTTP API calls, and tracks
//! external (adopted) sessions alongside server-owned ones.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::control_dir::{
    self, control_fifo_path, notification_stream_path, session_dir, session_json_path,
    stdin_fifo_path, stream_out_path,
};
use crate::emulator::EmulatorCache;
use crate::error::{CoreError, Result};
use crate::input_queue::Admission;
use crate::protocol::{
    read_session_info, update_session_info, validate_dimensions, NotificationEvent,
    NotificationWriter, SessionInfo, SessionStatus, SpawnType, StreamWriter,
};
use crate::tty_spawn::{self, PtyHandle};

/// Grace period `Kill` waits after `SIGTERM` before escalating to
/// `SIGKILL` (§4.2, §5).
pub const KILL_GRACE: Duration = Duration::from_secs(3);

pub struct CreateOptions {
    pub command: Vec<String>,
    pub working_dir: String,
    pub name: Option<String>,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

/// Owns the control directory root, the live PTY handles for server-owned
/// sessions, and the emulator cache they feed. Constructed once per process
/// (or once per test) and threaded into every HTTP handler — no hidden
/// global state (§9 "Global mutable state").
pub struct SessionManager {
    control_root: PathBuf,
    handles: Mutex<HashMap<String, Arc<PtyHandle>>>,
    pub emulators: Arc<EmulatorCache>,
}

impl SessionManager {
    #[must_use]
    pub fn new(control_root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            control_root,
            handles: Mutex::new(HashMap::new()),
            emulators: EmulatorCache::new(256),
        })
    }

    #[must_use]
    pub fn control_root(&self) -> &Path {
        &self.control_root
    }

    /// `Create` (§4.2): allocates a session id, creates its directory,
    /// writes the asciinema header, opens the PTY, spawns the command, and
    /// persists `status=running` once the child is alive.
    pub fn create(&self, opts: CreateOptions) -> Result<String> {
        if opts.command.is_empty() {
            return Err(CoreError::InvalidArgument("command must not be empty".to_string()));
        }
        validate_dimensions(opts.cols, opts.rows)?;

        let id = Uuid::new_v4().to_string();
        let dir = control_dir::create_session_dir(&self.control_root, &id)?;
        let cwd = crate::browse::expand_tilde(&opts.working_dir);

        let name = opts.name.clone().unwrap_or_else(|| {
            opts.command[0].rsplit('/').next().unwrap_or("session").to_string()
        });

        let info = SessionInfo::new_starting(
            opts.command.clone(),
            name.clone(),
            cwd.to_string_lossy().into_owned(),
            opts.term.clone(),
            opts.cols,
            opts.rows,
            SpawnType::Pty,
            None,
        );
        crate::protocol::write_atomic_json(&session_json_path(&self.control_root, &id), &info)?;

        let stream_file = File::options()
            .create(true)
            .truncate(true)
            .write(true)
            .open(stream_out_path(&self.control_root, &id))?;
        let stream_writer = StreamWriter::with_params(
            stream_file,
            u32::from(opts.cols),
            u32::from(opts.rows),
            Some(opts.command.join(" ")),
            Some(name),
            Some(HashMap::from([("TERM".to_string(), opts.term.clone())])),
        )?;

        let mut notification_writer =
            NotificationWriter::new(File::options().create(true).append(true).open(
                notification_stream_path(&self.control_root, &id),
            )?);
        let _ = notification_writer.write_notification(NotificationEvent {
            timestamp: jiff::Timestamp::now(),
            event: "session_started".to_string(),
            data: serde_json::json!({"cmdline": opts.command, "cwd": cwd.to_string_lossy()}),
        });

        let emulators = Arc::clone(&self.emulators);
        let cols = opts.cols;
        let rows = opts.rows;
        let session_id_for_output = id.clone();
        let control_root = self.control_root.clone();
        let session_id_for_exit = id.clone();

        let span = info_span!("session", id = %id);
        let _enter = span.enter();

        let handle = tty_spawn::spawn(
            &opts.command,
            &cwd,
            &opts.term,
            cols,
            rows,
            Some(stream_writer),
            move |bytes| {
                emulators.advance(&session_id_for_output, bytes, cols, rows);
            },
            move |code| {
                let path = session_json_path(&control_root, &session_id_for_exit);
                let _ = update_session_info(&path, |info| {
                    info.status = SessionStatus::Exited;
                    info.exit_code = Some(code);
                });
                let mut notification_writer = File::options()
                    .create(true)
                    .append(true)
                    .open(notification_stream_path(&control_root, &session_id_for_exit))
                    .ok()
                    .map(NotificationWriter::new);
                if let Some(writer) = notification_writer.as_mut() {
                    let _ = writer.write_notification(NotificationEvent {
                        timestamp: jiff::Timestamp::now(),
                        event: "session_exited".to_string(),
                        data: serde_json::json!({"exit_code": code}),
                    });
                }
                info!(exit_code = code, "session exited");
            },
        )?;

        update_session_info(&session_json_path(&self.control_root, &id), |info| {
            info.status = SessionStatus::Running;
            info.pid = Some(handle.child.as_raw() as u32);
        })?;

        self.handles.lock().unwrap_or_else(|e| e.into_inner()).insert(id.clone(), Arc::new(handle));
        control_dir::mkfifo_atomic(&stdin_fifo_path(&self.control_root, &id))?;
        control_dir::mkfifo_atomic(&control_fifo_path(&self.control_root, &id))?;

        drop(dir);
        Ok(id)
    }

    /// Reads `session.json`, reconciling `status=running` against whether
    /// the pid is still alive for externally-adopted sessions (lazy
    /// adoption, §3).
    pub fn get(&self, id: &str) -> Result<SessionInfo> {
        let path = session_json_path(&self.control_root, id);
        if !path.exists() {
            return Err(CoreError::NotFound(id.to_string()));
        }
        let mut info = read_session_info(&path)?;
        if info.status == SessionStatus::Running {
            if let Some(pid) = info.pid {
                if !is_pid_alive(pid) && !self.handles.lock().unwrap_or_else(|e| e.into_inner()).contains_key(id) {
                    info.status = SessionStatus::Exited;
                }
            }
        }
        Ok(info)
    }

    /// `GET /sessions` (§4.7): every session directory under the control
    /// root, server-owned or externally adopted.
    pub fn list(&self) -> Result<HashMap<String, SessionInfo>> {
        let mut out = HashMap::new();
        for id in control_dir::list_session_ids(&self.control_root)? {
            if let Ok(info) = self.get(&id) {
                out.insert(id, info);
            }
        }
        Ok(out)
    }

    /// `SendInput` (§4.2): writes to the owned PTY's bounded queue, or the
    /// external session's `stdin` FIFO.
    pub fn send_input(&self, id: &str, text: &str) -> Result<()> {
        let info = self.get(id)?;
        if info.status == SessionStatus::Exited {
            return Ok(());
        }
        if let Some(handle) = self.handles.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned() {
            match handle.send_input(text.as_bytes())? {
                Admission::Accepted | Admission::AcceptedWithBackpressure => Ok(()),
            }
        } else {
            tty_spawn::write_to_external_stdin(&stdin_fifo_path(&self.control_root, id), text.as_bytes())
        }
    }

    /// `SendKey` (§4.2): maps a symbolic key name to its control sequence
    /// and delegates to `send_input`.
    pub fn send_key(&self, id: &str, key_name: &str) -> Result<()> {
        let bytes = key_to_bytes(key_name)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown key: {key_name}")))?;
        let text = String::from_utf8_lossy(bytes).into_owned();
        self.send_input(id, &text)
    }

    /// `Resize` (§4.2): `TIOCSWINSZ` for owned sessions, or a control-FIFO
    /// message (falling back to `SIGWINCH`) for external ones. Resolved
    /// ambiguity (§3/SPEC_FULL §3): refuses on an exited session with
    /// `409 Conflict`, and is a no-op when dimensions are unchanged.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        validate_dimensions(cols, rows)?;
        let info = self.get(id)?;
        if info.status == SessionStatus::Exited {
            return Err(CoreError::Conflict(format!("session {id} has already exited")));
        }
        if info.cols == cols && info.rows == rows {
            return Ok(());
        }

        if let Some(handle) = self.handles.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned() {
            handle.request_resize(cols, rows);
        } else {
            let message = serde_json::json!({"cmd": "resize", "cols": cols, "rows": rows}).to_string();
            if tty_spawn::write_to_external_stdin(&control_fifo_path(&self.control_root, id), message.as_bytes()).is_err() {
                if let Some(pid) = info.pid {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        Signal::SIGWINCH,
                    );
                }
            }
        }

        self.emulators.resize(id, cols, rows);
        update_session_info(&session_json_path(&self.control_root, id), |i| {
            i.cols = cols;
            i.rows = rows;
        })?;
        Ok(())
    }

    /// `Kill` (§4.2): `SIGTERM` then, after [`KILL_GRACE`], `SIGKILL` if the
    /// child is still alive. Succeeds even if the session was already dead.
    pub fn kill(&self, id: &str) -> Result<()> {
        let info = self.get(id)?;
        if info.status == SessionStatus::Exited {
            return Ok(());
        }

        if let Some(handle) = self.handles.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned() {
            handle.signal(Signal::SIGTERM)?;
            let deadline = Instant::now() + KILL_GRACE;
            while Instant::now() < deadline {
                if handle.has_exited() {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            if !handle.has_exited() {
                handle.signal(Signal::SIGKILL)?;
            }
        } else {
            let message = serde_json::json!({"cmd": "kill", "signal": "SIGTERM"}).to_string();
            let _ = tty_spawn::write_to_external_stdin(&control_fifo_path(&self.control_root, id), message.as_bytes());
            if let Some(pid) = info.pid {
                let pid = nix::unistd::Pid::from_raw(pid as i32);
                std::thread::sleep(KILL_GRACE);
                if is_pid_alive(pid.as_raw() as u32) {
                    warn!(session_id = %id, "external session still alive after grace, escalating to SIGKILL");
                    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
                }
            }
        }
        Ok(())
    }

    /// `Cleanup` (§4.2): refuses while `status=running` (use
    /// `cleanup_exited` instead); removes the directory and drops
    /// in-memory state, including the emulator cache entry (§3
    /// "cleanup-exited and the emulator cache").
    pub fn cleanup(&self, id: &str) -> Result<()> {
        let info = self.get(id)?;
        if info.status != SessionStatus::Exited {
            return Err(CoreError::Conflict(format!("session {id} is still running")));
        }
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
        self.emulators.evict(id);
        control_dir::remove_session_dir(&self.control_root, id)?;
        Ok(())
    }

    /// `POST /cleanup-exited` (§4.7): removes every exited session locally,
    /// returning the count removed.
    pub fn cleanup_exited(&self) -> Result<u64> {
        reap_zombies();
        let mut count = 0;
        for (id, info) in self.list()? {
            if info.status == SessionStatus::Exited && self.cleanup(&id).is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Kills every still-running owned or external session, for the process
    /// shutdown drain order in §5 ("kill owned sessions with escalation").
    /// Best-effort: one session's failure doesn't stop the rest.
    pub fn shutdown_all(&self) {
        let Ok(sessions) = self.list() else { return };
        for (id, info) in sessions {
            if info.status != SessionStatus::Exited {
                if let Err(err) = self.kill(&id) {
                    warn!(session_id = %id, error = %err, "failed to kill session during shutdown");
                }
            }
        }
    }
}

/// Maps a symbolic key name to its control sequence (§4.2 `SendKey`).
#[must_use]
pub fn key_to_bytes(key: &str) -> Option<&'static [u8]> {
    Some(match key {
        "enter" => b"\r",
        "escape" => b"\x1b",
        "tab" => b"\t",
        "backspace" => b"\x7f",
        "arrow_up" => b"\x1b[A",
        "arrow_down" => b"\x1b[B",
        "arrow_right" => b"\x1b[C",
        "arrow_left" => b"\x1b[D",
        "ctrl_c" => b"\x03",
        "ctrl_d" => b"\x04",
        "ctrl_z" => b"\x1a",
        _ => return None,
    })
}

fn is_pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Reaps any zombie children not already collected by an owning `PtyHandle`'s
/// `waitpid(child, None)` call, so a long-running server doesn't accumulate
/// defunct processes (SPEC_FULL §2.5 "zombie reaping"). Best-effort: drains
/// every reapable child, stopping at the first "nothing left" result.
pub fn reap_zombies() {
    loop {
        match nix::sys::wait::waitpid(None::<nix::unistd::Pid>, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
            Ok(nix::sys::wait::WaitStatus::StillAlive) | Err(_) => break,
            Ok(nix::sys::wait::WaitStatus::Exited(pid, _) | nix::sys::wait::WaitStatus::Signaled(pid, _, _)) => {
                info!(pid = pid.as_raw(), "reaped zombie child");
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, Arc<SessionManager>) {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = SessionManager::new(dir.path().to_path_buf());
        (dir, manager)
    }

    #[test]
    fn create_list_and_cleanup_round_trip() {
        let (_dir, manager) = manager();
        let id = manager
            .create(CreateOptions {
                command: vec!["echo".to_string(), "hi".to_string()],
                working_dir: "/tmp".to_string(),
                name: None,
                term: "xterm-256color".to_string(),
                cols: 80,
                rows: 24,
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let info = manager.get(&id).unwrap();
            if info.status == SessionStatus::Exited {
                assert_eq!(info.exit_code, Some(0));
                break;
            }
            assert!(Instant::now() < deadline, "session never exited");
            std::thread::sleep(Duration::from_millis(50));
        }

        assert!(manager.list().unwrap().contains_key(&id));
        manager.cleanup(&id).unwrap();
        assert!(matches!(manager.get(&id), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn create_rejects_empty_command() {
        let (_dir, manager) = manager();
        let result = manager.create(CreateOptions {
            command: vec![],
            working_dir: "/tmp".to_string(),
            name: None,
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        });
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }

    #[test]
    fn resize_is_noop_on_unchanged_dimensions() {
        let (_dir, manager) = manager();
        let id = manager
            .create(CreateOptions {
                command: vec!["cat".to_string()],
                working_dir: "/tmp".to_string(),
                name: None,
                term: "xterm-256color".to_string(),
                cols: 80,
                rows: 24,
            })
            .unwrap();
        manager.resize(&id, 80, 24).unwrap();
        manager.kill(&id).unwrap();
    }

    #[test]
    fn resize_rejects_exited_session_with_conflict() {
        let (_dir, manager) = manager();
        let id = manager
            .create(CreateOptions {
                command: vec!["true".to_string()],
                working_dir: "/tmp".to_string(),
                name: None,
                term: "xterm-256color".to_string(),
                cols: 80,
                rows: 24,
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while manager.get(&id).unwrap().status != SessionStatus::Exited {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(50));
        }

        let result = manager.resize(&id, 100, 30);
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn cleanup_refuses_while_running() {
        let (_dir, manager) = manager();
        let id = manager
            .create(CreateOptions {
                command: vec!["sleep".to_string(), "5".to_string()],
                working_dir: "/tmp".to_string(),
                name: None,
                term: "xterm-256color".to_string(),
                cols: 80,
                rows: 24,
            })
            .unwrap();
        let result = manager.cleanup(&id);
        assert!(matches!(result, Err(CoreError::Conflict(_))));
        manager.kill(&id).unwrap();
    }

    #[test]
    fn key_to_bytes_maps_known_names() {
        assert_eq!(key_to_bytes("enter"), Some(&b"\r"[..]));
        assert_eq!(key_to_bytes("unknown_key"), None);
    }

    #[test]
    fn reap_zombies_does_not_panic_with_no_children() {
        reap_zombies();
    }
}
