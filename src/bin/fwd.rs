//! `vibetunnel-fwd`: the forwarding CLI (§4.10). Wraps an arbitrary command
//! under a PTY from an already-interactive shell, recording it into a
//! well-formed control-directory session that the server can later adopt
//! (§3 "externally-adopted sessions"), or attaches to watch one that
//! already exists with `--monitor-only`.
//!
//! Usage: `vibetunnel-fwd [--session-id <uuid>] [--monitor-only] -- <command...>`
//!
//! Exit codes: 0 on a clean run, the wrapped command's own exit code when it
//! ran, 2 on a CLI argument error (§4.10, §6).

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use nix::sys::signal::Signal;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use signal_hook::consts::SIGWINCH;
use std::os::unix::fs::OpenOptionsExt;
use uuid::Uuid;
use vibetunnel_core::config::Config;
use vibetunnel_core::control_dir::{self, control_fifo_path, session_json_path, stdin_fifo_path, stream_out_path};
use vibetunnel_core::protocol::{self, SessionInfo, SessionStatus, SpawnType, StreamWriter};
use vibetunnel_core::tty_spawn::{self, PtyHandle};

const EXIT_ARGUMENT_ERROR: i32 = 2;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    init_tracing();
    std::process::exit(run());
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut session_id = None::<String>;
    let mut monitor_only = false;
    let mut command = Vec::<String>::new();
    let mut idx = 0;

    while idx < args.len() {
        match args[idx].as_str() {
            "--session-id" => {
                idx += 1;
                let Some(value) = args.get(idx) else {
                    eprintln!("--session-id requires a value");
                    return EXIT_ARGUMENT_ERROR;
                };
                session_id = Some(value.clone());
            }
            "--monitor-only" => monitor_only = true,
            "--" => {
                command = args[idx + 1..].to_vec();
                break;
            }
            other => {
                eprintln!("unrecognized argument: {other}");
                return EXIT_ARGUMENT_ERROR;
            }
        }
        idx += 1;
    }

    let control_root = Config::default_control_dir();

    if monitor_only {
        let Some(id) = session_id else {
            eprintln!("--monitor-only requires --session-id <uuid>");
            return EXIT_ARGUMENT_ERROR;
        };
        return monitor(&control_root, &id);
    }

    if command.is_empty() {
        eprintln!("usage: vibetunnel-fwd [--session-id <uuid>] [--monitor-only] -- <command...>");
        return EXIT_ARGUMENT_ERROR;
    }

    let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    spawn_and_forward(&control_root, &id, &command)
}

fn spawn_and_forward(control_root: &Path, id: &str, command: &[String]) -> i32 {
    let Ok(cwd) = std::env::current_dir() else {
        eprintln!("unable to determine current directory");
        return EXIT_ARGUMENT_ERROR;
    };
    let term = std::env::var("TERM").unwrap_or_else(|_| protocol::DEFAULT_TERM.to_string());
    let (cols, rows) = terminal_size();

    if control_dir::create_session_dir(control_root, id).is_err() {
        eprintln!("unable to create session directory for {id}");
        return 1;
    }

    let info = SessionInfo::new_starting(
        command.to_vec(),
        command[0].rsplit('/').next().unwrap_or("session").to_string(),
        cwd.to_string_lossy().into_owned(),
        term.clone(),
        cols,
        rows,
        SpawnType::External,
        None,
    );
    if protocol::write_atomic_json(&session_json_path(control_root, id), &info).is_err() {
        eprintln!("unable to write session.json for {id}");
        return 1;
    }

    let stream_file = match std::fs::File::options().create(true).truncate(true).write(true).open(stream_out_path(control_root, id)) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("unable to open stream-out: {err}");
            return 1;
        }
    };
    let stream_writer = match StreamWriter::with_params(stream_file, u32::from(cols), u32::from(rows), Some(command.join(" ")), None, None) {
        Ok(writer) => writer,
        Err(err) => {
            eprintln!("unable to write recording header: {err}");
            return 1;
        }
    };

    // §4.1/§4.10: the stdin and control FIFOs are this session's only
    // externally-reachable input path once the server adopts it — a writer
    // (e.g. the HTTP `/input` or `/resize` routes relayed here) must find
    // something on the other end.
    if control_dir::mkfifo_atomic(&stdin_fifo_path(control_root, id)).is_err()
        || control_dir::mkfifo_atomic(&control_fifo_path(control_root, id)).is_err()
    {
        eprintln!("unable to create stdin/control fifos for {id}");
        return 1;
    }

    let raw_guard = enter_raw_mode();

    let (exit_tx, exit_rx) = mpsc::channel();
    let control_root_for_exit: PathBuf = control_root.to_path_buf();
    let id_for_exit = id.to_string();

    let handle = match tty_spawn::spawn(
        command,
        &cwd,
        &term,
        cols,
        rows,
        Some(stream_writer),
        |bytes| {
            let _ = std::io::stdout().write_all(bytes);
            let _ = std::io::stdout().flush();
        },
        move |code| {
            let path = session_json_path(&control_root_for_exit, &id_for_exit);
            let _ = protocol::update_session_info(&path, |info| {
                info.status = SessionStatus::Exited;
                info.exit_code = Some(code);
            });
            let _ = exit_tx.send(code);
        },
    ) {
        Ok(handle) => Arc::new(handle),
        Err(err) => {
            drop(raw_guard);
            eprintln!("failed to spawn command: {err}");
            return 1;
        }
    };

    let got_winch = Arc::new(AtomicBool::new(false));
    if atty::is(atty::Stream::Stdin) {
        signal_hook::flag::register(SIGWINCH, Arc::clone(&got_winch)).ok();
    }

    {
        let handle = Arc::clone(&handle);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match std::io::stdin().read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if handle.send_input(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    spawn_stdin_fifo_reader(stdin_fifo_path(control_root, id), Arc::clone(&handle));
    spawn_control_fifo_reader(control_fifo_path(control_root, id), Arc::clone(&handle));

    // Mirror the local terminal's own resizes into the forwarded PTY for as
    // long as the child runs, so a window drag while forwarding stays in sync.
    let code = loop {
        match exit_rx.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(code) => break code,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if got_winch.swap(false, Ordering::Relaxed) {
                    let (cols, rows) = terminal_size();
                    handle.request_resize(cols, rows);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break 1,
        }
    };
    drop(raw_guard);
    code
}

/// Attaches to an already-running (or already-exited) session without
/// spawning anything: forwards local stdin into its `stdin` FIFO and prints
/// the asciinema output events from `stream-out` to local stdout until the
/// recorded exit marker, then mirrors that exit code (§4.10).
fn monitor(control_root: &Path, id: &str) -> i32 {
    let path = session_json_path(control_root, id);
    if !path.exists() {
        eprintln!("no such session: {id}");
        return EXIT_ARGUMENT_ERROR;
    }

    {
        let stdin_path = stdin_fifo_path(control_root, id);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match std::io::stdin().read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = tty_spawn::write_to_external_stdin(&stdin_path, &buf[..n]);
                    }
                }
            }
        });
    }

    let Ok(file) = std::fs::File::open(stream_out_path(control_root, id)) else {
        eprintln!("unable to open recording for {id}");
        return 1;
    };
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut header_skipped = false;

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                if let Ok(info) = protocol::read_session_info(&session_json_path(control_root, id)) {
                    if info.status == SessionStatus::Exited {
                        return info.exit_code.unwrap_or(0);
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Ok(_) => {
                if !header_skipped {
                    header_skipped = true;
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim_end()) {
                    if value.get(0) == Some(&serde_json::Value::String("exit".to_string())) {
                        return value.get(1).and_then(serde_json::Value::as_i64).unwrap_or(0) as i32;
                    }
                    if let Some(text) = value.get(2).and_then(serde_json::Value::as_str) {
                        print!("{text}");
                        let _ = std::io::stdout().flush();
                    }
                }
            }
            Err(_) => return 1,
        }
    }
}

/// Feeds bytes written to the session's `stdin` FIFO into the forwarded
/// PTY, so a server that has adopted this session can type into it (§4.1,
/// §4.10). Opened non-blocking since nothing guarantees a writer ever shows
/// up; `Ok(0)`/`WouldBlock` both just mean "nothing to read yet".
fn spawn_stdin_fifo_reader(path: PathBuf, handle: Arc<PtyHandle>) {
    std::thread::spawn(move || {
        let Ok(mut file) = std::fs::File::options()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&path)
        else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            match file.read(&mut buf) {
                Ok(0) => std::thread::sleep(std::time::Duration::from_millis(100)),
                Ok(n) => {
                    let _ = handle.send_input(&buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(_) => break,
            }
        }
    });
}

/// Reads newline-delimited JSON control messages from the session's
/// `control` FIFO and applies them — `{"cmd":"resize",...}` and
/// `{"cmd":"kill",...}` (§6). Unknown commands are ignored per §4.1.
fn spawn_control_fifo_reader(path: PathBuf, handle: Arc<PtyHandle>) {
    std::thread::spawn(move || {
        let Ok(file) = std::fs::File::options()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&path)
        else {
            return;
        };
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => std::thread::sleep(std::time::Duration::from_millis(100)),
                Ok(_) => apply_control_message(&handle, line.trim_end()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(_) => break,
            }
        }
    });
}

fn apply_control_message(handle: &PtyHandle, line: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return;
    };
    match value.get("cmd").and_then(serde_json::Value::as_str) {
        Some("resize") => {
            let cols = value.get("cols").and_then(serde_json::Value::as_u64);
            let rows = value.get("rows").and_then(serde_json::Value::as_u64);
            if let (Some(cols), Some(rows)) = (cols, rows) {
                handle.request_resize(cols as u16, rows as u16);
            }
        }
        Some("kill") => {
            let signal = match value.get("signal").and_then(serde_json::Value::as_str) {
                Some("SIGKILL") => Signal::SIGKILL,
                Some("SIGINT") => Signal::SIGINT,
                _ => Signal::SIGTERM,
            };
            let _ = handle.signal(signal);
        }
        other => {
            tracing::warn!(cmd = ?other, "unknown control command, ignoring");
        }
    }
}

/// Reads the controlling terminal's size via `TIOCGWINSZ`, falling back to
/// 80x24 when stdin is not a TTY.
fn terminal_size() -> (u16, u16) {
    nix::ioctl_read_bad!(get_window_size, nix::libc::TIOCGWINSZ, nix::pty::Winsize);
    let mut winsize = nix::pty::Winsize {
        ws_row: 24,
        ws_col: 80,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    if unsafe { get_window_size(0, &mut winsize) }.is_ok() && winsize.ws_col > 0 && winsize.ws_row > 0 {
        (winsize.ws_col, winsize.ws_row)
    } else {
        (80, 24)
    }
}

struct RawModeGuard {
    original: Option<nix::sys::termios::Termios>,
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            let _ = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &original);
        }
    }
}

/// Puts the local terminal into raw mode for the duration of the forwarded
/// command, restoring it on drop; a no-op when stdin is not a TTY.
fn enter_raw_mode() -> RawModeGuard {
    let Ok(original) = tcgetattr(std::io::stdin()) else {
        return RawModeGuard { original: None };
    };
    let mut raw = original.clone();
    cfmakeraw(&mut raw);
    let _ = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &raw);
    RawModeGuard {
        original: Some(original),
    }
}
