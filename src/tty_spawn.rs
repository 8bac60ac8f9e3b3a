//! PTY supervisor (§4.2): spawns a child under a pseudo-terminal, pumps
//! bidirectional I/O with flow control, applies resize/kill, and detects
//! exit.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
use nix::libc::login_tty;
use nix::libc::TIOCSWINSZ;
#[cfg(target_os = "linux")]
const TIOCSCTTY: u64 = 0x540E;
use nix::pty::{openpty, Winsize};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, read, setsid, write, ForkResult, Pid};
use tracing::{error, info, info_span, warn};

use crate::error::{CoreError, Result};
use crate::input_queue::InputQueue;
use crate::protocol::StreamWriter;

/// Cross-platform `login_tty`: native on BSD-family systems, hand-rolled on
/// Linux via `setsid` + `TIOCSCTTY` + `dup2`.
///
/// # Safety
/// Must run in the forked child before it has any other threads.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
unsafe fn login_tty_compat(fd: i32) -> io::Result<()> {
    if login_tty(fd) == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
unsafe fn login_tty_compat(fd: i32) -> io::Result<()> {
    if libc::setsid() == -1 {
        return Err(io::Error::last_os_error());
    }
    #[cfg(target_os = "linux")]
    let ioctl_cmd = TIOCSCTTY as libc::c_ulong;
    #[cfg(not(target_os = "linux"))]
    let ioctl_cmd = libc::TIOCSCTTY as libc::c_ulong;

    if libc::ioctl(fd, ioctl_cmd, 0) == -1 && libc::ioctl(fd, ioctl_cmd, 1) == -1 {
        return Err(io::Error::last_os_error());
    }
    for target in 0..=2 {
        if libc::dup2(fd, target) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    if fd > 2 {
        libc::close(fd);
    }
    Ok(())
}

/// Everything the supervisor keeps in memory for one owned ("pty") session,
/// shared between the HTTP handlers and the background I/O thread.
pub struct PtyHandle {
    /// Kept alive so the master fd doesn't close out from under the I/O
    /// thread's own `dup`'d copy; never read directly.
    #[allow(dead_code)]
    master: OwnedFd,
    pub child: Pid,
    input_queue: Arc<Mutex<InputQueue>>,
    resize_request: Arc<Mutex<Option<(u16, u16)>>>,
    exited: Arc<AtomicBool>,
    exit_code: Arc<AtomicI32>,
}

impl PtyHandle {
    /// Queues `data` for the PTY's I/O thread to write; chunked and bounded
    /// per §4.2/§9.
    pub fn send_input(&self, data: &[u8]) -> Result<crate::input_queue::Admission> {
        let mut queue = self.input_queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(data).map_err(|()| CoreError::Backpressure)
    }

    /// Records a pending resize; applied by the I/O thread on its next
    /// iteration via `TIOCSWINSZ`.
    pub fn request_resize(&self, cols: u16, rows: u16) {
        *self.resize_request.lock().unwrap_or_else(|e| e.into_inner()) = Some((cols, rows));
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.has_exited()
            .then(|| self.exit_code.load(Ordering::Acquire))
    }

    /// Sends `signal` to the child, escalating to `SIGKILL` is the caller's
    /// responsibility (§4.2 `Kill`).
    pub fn signal(&self, signal: Signal) -> Result<()> {
        kill(self.child, signal).or_else(|e| {
            if e == Errno::ESRCH {
                Ok(())
            } else {
                Err(CoreError::Io(e.into()))
            }
        })
    }
}

/// Opens a PTY sized `cols x rows` and forks the child, wiring stdin/stdout
/// through the slave end via `login_tty`. The parent's side returns a
/// [`PtyHandle`] and spawns the background communication thread; `on_output`
/// is invoked with each chunk read from the child (the recorder and
/// emulator cache are both driven from here, per §2 "Data flow"), and
/// `on_exit` once, when the child has exited.
pub fn spawn(
    command: &[String],
    cwd: &Path,
    term: &str,
    cols: u16,
    rows: u16,
    mut stream_writer: Option<StreamWriter>,
    on_output: impl Fn(&[u8]) + Send + 'static,
    on_exit: impl FnOnce(i32) + Send + 'static,
) -> Result<PtyHandle> {
    if command.is_empty() {
        return Err(CoreError::InvalidArgument("command must not be empty".to_string()));
    }

    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let term_attrs = tcgetattr(io::stdin()).ok();
    let pty = openpty(&Some(winsize), &term_attrs).map_err(|e| CoreError::Io(e.into()))?;

    match unsafe { fork() }.map_err(|e| CoreError::Io(e.into()))? {
        ForkResult::Parent { child } => {
            drop(pty.slave);
            let master = pty.master;
            let input_queue = Arc::new(Mutex::new(InputQueue::new()));
            let resize_request = Arc::new(Mutex::new(None));
            let exited = Arc::new(AtomicBool::new(false));
            let exit_code = Arc::new(AtomicI32::new(0));

            let thread_master = nix::unistd::dup(master.as_raw_fd())
                .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
                .map_err(|e| CoreError::Io(e.into()))?;

            let handle = PtyHandle {
                master,
                child,
                input_queue: Arc::clone(&input_queue),
                resize_request: Arc::clone(&resize_request),
                exited: Arc::clone(&exited),
                exit_code: Arc::clone(&exit_code),
            };

            std::thread::spawn(move || {
                let span = info_span!("pty_io", pid = child.as_raw());
                let _enter = span.enter();
                let code = communication_loop(
                    thread_master,
                    child,
                    &input_queue,
                    &resize_request,
                    stream_writer.as_mut(),
                    &on_output,
                );
                let code = match code {
                    Ok(code) => code,
                    Err(err) => {
                        error!(error = %err, "communication loop failed");
                        1
                    }
                };
                exit_code.store(code, Ordering::Release);
                exited.store(true, Ordering::Release);
                on_exit(code);
            });

            Ok(handle)
        }
        ForkResult::Child => {
            drop(pty.master);
            std::env::set_var("TERM", term);
            if std::env::set_current_dir(cwd).is_err() {
                std::process::exit(127);
            }
            let args = command
                .iter()
                .filter_map(|s| CString::new(s.as_bytes()).ok())
                .collect::<Vec<_>>();
            if args.is_empty() {
                std::process::exit(127);
            }

            if unsafe { login_tty_compat(pty.slave.into_raw_fd()) }.is_err() {
                std::process::exit(126);
            }

            match execvp(&args[0], &args) {
                Ok(never) => match never {},
                Err(_) => std::process::exit(127),
            }
        }
    }
}

#[allow(clippy::too_many_lines)]
fn communication_loop(
    master: OwnedFd,
    child: Pid,
    input_queue: &Arc<Mutex<InputQueue>>,
    resize_request: &Arc<Mutex<Option<(u16, u16)>>>,
    mut stream_writer: Option<&mut StreamWriter>,
    on_output: &(impl Fn(&[u8]) + Send + 'static),
) -> Result<i32> {
    let mut buf = [0u8; 4096];

    loop {
        if let Some((cols, rows)) = resize_request.lock().unwrap_or_else(|e| e.into_inner()).take() {
            apply_resize(master.as_fd(), cols, rows);
            if let Some(ref mut writer) = stream_writer {
                let _ = writer.write_event(crate::protocol::AsciinemaEvent {
                    time: writer.elapsed_time(),
                    event_type: crate::protocol::AsciinemaEventType::Resize,
                    data: format!("{cols}x{rows}"),
                });
            }
        }

        {
            let mut queue = input_queue.lock().unwrap_or_else(|e| e.into_inner());
            while let Some(chunk) = queue.pop() {
                if !chunk.is_empty() && write_all(master.as_fd(), &chunk).is_err() {
                    break;
                }
            }
        }

        let mut read_fds = FdSet::new();
        let mut timeout = TimeVal::new(0, 100_000);
        read_fds.insert(master.as_fd());

        match select(None, Some(&mut read_fds), None, None, Some(&mut timeout)) {
            Ok(0) => continue,
            Err(Errno::EINTR | Errno::EAGAIN) => continue,
            Ok(_) => {}
            Err(err) => return Err(CoreError::Io(err.into())),
        }

        if read_fds.contains(master.as_fd()) {
            match read(&master, &mut buf) {
                Ok(0) | Err(Errno::EIO) => break,
                Ok(n) => {
                    on_output(&buf[..n]);
                    if let Some(ref mut writer) = stream_writer {
                        if let Err(err) = writer.write_output(&buf[..n]) {
                            warn!(error = %err, "recorder write failed, continuing in memory");
                        }
                    }
                }
                Err(Errno::EAGAIN | Errno::EINTR) => {}
                Err(err) => return Err(CoreError::Io(err.into())),
            }
        }
    }

    let status = match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, status)) => status,
        Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
        Ok(_) | Err(_) => 1,
    };
    info!(pid = child.as_raw(), status, "child exited");
    Ok(status)
}

fn apply_resize(master: BorrowedFd, cols: u16, rows: u16) {
    nix::ioctl_write_ptr_bad!(set_window_size, TIOCSWINSZ, Winsize);
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let _ = unsafe { set_window_size(master.as_raw_fd(), &winsize) };
}

fn write_all(fd: BorrowedFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Non-blocking best-effort write used for the `stdin` FIFO of external
/// sessions (§4.2 `SendInput`): falls back to a direct blocking write if the
/// open fails in non-blocking mode (e.g. the target turned out not to be a
/// FIFO with a reader attached).
pub fn write_to_external_stdin(path: &PathBuf, data: &[u8]) -> Result<()> {
    use std::io::Write as _;
    let mut file = File::options()
        .write(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path)?;
    match file.write_all(data) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            let mut file = File::options().write(true).open(path)?;
            file.write_all(data)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn spawn_cat_echoes_input_and_reports_exit() {
        let (output_tx, output_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();

        let handle = spawn(
            &["cat".to_string()],
            Path::new("/tmp"),
            "xterm-256color",
            80,
            24,
            None,
            move |bytes| {
                let _ = output_tx.send(bytes.to_vec());
            },
            move |code| {
                let _ = exit_tx.send(code);
            },
        )
        .expect("spawn cat");

        handle.send_input(b"hello\n").unwrap();

        let mut collected = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !collected.windows(5).any(|w| w == b"hello") && std::time::Instant::now() < deadline
        {
            if let Ok(bytes) = output_rx.recv_timeout(std::time::Duration::from_millis(200)) {
                collected.extend(bytes);
            }
        }
        assert!(collected.windows(5).any(|w| w == b"hello"));

        handle.signal(Signal::SIGTERM).unwrap();
        let code = exit_rx
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("child should exit");
        assert!(code == 0 || code >= 128);
    }

    #[test]
    fn empty_command_is_rejected() {
        let result = spawn(
            &[],
            Path::new("/tmp"),
            "xterm-256color",
            80,
            24,
            None,
            |_| {},
            |_| {},
        );
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }
}
