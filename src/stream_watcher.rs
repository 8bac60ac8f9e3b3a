//! Stream watcher (§4.5): tails a session's `stream-out` file and fans text
//! events out to N SSE subscribers, replaying history with per-client
//! timestamp rebasing and periodic heartbeats.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use crate::protocol::AsciinemaHeader;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One rendered SSE payload, pre-serialized as the `data:` line contents.
#[derive(Debug, Clone)]
pub enum SseEvent {
    /// The asciinema header, forwarded verbatim as the first event.
    Header(String),
    /// `{type:"o", timestamp, text}`.
    Output(String),
    /// `{type:"e", code, timestamp}`; the sender closes after this.
    Exit(String),
    /// `:heartbeat` comment line.
    Heartbeat,
}

/// A single attached client's bounded mailbox. If it fills, the event is
/// dropped for that client only (§4.5 per-client rules).
pub struct ClientSender {
    tx: SyncSender<SseEvent>,
}

impl ClientSender {
    pub fn send(&self, event: SseEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            warn!("client channel full, dropping event for this client");
        }
    }
}

struct Session {
    clients: HashMap<u64, ClientSender>,
    next_client_id: u64,
    /// Byte offset into `stream-out` the tailing thread has consumed so
    /// far; a newly attaching client replays everything before this offset
    /// directly, then joins the broadcast set for everything after.
    tailed_offset: u64,
}

/// Per-session file watcher registry; one entry exists only while at least
/// one client is attached (§4.5).
///
/// Each session's state lives behind its own `Mutex`, separate from the
/// registry-wide map lock, so that attaching a client to one session can
/// hold its lock across the (file-reading) replay without blocking
/// `broadcast` for every other session.
pub struct StreamWatcherRegistry {
    control_root: PathBuf,
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl StreamWatcherRegistry {
    #[must_use]
    pub fn new(control_root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            control_root,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn session_handle(&self, session_id: &str) -> (bool, Arc<Mutex<Session>>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let is_new = !sessions.contains_key(session_id);
        let handle = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Session {
                    clients: HashMap::new(),
                    next_client_id: 0,
                    tailed_offset: 0,
                }))
            })
            .clone();
        (is_new, handle)
    }

    /// Attaches a new client to `session_id`. Replays the portion of
    /// `stream-out` already consumed by the tailing thread with rebased
    /// timestamps (so the replay cannot produce a backward jump relative to
    /// the client's "now"), starts the tailing thread if this is the first
    /// subscriber, and returns a receiver the HTTP handler drains to write
    /// SSE frames.
    ///
    /// Registration and replay happen under the same per-session lock that
    /// `broadcast` takes, so the tailing thread cannot deliver a live event
    /// to this client until its historical replay has fully landed in its
    /// channel (§4.5: replay must precede any subsequent live event).
    pub fn attach(self: &Arc<Self>, session_id: &str) -> (u64, Receiver<SseEvent>) {
        let (tx, rx) = sync_channel(256);
        let sender = ClientSender { tx };

        let (is_new, handle) = self.session_handle(session_id);
        let client_id = {
            let mut entry = handle.lock().unwrap_or_else(|e| e.into_inner());
            let client_id = entry.next_client_id;
            entry.next_client_id += 1;
            let replay_upto = entry.tailed_offset;
            entry.clients.insert(client_id, ClientSender { tx: sender.tx.clone() });

            replay_history(&self.control_root.join(session_id).join(crate::control_dir::STREAM_OUT), replay_upto, &sender);
            client_id
        };

        if is_new {
            let this = Arc::clone(self);
            let session_id = session_id.to_string();
            std::thread::spawn(move || this.tail_loop(&session_id));
        }

        (client_id, rx)
    }

    /// Detaches a client; once a session has no clients left its tailing
    /// thread notices on its next iteration and exits.
    pub fn detach(&self, session_id: &str, client_id: u64) {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = sessions.get(session_id) {
            handle.lock().unwrap_or_else(|e| e.into_inner()).clients.remove(&client_id);
        }
    }

    /// Drops every attached client's sender, which closes their channel and
    /// unblocks the SSE handler's `recv` loop with a disconnect. Used during
    /// process shutdown to close client streams before killing sessions
    /// (§5 drain order).
    pub fn close_all(&self) {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        for handle in sessions.values() {
            handle.lock().unwrap_or_else(|e| e.into_inner()).clients.clear();
        }
    }

    fn broadcast(&self, session_id: &str, event: &SseEvent, advance_by: u64) {
        let handle = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            let Some(handle) = sessions.get(session_id) else {
                return;
            };
            handle.clone()
        };
        let mut entry = handle.lock().unwrap_or_else(|e| e.into_inner());
        entry.tailed_offset += advance_by;
        for client in entry.clients.values() {
            client.send(event.clone());
        }
    }

    fn has_clients(&self, session_id: &str) -> bool {
        let handle = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            let Some(handle) = sessions.get(session_id) else {
                return false;
            };
            handle.clone()
        };
        !handle.lock().unwrap_or_else(|e| e.into_inner()).clients.is_empty()
    }

    /// Tails new lines appended to `stream-out` from wherever the last
    /// client attachment left off, broadcasting to every attached client
    /// and sending heartbeats on the configured interval. Exits once the
    /// session has no attached clients.
    fn tail_loop(self: Arc<Self>, session_id: &str) {
        let path = self.control_root.join(session_id).join(crate::control_dir::STREAM_OUT);
        let Ok(file) = File::open(&path) else {
            return;
        };
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut last_heartbeat = std::time::Instant::now();

        let (watch_tx, watch_rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = watch_tx.send(res);
        }) {
            Ok(w) => w,
            Err(_) => return,
        };
        let _ = watcher.watch(&path, RecursiveMode::NonRecursive);

        loop {
            if !self.has_clients(session_id) {
                break;
            }

            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    let _ = watch_rx.recv_timeout(Duration::from_millis(250));
                }
                Ok(n) => {
                    if let Some(event) = render_line(line.trim_end()) {
                        let is_exit = matches!(event, SseEvent::Exit(_));
                        self.broadcast(session_id, &event, n as u64);
                        if is_exit {
                            break;
                        }
                    } else {
                        self.broadcast(session_id, &SseEvent::Header(line.trim_end().to_string()), n as u64);
                    }
                }
                Err(_) => break,
            }

            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                self.broadcast(session_id, &SseEvent::Heartbeat, 0);
                last_heartbeat = std::time::Instant::now();
            }
        }

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }
}

/// Renders an output/exit JSON line into its SSE payload. Returns `None` for
/// the header line (callers special-case it since it has no `type` tag).
fn render_line(trimmed: &str) -> Option<SseEvent> {
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    if !value.is_array() {
        return None;
    }
    if value.get(0) == Some(&serde_json::Value::String("exit".to_string())) {
        let rendered = serde_json::json!({
            "type": "e",
            "code": value.get(1),
            "timestamp": value.get(2),
        });
        return Some(SseEvent::Exit(rendered.to_string()));
    }
    let rendered = serde_json::json!({
        "type": "o",
        "timestamp": value.get(0),
        "text": value.get(2),
    });
    Some(SseEvent::Output(rendered.to_string()))
}

/// Replays the first `upto` bytes of `stream-out` to a single newly
/// attached client, rebasing every event's timestamp to a monotonically
/// increasing synthetic sequence so replay never appears to jump backward
/// relative to the client's "now" (§4.5 "rebasing timestamps").
fn replay_history(path: &std::path::Path, upto: u64, sender: &ClientSender) {
    let Ok(mut file) = File::open(path) else {
        return;
    };
    let mut buf = vec![0u8; upto as usize];
    if file.read_exact(&mut buf).is_err() {
        let _ = file.seek(SeekFrom::Start(0));
        buf.clear();
        let _ = file.read_to_end(&mut buf);
    }
    let content = String::from_utf8_lossy(&buf);
    let mut rebased_time = 0.0_f64;
    let mut header_sent = false;

    for line in content.lines() {
        if !header_sent {
            header_sent = true;
            sender.send(SseEvent::Header(line.to_string()));
            continue;
        }
        let Some(event) = render_line(line) else {
            continue;
        };
        rebased_time += 0.001;
        let rebased = match event {
            SseEvent::Output(json) => {
                SseEvent::Output(rebase_timestamp(&json, rebased_time))
            }
            other => other,
        };
        sender.send(rebased);
    }
}

fn rebase_timestamp(json: &str, timestamp: f64) -> String {
    serde_json::from_str::<serde_json::Value>(json).map_or_else(
        |_| json.to_string(),
        |mut value| {
            value["timestamp"] = serde_json::json!(timestamp);
            value.to_string()
        },
    )
}

/// Parses the asciinema header line; used to answer the header-replay
/// requirement for late joiners without re-reading the file.
pub fn parse_header(line: &str) -> Option<AsciinemaHeader> {
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_detach_manage_client_set() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("s1")).unwrap();
        std::fs::write(
            root.path().join("s1").join("stream-out"),
            "{\"version\":2,\"width\":80,\"height\":24,\"timestamp\":0,\"env\":{}}\n",
        )
        .unwrap();

        let registry = StreamWatcherRegistry::new(root.path().to_path_buf());
        let (client_id, _rx) = registry.attach("s1");
        assert!(registry.has_clients("s1"));
        registry.detach("s1", client_id);
    }

    #[test]
    fn parse_header_reads_known_fields() {
        let header =
            parse_header("{\"version\":2,\"width\":80,\"height\":24,\"timestamp\":0,\"env\":{}}")
                .unwrap();
        assert_eq!(header.width, 80);
    }

    #[test]
    fn late_joiner_replays_existing_history() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("s1")).unwrap();
        std::fs::write(
            root.path().join("s1").join("stream-out"),
            "{\"version\":2,\"width\":80,\"height\":24,\"timestamp\":0,\"env\":{}}\n\
             [0.1,\"o\",\"hi\"]\n",
        )
        .unwrap();

        let registry = StreamWatcherRegistry::new(root.path().to_path_buf());
        let stream_len = std::fs::metadata(root.path().join("s1").join("stream-out"))
            .unwrap()
            .len();
        registry
            .sessions
            .lock()
            .unwrap()
            .entry("s1".to_string())
            .or_insert_with(|| Session {
                clients: HashMap::new(),
                next_client_id: 0,
                tailed_offset: stream_len,
            });

        let (_id, rx) = registry.attach("s1");
        let first = rx.recv_timeout(Duration::from_millis(200)).unwrap();
        assert!(matches!(first, SseEvent::Header(_)));
        let second = rx.recv_timeout(Duration::from_millis(200)).unwrap();
        assert!(matches!(second, SseEvent::Output(_)));
    }
}
