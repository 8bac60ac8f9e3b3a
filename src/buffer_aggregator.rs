//! Buffer aggregator (§4.6): the `/buffers` WebSocket endpoint. Clients
//! subscribe/unsubscribe to many sessions over one connection; the
//! aggregator pushes binary buffer-snapshot frames and enforces
//! per-connection backpressure.

use std::collections::HashSet;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use tungstenite::{Message, WebSocket};

use crate::protocol::encode_buffer_frame;
use crate::sessions::SessionManager;

/// Once a connection's outstanding write volume would exceed this many
/// bytes, the aggregator skips enqueueing the next snapshot for it rather
/// than blocking (§4.6 "bufferedAmount" equivalent; snapshots are
/// idempotent so skipping is safe).
pub const BACKPRESSURE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlFrame {
    Subscribe { #[serde(rename = "sessionId")] session_id: String },
    Unsubscribe { #[serde(rename = "sessionId")] session_id: String },
    Ping,
}

/// Drives one already-upgraded WebSocket connection to completion. The
/// upgrade handshake itself is done by the HTTP layer (§4.1 — this server
/// owns the raw TCP parsing, so the handshake response is written once by
/// `HttpRequest::upgrade_to_websocket` rather than re-read here). Runs
/// synchronously on the thread the `/buffers` handler dedicates to this
/// connection, consistent with the rest of this server's thread-per-
/// connection model (no async runtime is introduced).
pub fn serve_connection(mut socket: WebSocket<TcpStream>, sessions: Arc<SessionManager>) {
    let _ = socket.get_ref().set_read_timeout(Some(Duration::from_millis(100)));

    let cache = Arc::clone(&sessions.emulators);
    let subscriptions: Mutex<HashSet<String>> = Mutex::new(HashSet::new());

    loop {
        match socket.read() {
            Ok(Message::Text(text)) => {
                if let Ok(frame) = serde_json::from_str::<ControlFrame>(&text) {
                    handle_control_frame(frame, &mut socket, &subscriptions, &sessions);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // No control frame arrived within the poll window; fall
                // through to pushing any dirty snapshots below.
            }
            Err(_) => break,
        }

        let ids: Vec<String> = subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();

        let mut round_bytes = 0usize;
        for id in ids {
            if !cache.should_notify_dirty(&id) {
                continue;
            }
            let Some(snapshot) = cache.snapshot(&id) else {
                continue;
            };
            let frame = encode_buffer_frame(&id, &snapshot.encode());

            if round_bytes + frame.len() > BACKPRESSURE_BYTES {
                debug!(session_id = %id, "skipping snapshot, connection backlogged");
                continue;
            }
            round_bytes += frame.len();
            if socket.send(Message::Binary(frame)).is_err() {
                return;
            }
        }
    }

    for id in subscriptions.lock().unwrap_or_else(|e| e.into_inner()).drain() {
        cache.unsubscribe(&id);
    }
}

fn handle_control_frame(
    frame: ControlFrame,
    socket: &mut WebSocket<TcpStream>,
    subscriptions: &Mutex<HashSet<String>>,
    sessions: &Arc<SessionManager>,
) {
    match frame {
        ControlFrame::Subscribe { session_id } => {
            let Ok(info) = sessions.get(&session_id) else {
                let _ = socket.send(Message::Text(
                    serde_json::json!({
                        "type": "error",
                        "sessionId": session_id,
                        "message": "session not found",
                    })
                    .to_string(),
                ));
                return;
            };
            let mut subs = subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            if subs.insert(session_id.clone()) {
                // Each (connection, sessionId) pair maps to exactly one
                // subscription; duplicate subscribes are no-ops (§4.6).
                sessions.emulators.subscribe(&session_id, info.cols, info.rows);
                drop(subs);
                // Testable property 7: the first frame after a subscribe is
                // a valid snapshot whose dimensions equal the session's
                // current cols/rows — sent immediately rather than waiting
                // for the next dirty-coalesce tick.
                let snapshot = sessions.emulators.snapshot_or_init(&session_id, info.cols, info.rows);
                let frame = encode_buffer_frame(&session_id, &snapshot.encode());
                let _ = socket.send(Message::Binary(frame));
            }
        }
        ControlFrame::Unsubscribe { session_id } => {
            let mut subs = subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            if subs.remove(&session_id) {
                sessions.emulators.unsubscribe(&session_id);
            }
        }
        ControlFrame::Ping => {
            let _ = socket.send(Message::Text(r#"{"type":"pong"}"#.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_parses_subscribe() {
        let frame: ControlFrame =
            serde_json::from_str(r#"{"type":"subscribe","sessionId":"abc"}"#).unwrap();
        assert!(matches!(frame, ControlFrame::Subscribe { session_id } if session_id == "abc"));
    }

    #[test]
    fn control_frame_parses_ping() {
        let frame: ControlFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ControlFrame::Ping));
    }
}
