//! The data model of §3: session metadata, the asciinema recording format,
//! and the compact binary buffer-snapshot encoding.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{CoreError, Result};

pub const DEFAULT_TERM: &str = "xterm-256color";
pub const MAX_DIMENSION: u16 = 1000;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpawnType {
    Pty,
    External,
}

/// Session metadata persisted at `<id>/session.json` (§6). Field names are
/// the on-disk keys the control directory has always used.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionInfo {
    pub cmdline: Vec<String>,
    pub name: String,
    pub cwd: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    pub term: String,
    pub spawn_type: SpawnType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub cols: u16,
    pub rows: u16,
}

impl SessionInfo {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new_starting(
        cmdline: Vec<String>,
        name: String,
        cwd: String,
        term: String,
        cols: u16,
        rows: u16,
        spawn_type: SpawnType,
        control_path: Option<String>,
    ) -> Self {
        Self {
            cmdline,
            name,
            cwd,
            status: SessionStatus::Starting,
            started_at: Some(Timestamp::now()),
            term,
            spawn_type,
            pid: None,
            control_path,
            exit_code: None,
            cols,
            rows,
        }
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.status, SessionStatus::Running | SessionStatus::Starting)
    }
}

/// Validates `cols`/`rows` against the §3 invariant `1 <= cols,rows <= 1000`.
pub fn validate_dimensions(cols: u16, rows: u16) -> Result<()> {
    if cols == 0 || rows == 0 || cols > MAX_DIMENSION || rows > MAX_DIMENSION {
        return Err(CoreError::InvalidArgument(format!(
            "dimensions out of range: {cols}x{rows} (must be 1..={MAX_DIMENSION})"
        )));
    }
    Ok(())
}

/// Writes `value` to `path` via temp-file-then-rename, the technique used
/// everywhere `session.json` is updated (§3 "updates are serialized by
/// atomic rename").
pub fn write_atomic_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(CoreError::from)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_file = NamedTempFile::new_in(parent)?;
    std::fs::write(temp_file.path(), json)?;
    temp_file.persist(path).map_err(|e| CoreError::Io(e.error))?;
    Ok(())
}

pub fn read_session_info(path: &Path) -> Result<SessionInfo> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(CoreError::from)
}

/// Applies `mutate` to the session at `path` and writes the result back
/// atomically. Used for status/exit-code/pid/resize updates so every write
/// goes through the same read-modify-write-atomic-rename path.
pub fn update_session_info<F>(path: &Path, mutate: F) -> Result<SessionInfo>
where
    F: FnOnce(&mut SessionInfo),
{
    let mut info = read_session_info(path)?;
    mutate(&mut info);
    write_atomic_json(path, &info)?;
    Ok(info)
}

// --- asciinema v2 recording (§4.3, §6) ---------------------------------

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AsciinemaHeader {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub enum AsciinemaEventType {
    Output,
    Input,
    Marker,
    Resize,
}

impl AsciinemaEventType {
    const fn code(self) -> &'static str {
        match self {
            Self::Output => "o",
            Self::Input => "i",
            Self::Marker => "m",
            Self::Resize => "r",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsciinemaEvent {
    pub time: f64,
    pub event_type: AsciinemaEventType,
    pub data: String,
}

/// Appends lines to a session's `stream-out` file. The header is written
/// once, synchronously, during `Create` (§4.3); one writer by construction.
pub struct StreamWriter {
    file: File,
    start: std::time::Instant,
}

impl StreamWriter {
    pub fn with_params(
        file: File,
        cols: u32,
        rows: u32,
        command: Option<String>,
        title: Option<String>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut file = file;
        let header = AsciinemaHeader {
            version: 2,
            width: cols,
            height: rows,
            timestamp: u64::try_from(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            )
            .unwrap_or(0),
            command,
            title,
            env: env.unwrap_or_default(),
        };
        writeln!(file, "{}", serde_json::to_string(&header).map_err(CoreError::from)?)?;
        file.flush()?;
        Ok(Self {
            file,
            start: std::time::Instant::now(),
        })
    }

    #[must_use]
    pub fn elapsed_time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Appends an `[t, "o", text]` output event. Per §4.3, write failures do
    /// not abort the supervisor; callers log and continue.
    pub fn write_output(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_event(AsciinemaEvent {
            time: self.elapsed_time(),
            event_type: AsciinemaEventType::Output,
            data: String::from_utf8_lossy(bytes).into_owned(),
        })
    }

    pub fn write_event(&mut self, event: AsciinemaEvent) -> Result<()> {
        let array = serde_json::json!([event.time, event.event_type.code(), event.data]);
        self.write_raw_json(&array)
    }

    pub fn write_raw_json(&mut self, value: &serde_json::Value) -> Result<()> {
        writeln!(self.file, "{}", serde_json::to_string(value).map_err(CoreError::from)?)?;
        self.file.flush()?;
        Ok(())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

// --- notification stream (§2.5 supplemental) ---------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub timestamp: Timestamp,
    pub event: String,
    pub data: serde_json::Value,
}

pub struct NotificationWriter {
    file: File,
}

impl NotificationWriter {
    #[must_use]
    pub const fn new(file: File) -> Self {
        Self { file }
    }

    pub fn write_notification(&mut self, event: NotificationEvent) -> Result<()> {
        writeln!(self.file, "{}", serde_json::to_string(&event).map_err(CoreError::from)?)?;
        self.file.flush()?;
        Ok(())
    }
}

// --- terminal buffer snapshot (§3, §6) ---------------------------------

pub const BUFFER_MAGIC: u8 = 0xBF;

#[derive(Debug, Clone)]
pub struct CellRun {
    pub text: char,
    pub len: u32,
    pub fg: u8,
    pub bg: u8,
    pub bold: bool,
}

#[derive(Debug, Clone)]
pub struct BufferSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub viewport_y: i32,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub rows_runs: Vec<Vec<CellRun>>,
}

impl BufferSnapshot {
    /// Encodes `{cols, rows, viewportY, cursorX, cursorY}` followed by cell
    /// runs (§3). This is the payload carried inside the WebSocket binary
    /// frame and returned verbatim by `GET /sessions/:id/buffer`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.cols.to_le_bytes());
        out.extend_from_slice(&self.rows.to_le_bytes());
        out.extend_from_slice(&self.viewport_y.to_le_bytes());
        out.extend_from_slice(&self.cursor_x.to_le_bytes());
        out.extend_from_slice(&self.cursor_y.to_le_bytes());
        for row in &self.rows_runs {
            out.extend_from_slice(&u32::try_from(row.len()).unwrap_or(0).to_le_bytes());
            for run in row {
                let mut buf = [0u8; 4];
                let s = run.text.encode_utf8(&mut buf);
                out.push(u8::try_from(s.len()).unwrap_or(1));
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(&run.len.to_le_bytes());
                out.push(run.fg);
                out.push(run.bg);
                out.push(u8::from(run.bold));
            }
        }
        out
    }
}

/// Wraps a session id and its buffer snapshot into the WebSocket binary
/// frame format of §6: `0xBF | u32-LE len | id bytes | snapshot bytes`.
#[must_use]
pub fn encode_buffer_frame(session_id: &str, snapshot: &[u8]) -> Vec<u8> {
    let id_bytes = session_id.as_bytes();
    let mut out = Vec::with_capacity(1 + 4 + id_bytes.len() + snapshot.len());
    out.push(BUFFER_MAGIC);
    out.extend_from_slice(&u32::try_from(id_bytes.len()).unwrap_or(0).to_le_bytes());
    out.extend_from_slice(id_bytes);
    out.extend_from_slice(snapshot);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_dimensions_rejects_zero_and_oversize() {
        assert!(validate_dimensions(80, 24).is_ok());
        assert!(validate_dimensions(0, 24).is_err());
        assert!(validate_dimensions(80, 0).is_err());
        assert!(validate_dimensions(1001, 24).is_err());
        assert!(validate_dimensions(1000, 1000).is_ok());
    }

    #[test]
    fn buffer_frame_has_magic_and_length_prefix() {
        let frame = encode_buffer_frame("abc", &[1, 2, 3]);
        assert_eq!(frame[0], BUFFER_MAGIC);
        let len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
        assert_eq!(len, 3);
        assert_eq!(&frame[5..8], b"abc");
        assert_eq!(&frame[8..], &[1, 2, 3]);
    }

    #[test]
    fn stream_writer_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stream-out");
        let file = File::options().create(true).truncate(true).write(true).open(&path).unwrap();
        let mut writer = StreamWriter::with_params(
            file,
            80,
            24,
            Some("cat".to_string()),
            None,
            None,
        )
        .unwrap();
        writer.write_output(b"hello\n").unwrap();
        writer
            .write_raw_json(&serde_json::json!(["exit", 0, "sess-1"]))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        let header: AsciinemaHeader = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.width, 80);

        let output: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(output[1], "o");
        assert_eq!(output[2], "hello\n");

        let exit: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(exit[0], "exit");
        assert_eq!(exit[1], 0);
        assert_eq!(exit[2], "sess-1");
    }

    #[test]
    fn session_info_round_trips_through_json() {
        let info = SessionInfo::new_starting(
            vec!["cat".to_string()],
            "cat".to_string(),
            "/tmp".to_string(),
            DEFAULT_TERM.to_string(),
            80,
            24,
            SpawnType::Pty,
            None,
        );
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"status\":\"starting\""));
        let back: SessionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cmdline, vec!["cat".to_string()]);
        assert_eq!(back.cols, 80);
    }
}
