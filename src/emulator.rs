//! Terminal emulator cache (§4.4): one `vt100::Parser` per subscribed
//! session, fed by the PTY supervisor's output callback, coalesced into at
//! most one dirty notification per interval, and snapshotted on demand into
//! the compact binary buffer encoding (§3, §6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::protocol::{BufferSnapshot, CellRun};

/// Coalescing window: at most one dirty notification per session per
/// interval (§4.4 "16-60ms").
pub const DIRTY_COALESCE: Duration = Duration::from_millis(32);

struct Entry {
    parser: vt100::Parser,
    subscribers: usize,
    last_dirty_notify: Option<Instant>,
}

/// Bounded LRU-evicting map from session id to live `vt100::Parser`.
///
/// Emulators are created lazily on first subscription and dropped once the
/// last subscriber unsubscribes; a bounded capacity additionally evicts the
/// least-recently-touched entry when the cache would otherwise grow
/// unbounded (the iOS-preview use case from §4.4).
pub struct EmulatorCache {
    inner: Mutex<HashMap<String, Entry>>,
    capacity: usize,
}

impl EmulatorCache {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    /// Initializes (or reuses) the emulator for `id` at `cols x rows` and
    /// increments its subscriber count.
    pub fn subscribe(&self, id: &str, cols: u16, rows: u16) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len() >= self.capacity && !inner.contains_key(id) {
            if let Some(victim) = inner
                .iter()
                .filter(|(_, e)| e.subscribers == 0)
                .min_by_key(|(_, e)| e.last_dirty_notify)
                .map(|(k, _)| k.clone())
            {
                inner.remove(&victim);
            }
        }
        let entry = inner.entry(id.to_string()).or_insert_with(|| Entry {
            parser: vt100::Parser::new(rows, cols, 0),
            subscribers: 0,
            last_dirty_notify: None,
        });
        entry.subscribers += 1;
    }

    /// Drops a subscription; the emulator itself is retained until cache
    /// pressure evicts it, not disposed synchronously — matching §4.4's
    /// "after the last unsubscribe and a grace period" without needing a
    /// dedicated timer thread.
    pub fn unsubscribe(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.get_mut(id) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
        }
    }

    /// Feeds output bytes from the PTY supervisor into the session's
    /// emulator, if and only if one already exists for it. Unlike
    /// `subscribe`, this is called unconditionally for every session's
    /// output regardless of whether anyone is watching, so it must never
    /// create an entry itself — doing so would let an unbounded number of
    /// unsubscribed, merely-producing sessions grow the cache past
    /// `capacity` (§4.4's bounded-cache requirement applies to entries this
    /// function touches too).
    pub fn advance(&self, id: &str, bytes: &[u8], _default_cols: u16, _default_rows: u16) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.get_mut(id) {
            entry.parser.process(bytes);
        }
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.get_mut(id) {
            entry.parser.set_size(rows, cols);
        }
    }

    /// Returns `true` at most once per [`DIRTY_COALESCE`] interval for a
    /// given session, letting callers throttle fan-out without a timer
    /// thread per session.
    pub fn should_notify_dirty(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = inner.get_mut(id) else {
            return false;
        };
        let now = Instant::now();
        match entry.last_dirty_notify {
            Some(last) if now.duration_since(last) < DIRTY_COALESCE => false,
            _ => {
                entry.last_dirty_notify = Some(now);
                true
            }
        }
    }

    /// Evicts the session's emulator entirely, e.g. on cleanup (§3
    /// "cleanup-exited and the emulator cache").
    pub fn evict(&self, id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Snapshots the visible screen as dense cell runs plus cursor; never
    /// includes scrollback (§3, §4.4). Snapshots are on-demand (§3): if no
    /// byte has reached the emulator yet (a session that just started),
    /// an empty screen at `cols x rows` is created rather than returning
    /// `None`, so `GET /buffer` never 404s for an existing session.
    pub fn snapshot_or_init(&self, id: &str, cols: u16, rows: u16) -> BufferSnapshot {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.entry(id.to_string()).or_insert_with(|| Entry {
                parser: vt100::Parser::new(rows, cols, 0),
                subscribers: 0,
                last_dirty_notify: None,
            });
        }
        self.snapshot(id).expect("entry just inserted")
    }

    /// Snapshots the visible screen as dense cell runs plus cursor; never
    /// includes scrollback (§3, §4.4).
    pub fn snapshot(&self, id: &str) -> Option<BufferSnapshot> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.get(id)?;
        let screen = entry.parser.screen();
        let (rows, cols) = screen.size();
        let (cursor_y, cursor_x) = screen.cursor_position();

        let mut rows_runs = Vec::with_capacity(rows as usize);
        for row in 0..rows {
            let mut runs: Vec<CellRun> = Vec::new();
            for col in 0..cols {
                let Some(cell) = screen.cell(row, col) else {
                    continue;
                };
                let ch = cell.contents().chars().next().unwrap_or(' ');
                let fg = cell_color_index(&cell.fgcolor());
                let bg = cell_color_index(&cell.bgcolor());
                let bold = cell.bold();
                if let Some(last) = runs.last_mut() {
                    if last.text == ch && last.fg == fg && last.bg == bg && last.bold == bold {
                        last.len += 1;
                        continue;
                    }
                }
                runs.push(CellRun {
                    text: ch,
                    len: 1,
                    fg,
                    bg,
                    bold,
                });
            }
            rows_runs.push(runs);
        }

        Some(BufferSnapshot {
            cols,
            rows,
            viewport_y: 0,
            cursor_x,
            cursor_y,
            rows_runs,
        })
    }
}

fn cell_color_index(color: &vt100::Color) -> u8 {
    match color {
        vt100::Color::Default => 255,
        vt100::Color::Idx(i) => *i,
        vt100::Color::Rgb(r, g, b) => (u16::from(*r) + u16::from(*g) + u16::from(*b)).min(254) as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_creates_and_unsubscribe_keeps_entry() {
        let cache = EmulatorCache::new(8);
        cache.subscribe("a", 80, 24);
        assert!(cache.contains("a"));
        cache.unsubscribe("a");
        assert!(cache.contains("a"));
    }

    #[test]
    fn advance_then_snapshot_reflects_output() {
        let cache = EmulatorCache::new(8);
        cache.subscribe("a", 80, 24);
        cache.advance("a", b"hi", 80, 24);
        let snapshot = cache.snapshot("a").expect("snapshot");
        assert_eq!(snapshot.cols, 80);
        assert_eq!(snapshot.rows, 24);
    }

    #[test]
    fn evict_removes_entry() {
        let cache = EmulatorCache::new(8);
        cache.subscribe("a", 80, 24);
        cache.evict("a");
        assert!(!cache.contains("a"));
    }

    #[test]
    fn dirty_notification_is_coalesced() {
        let cache = EmulatorCache::new(8);
        cache.subscribe("a", 80, 24);
        assert!(cache.should_notify_dirty("a"));
        assert!(!cache.should_notify_dirty("a"));
    }

    #[test]
    fn snapshot_or_init_creates_empty_screen_without_output() {
        let cache = EmulatorCache::new(8);
        let snapshot = cache.snapshot_or_init("a", 80, 24);
        assert_eq!(snapshot.cols, 80);
        assert_eq!(snapshot.rows, 24);
        assert!(cache.contains("a"));
    }

    #[test]
    fn advance_does_not_create_entry_for_unsubscribed_session() {
        let cache = EmulatorCache::new(8);
        cache.advance("never-subscribed", b"hi", 80, 24);
        assert!(!cache.contains("never-subscribed"));
    }

    #[test]
    fn eviction_prefers_unsubscribed_sessions_at_capacity() {
        let cache = EmulatorCache::new(1);
        cache.subscribe("a", 80, 24);
        cache.unsubscribe("a");
        cache.subscribe("b", 80, 24);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }
}
