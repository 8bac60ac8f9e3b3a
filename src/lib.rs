//! Core of the VibeTunnel terminal session server: PTY supervision,
//! on-disk recording, terminal emulation, and HTTP/WebSocket fan-out.
//!
//! This crate is the server-side core only. The macOS menubar host, the
//! iOS client, and the browser frontend are external collaborators that
//! consume the HTTP surface exposed by [`api`].

pub mod api;
pub mod auth;
pub mod browse;
pub mod buffer_aggregator;
pub mod config;
pub mod control_dir;
pub mod emulator;
pub mod error;
pub mod http_server;
pub mod hq;
pub mod input_queue;
pub mod protocol;
pub mod sessions;
pub mod stream_watcher;
pub mod tty_spawn;

pub use config::Config;
pub use error::CoreError;
