//! mdkb-daemon: Library for the mdkb daemon
//!
//! This crate provides:
//! - Layered configuration
//! - Debounced file system watcher
//! - Async coordination of reconciliation and search
//! - Unix socket server for IPC
//! - Client library for communicating with the daemon
//! - Protocol types for client-daemon communication

pub mod client;
pub mod config;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod watcher;

// Re-exports for convenience
pub use client::Client;
pub use config::{default_db_path, default_socket_path, Config, ConfigError, Settings};
pub use coordinator::{Coordinator, CoordinatorLimits, FullRun};
pub use protocol::{
    DaemonStatus, DocumentWire, ErrorCause, Request, Response, SearchResultWire,
};
pub use server::{DaemonState, Server, ServerOptions};
pub use watcher::{Debouncer, FileEvent, FileEventKind, FileWatcher, WatchState};
