//! File system watcher for incremental reconciliation
//!
//! Notify delivers raw events on its own thread into a channel; the server
//! loop drains that channel with [`FileWatcher::poll_events`], which never
//! blocks. Events are coalesced per path in a [`Debouncer`] and released once
//! a path has been quiet for the debounce window.

use anyhow::{Context, Result};
use mdkb_core::scanner::should_skip_dir;
use mdkb_core::Scanner;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Lifecycle of the watch loop as reported by status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchState {
    /// Not watching yet (startup)
    Idle,
    /// Waiting for file system events
    Watching,
    /// Events received, waiting for the debounce window to pass
    Debouncing,
    /// Reconciliation tasks are running
    Reconciling,
    /// Notifications unavailable; relying on periodic full rescans
    Degraded,
}

impl WatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Watching => "watching",
            Self::Debouncing => "debouncing",
            Self::Reconciling => "reconciling",
            Self::Degraded => "degraded",
        }
    }
}

/// A debounced file system event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

/// Type of file system event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

/// A pending event waiting for debounce
#[derive(Debug)]
struct PendingEvent {
    kind: FileEventKind,
    last_seen: Instant,
}

/// Per-path coalescing of events within a quiet window
#[derive(Debug)]
pub struct Debouncer {
    pending: HashMap<PathBuf, PendingEvent>,
    debounce: Duration,
}

impl Debouncer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce,
        }
    }

    /// Record an event; repeated events for a path restart its window
    pub fn record(&mut self, path: PathBuf, kind: FileEventKind, now: Instant) {
        if let Some(existing) = self.pending.get_mut(&path) {
            existing.kind = merge_event_kinds(existing.kind, kind);
            existing.last_seen = now;
        } else {
            self.pending.insert(
                path,
                PendingEvent {
                    kind,
                    last_seen: now,
                },
            );
        }
    }

    /// Remove and return events quiet for at least the debounce window, sorted by path
    pub fn ready(&mut self, now: Instant) -> Vec<FileEvent> {
        let debounce = self.debounce;
        let mut ready = Vec::new();
        self.pending.retain(|path, pending| {
            if now.saturating_duration_since(pending.last_seen) >= debounce {
                ready.push(FileEvent {
                    path: path.clone(),
                    kind: pending.kind,
                });
                false
            } else {
                true
            }
        });
        ready.sort_by(|a, b| a.path.cmp(&b.path));
        ready
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Merge two event kinds when the same file has multiple events
fn merge_event_kinds(old: FileEventKind, new: FileEventKind) -> FileEventKind {
    match (old, new) {
        // Created then deleted = deleted (reconciliation of a missing path is a no-op)
        (FileEventKind::Created, FileEventKind::Deleted) => FileEventKind::Deleted,
        // Created then modified = created
        (FileEventKind::Created, FileEventKind::Modified) => FileEventKind::Created,
        // Deleted then created = modified
        (FileEventKind::Deleted, FileEventKind::Created) => FileEventKind::Modified,
        // Otherwise, latest wins
        (_, new) => new,
    }
}

/// Map one notify event to per-path events.
///
/// A rename becomes a delete of the old path and a create of the new one.
pub fn translate_event(event: &Event) -> Vec<(PathBuf, FileEventKind)> {
    match event.kind {
        EventKind::Create(_) => with_kind(&event.paths, FileEventKind::Created),
        EventKind::Remove(_) => with_kind(&event.paths, FileEventKind::Deleted),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() == 2 => vec![
                (event.paths[0].clone(), FileEventKind::Deleted),
                (event.paths[1].clone(), FileEventKind::Created),
            ],
            RenameMode::From => with_kind(&event.paths, FileEventKind::Deleted),
            RenameMode::To => with_kind(&event.paths, FileEventKind::Created),
            // Backends that cannot tell which side this is
            _ => event
                .paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        FileEventKind::Created
                    } else {
                        FileEventKind::Deleted
                    };
                    (p.clone(), kind)
                })
                .collect(),
        },
        EventKind::Modify(_) => with_kind(&event.paths, FileEventKind::Modified),
        _ => Vec::new(),
    }
}

fn with_kind(paths: &[PathBuf], kind: FileEventKind) -> Vec<(PathBuf, FileEventKind)> {
    paths.iter().map(|p| (p.clone(), kind)).collect()
}

/// Debounced watcher over one root
pub struct FileWatcher {
    // Dropping the watcher stops notifications
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    scanner: Scanner,
    debouncer: Debouncer,
    need_rescan: bool,
}

impl FileWatcher {
    /// Start watching the scanner's root recursively
    pub fn new(scanner: Scanner, debounce: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher =
            notify::recommended_watcher(tx).context("Failed to create file watcher")?;
        watcher
            .watch(scanner.root(), RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", scanner.root().display()))?;

        Ok(Self {
            _watcher: watcher,
            rx,
            scanner,
            debouncer: Debouncer::new(debounce),
            need_rescan: false,
        })
    }

    pub fn root(&self) -> &Path {
        self.scanner.root()
    }

    /// Poll for ready (debounced) file events
    ///
    /// This method:
    /// 1. Reads all pending raw events from the channel
    /// 2. Updates the pending event map with latest event types
    /// 3. Returns events that have exceeded the debounce timeout
    pub fn poll_events(&mut self) -> Vec<FileEvent> {
        let now = Instant::now();

        while let Ok(result) = self.rx.try_recv() {
            match result {
                Ok(event) => self.process_raw_event(&event, now),
                Err(e) => {
                    // Events may have been lost; only a full scan is safe
                    tracing::warn!("File watcher error, scheduling full rescan: {}", e);
                    self.need_rescan = true;
                }
            }
        }

        self.debouncer.ready(now)
    }

    /// Check if there are any pending events
    pub fn has_pending(&self) -> bool {
        self.debouncer.has_pending()
    }

    /// Returns true once after events were lost or a directory changed
    pub fn take_rescan_request(&mut self) -> bool {
        std::mem::take(&mut self.need_rescan)
    }

    fn process_raw_event(&mut self, event: &Event, now: Instant) {
        if event.need_rescan() {
            self.need_rescan = true;
        }

        for (path, kind) in translate_event(event) {
            if self.scanner.is_eligible(&path) {
                self.debouncer.record(path, kind, now);
            } else if self.is_directory_change(&path, kind) {
                // Files moved in or out with a directory produce no events of their own
                tracing::debug!("Directory change at {}, scheduling full rescan", path.display());
                self.need_rescan = true;
            }
        }
    }

    fn is_directory_change(&self, path: &Path, kind: FileEventKind) -> bool {
        let Ok(relative) = path.strip_prefix(self.scanner.root()) else {
            return false;
        };
        if relative.as_os_str().is_empty() {
            return false;
        }
        // Nothing below a skipped directory is ever indexed
        if relative
            .components()
            .any(|c| c.as_os_str().to_str().is_some_and(should_skip_dir))
        {
            return false;
        }
        match kind {
            FileEventKind::Created => path.is_dir(),
            // Already gone, so a file cannot be told from a directory by its
            // name (`notes.v1/` looks like a file). Treat it as a directory.
            FileEventKind::Deleted => true,
            FileEventKind::Modified => false,
        }
    }
}
