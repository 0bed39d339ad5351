//! Unix socket server for daemon IPC
//!
//! Hosts the watch-and-reconcile loop and answers query requests from CLI
//! clients. Watcher intake never waits on reconciliation: debounced paths go
//! into a bounded queue, a dispatcher feeds them to the coordinator, and a
//! full queue falls back to a full rescan instead of blocking.

use crate::config::Settings;
use crate::coordinator::Coordinator;
use crate::protocol::{DaemonStatus, DocumentWire, ErrorCause, Request, Response, SearchResultWire};
use crate::watcher::{FileWatcher, WatchState};
use anyhow::{Context, Result};
use mdkb_core::{files, FileError, PathOutcome, SearchOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};

/// Interval for polling file system events (100ms)
const WATCHER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Page size for `ListDocuments` without a limit
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Watch loop and request handling parameters
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub debounce: Duration,
    pub rescan_interval: Duration,
    pub degraded_rescan_interval: Duration,
    pub queue_capacity: usize,
    pub max_concurrent: usize,
    pub search_defaults: SearchOptions,
}

impl From<&Settings> for ServerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            debounce: settings.debounce,
            rescan_interval: settings.rescan_interval,
            degraded_rescan_interval: settings.degraded_rescan_interval,
            queue_capacity: settings.queue_capacity,
            max_concurrent: settings.max_concurrent,
            search_defaults: settings.search_defaults,
        }
    }
}

/// Shared state for the daemon
pub struct DaemonState {
    pub coordinator: Arc<Coordinator>,
    pub options: ServerOptions,
    pub start_time: Instant,
    watch_state: Mutex<WatchState>,
    /// Paths waiting in the work queue
    queued: AtomicUsize,
    full_running: AtomicBool,
    shutdown: Notify,
}

impl DaemonState {
    pub fn watch_state(&self) -> WatchState {
        *self.watch_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_watch_state(&self, next: WatchState) {
        let mut state = self.watch_state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            tracing::debug!("Watch state {} -> {}", state.as_str(), next.as_str());
            *state = next;
        }
    }

    /// Queued plus running reconciliations
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.coordinator.active()
    }

    /// Ask the server loop to stop
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Unix socket server for IPC
pub struct Server {
    listener: UnixListener,
    state: Arc<DaemonState>,
}

impl Server {
    /// Bind the socket; the watch loop starts with [`Server::run`]
    pub fn new(socket_path: &Path, coordinator: Arc<Coordinator>, options: ServerOptions) -> Result<Self> {
        // Remove stale socket file if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        let listener = UnixListener::bind(socket_path).context("Failed to bind to Unix socket")?;

        // Owner only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(socket_path, perms)
                .context("Failed to set socket permissions")?;
        }

        tracing::info!("Listening on {:?}", socket_path);

        let state = Arc::new(DaemonState {
            coordinator,
            options,
            start_time: Instant::now(),
            watch_state: Mutex::new(WatchState::Idle),
            queued: AtomicUsize::new(0),
            full_running: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        Ok(Self { listener, state })
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// Run until a `Shutdown` request arrives
    pub async fn run(&self) -> Result<()> {
        let scanner = self.state.coordinator.reconciler().scanner().clone();
        let watcher = match FileWatcher::new(scanner, self.state.options.debounce) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(
                    "File notifications unavailable, falling back to periodic rescans every {}s: {:#}",
                    self.state.options.degraded_rescan_interval.as_secs(),
                    e
                );
                None
            }
        };

        let (tx, rx) = mpsc::channel(self.state.options.queue_capacity.max(1));
        let background: [JoinHandle<()>; 2] = [
            tokio::spawn(run_watch_loop(Arc::clone(&self.state), watcher, tx)),
            tokio::spawn(run_dispatcher(Arc::clone(&self.state), rx)),
        ];

        tracing::info!("Server ready, accepting connections");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, state).await {
                                tracing::error!("Client handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                },
                _ = self.state.shutdown.notified() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        // Running blocking tasks finish on their own; each upsert is atomic
        for handle in background {
            handle.abort();
        }
        Ok(())
    }
}

/// Polls the watcher, queues debounced paths and schedules full rescans
async fn run_watch_loop(
    state: Arc<DaemonState>,
    mut watcher: Option<FileWatcher>,
    tx: mpsc::Sender<PathBuf>,
) {
    let rescan_every = if watcher.is_some() {
        state.options.rescan_interval
    } else {
        state.options.degraded_rescan_interval
    };
    let mut interval = tokio::time::interval(WATCHER_POLL_INTERVAL);
    // Startup always reconciles the whole tree
    let mut rescan_due = true;
    let mut last_rescan = Instant::now();

    loop {
        interval.tick().await;

        if let Some(watcher) = watcher.as_mut() {
            for event in watcher.poll_events() {
                tracing::debug!("{:?} {}", event.kind, event.path.display());
                state.queued.fetch_add(1, Ordering::SeqCst);
                match tx.try_send(event.path) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(path)) => {
                        state.queued.fetch_sub(1, Ordering::SeqCst);
                        tracing::warn!(
                            "Work queue full, dropping {} and scheduling full rescan",
                            path.display()
                        );
                        rescan_due = true;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        state.queued.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                }
            }
            if watcher.take_rescan_request() {
                rescan_due = true;
            }
        }

        if last_rescan.elapsed() >= rescan_every {
            rescan_due = true;
        }

        if rescan_due && !state.full_running.swap(true, Ordering::SeqCst) {
            rescan_due = false;
            last_rescan = Instant::now();
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(e) = state.coordinator.reconcile_full().await {
                    tracing::warn!("Full reconciliation failed: {:#}", e);
                }
                state.full_running.store(false, Ordering::SeqCst);
            });
        }

        let next = match &watcher {
            None => WatchState::Degraded,
            Some(_) if state.full_running.load(Ordering::SeqCst) || state.pending() > 0 => {
                WatchState::Reconciling
            }
            Some(w) if w.has_pending() => WatchState::Debouncing,
            Some(_) => WatchState::Watching,
        };
        state.set_watch_state(next);
    }
}

/// Feeds queued paths to the coordinator, at most `max_concurrent` at a time
async fn run_dispatcher(state: Arc<DaemonState>, mut rx: mpsc::Receiver<PathBuf>) {
    let mut tasks = JoinSet::new();
    let max = state.options.max_concurrent.max(1);

    while let Some(path) = rx.recv().await {
        while tasks.len() >= max {
            tasks.join_next().await;
        }
        state.queued.fetch_sub(1, Ordering::SeqCst);

        let coordinator = Arc::clone(&state.coordinator);
        tasks.spawn(async move {
            let outcome = coordinator.reconcile_path(path.clone()).await;
            tracing::debug!("{}: {:?}", path.display(), outcome);
        });
    }
}

/// Handle a single client connection
async fn handle_client(stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // Read one line (JSON request)
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(()); // Client disconnected
    }

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => handle_request(request, &state).await,
        Err(e) => Response::error(ErrorCause::InvalidRequest, format!("Invalid request: {e}")),
    };

    let response_json = serde_json::to_string(&response)?;
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    Ok(())
}

/// Handle a parsed request
pub async fn handle_request(request: Request, state: &DaemonState) -> Response {
    match request {
        Request::Search {
            query,
            limit,
            max_distance,
        } => {
            let defaults = &state.options.search_defaults;
            let options = SearchOptions {
                limit: limit.unwrap_or(defaults.limit),
                max_distance: max_distance.unwrap_or(defaults.max_distance),
            };
            match state.coordinator.search(query, options).await {
                Ok(hits) => {
                    Response::SearchResults(hits.into_iter().map(SearchResultWire::from).collect())
                }
                Err(e) => Response::from(e),
            }
        }
        Request::DocumentCount => match state.coordinator.document_count().await {
            Ok(count) => Response::Count(count),
            Err(e) => Response::error(ErrorCause::Store, format!("{e:#}")),
        },
        Request::ListDocuments { offset, limit } => {
            let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
            match state.coordinator.list_documents(offset, limit).await {
                Ok(docs) => Response::Documents(docs.into_iter().map(DocumentWire::from).collect()),
                Err(e) => Response::error(ErrorCause::Store, format!("{e:#}")),
            }
        }
        Request::Reconcile => match state.coordinator.reconcile_full().await {
            Ok(report) => Response::Reconciled(report),
            Err(e) => Response::error(ErrorCause::Internal, format!("Reconciliation failed: {e:#}")),
        },
        Request::CreateDocument { filename, content } => {
            let written = state
                .coordinator
                .edit_file(move |scanner| files::create(scanner, &filename, &content))
                .await;
            index_written(written, state).await
        }
        Request::UpdateDocument { filename, content } => {
            let written = state
                .coordinator
                .edit_file(move |scanner| files::update(scanner, &filename, &content))
                .await;
            index_written(written, state).await
        }
        Request::DeleteDocument { filename } => {
            let path = match state
                .coordinator
                .edit_file(move |scanner| files::delete(scanner, &filename))
                .await
            {
                Ok(path) => path,
                Err(e) => return Response::from(e),
            };
            match state.coordinator.reconcile_path_settled(path.clone()).await {
                PathOutcome::Failed(message) => Response::error(
                    ErrorCause::Store,
                    format!("{} was deleted but its record remains: {message}", path.display()),
                ),
                _ => Response::Ok,
            }
        }
        Request::ListFiles => match state.coordinator.list_files().await {
            Ok(names) => Response::Files(names),
            Err(e) => Response::error(ErrorCause::Internal, format!("{e:#}")),
        },
        Request::Status => handle_status(state).await,
        Request::Shutdown => {
            state.request_shutdown();
            Response::Ok
        }
    }
}

/// Bring the record of a just-written document up to date and return it.
///
/// The file stays on disk even if indexing fails; a later rescan retries it.
async fn index_written(written: Result<PathBuf, FileError>, state: &DaemonState) -> Response {
    let path = match written {
        Ok(path) => path,
        Err(e) => return Response::from(e),
    };
    if let PathOutcome::Failed(message) = state.coordinator.reconcile_path_settled(path.clone()).await
    {
        return Response::error(
            ErrorCause::Internal,
            format!("{} was written but not indexed: {message}", path.display()),
        );
    }
    match state.coordinator.get_document(path.clone()).await {
        Ok(Some(doc)) => Response::Document(DocumentWire::from(doc)),
        Ok(None) => Response::error(
            ErrorCause::Internal,
            format!("{} was written but is not indexed", path.display()),
        ),
        Err(e) => Response::error(ErrorCause::Store, format!("{e:#}")),
    }
}

async fn handle_status(state: &DaemonState) -> Response {
    let document_count = match state.coordinator.document_count().await {
        Ok(count) => count,
        Err(e) => return Response::error(ErrorCause::Store, format!("{e:#}")),
    };
    let last_full = state.coordinator.last_full();

    Response::Status(DaemonStatus {
        uptime_secs: state.start_time.elapsed().as_secs(),
        root: state
            .coordinator
            .reconciler()
            .scanner()
            .root()
            .to_string_lossy()
            .into_owned(),
        watch_state: state.watch_state(),
        document_count,
        fresh: state.coordinator.is_fresh(),
        pending: state.pending(),
        last_full_reconcile_at: last_full.as_ref().map(|run| run.finished_at),
        last_full_reconcile: last_full.map(|run| run.report),
    })
}
