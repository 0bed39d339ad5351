//! Async coordination of reconciliation and search
//!
//! The core library is synchronous. This wraps it for the daemon: every call
//! runs on tokio's blocking pool under a timeout, reconciliations are bounded
//! by a semaphore, and only one full run happens at a time. A timed-out task
//! keeps its per-path claim until the blocking call actually returns, so a
//! hung embedding call stalls that one path and nothing else.

use anyhow::{anyhow, Context, Result};
use mdkb_core::{
    DocumentSummary, FileError, PathOutcome, ReconcileReport, Reconciler, Scanner, SearchError,
    SearchHit, SearchOptions,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{ConfigError, Settings};

/// Pause before retrying a path whose reconciliation was coalesced
const SETTLE_RETRY: Duration = Duration::from_millis(25);

/// Timeouts and limits for the coordinator
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorLimits {
    pub reconcile_timeout: Duration,
    pub search_timeout: Duration,
    pub max_concurrent: usize,
}

impl From<&Settings> for CoordinatorLimits {
    fn from(settings: &Settings) -> Self {
        Self {
            reconcile_timeout: settings.reconcile_timeout,
            search_timeout: settings.search_timeout,
            max_concurrent: settings.max_concurrent,
        }
    }
}

/// Outcome of the most recent full reconciliation
#[derive(Debug, Clone)]
pub struct FullRun {
    pub report: ReconcileReport,
    /// Unix milliseconds
    pub finished_at: i64,
}

pub struct Coordinator {
    reconciler: Arc<Reconciler>,
    limits: CoordinatorLimits,
    permits: Arc<Semaphore>,
    full_run: tokio::sync::Mutex<()>,
    last_full: Mutex<Option<FullRun>>,
    fresh: AtomicBool,
    active: AtomicUsize,
}

impl Coordinator {
    pub fn new(reconciler: Arc<Reconciler>, limits: CoordinatorLimits) -> Self {
        Self {
            reconciler,
            permits: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
            limits,
            full_run: tokio::sync::Mutex::new(()),
            last_full: Mutex::new(None),
            fresh: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// True after a clean full run with no item failures since
    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::SeqCst)
    }

    /// Reconciliations currently running or waiting for a permit
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn last_full(&self) -> Option<FullRun> {
        self.last_full
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check the embedding service returns vectors of the configured length.
    ///
    /// A mismatch is fatal. An unreachable service is only logged: items fail
    /// until it comes back and the next rescan picks them up.
    pub async fn probe_embedding(&self) -> Result<(), ConfigError> {
        let embedder = Arc::clone(self.reconciler.embedder());
        let expected = embedder.dimension();
        let probe = tokio::task::spawn_blocking(move || embedder.probe());

        match tokio::time::timeout(self.limits.reconcile_timeout, probe).await {
            Ok(Ok(Ok(actual))) if actual == expected => {
                tracing::info!("Embedding service reachable (dimension {})", actual);
                Ok(())
            }
            Ok(Ok(Ok(actual))) => Err(ConfigError::DimensionMismatch(format!(
                "embedding service returned {actual} dimensions, {expected} configured"
            ))),
            Ok(Ok(Err(e))) => {
                tracing::warn!("Embedding service unavailable at startup: {:#}", e);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!("Embedding probe panicked: {}", e);
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Embedding probe timed out");
                Ok(())
            }
        }
    }

    /// Reconcile one path on the blocking pool, bounded by the item timeout
    pub async fn reconcile_path(&self, path: PathBuf) -> PathOutcome {
        let outcome = run_path(
            Arc::clone(&self.reconciler),
            Arc::clone(&self.permits),
            &self.active,
            self.limits.reconcile_timeout,
            path,
        )
        .await;
        if matches!(outcome, PathOutcome::Failed(_)) {
            self.fresh.store(false, Ordering::SeqCst);
        }
        outcome
    }

    /// Reconcile one path and, if a run for it is already in flight, wait for
    /// that run and go again so the record matches the disk as of this call
    pub async fn reconcile_path_settled(&self, path: PathBuf) -> PathOutcome {
        let deadline = Instant::now() + self.limits.reconcile_timeout;
        loop {
            let outcome = self.reconcile_path(path.clone()).await;
            if outcome != PathOutcome::Coalesced || Instant::now() >= deadline {
                return outcome;
            }
            tokio::time::sleep(SETTLE_RETRY).await;
        }
    }

    /// Run a file edit below the root on the blocking pool
    pub async fn edit_file<F>(&self, edit: F) -> Result<PathBuf, FileError>
    where
        F: FnOnce(&Scanner) -> Result<PathBuf, FileError> + Send + 'static,
    {
        let scanner = self.reconciler.scanner().clone();
        tokio::task::spawn_blocking(move || edit(&scanner))
            .await
            .unwrap_or_else(|e| {
                Err(FileError::Io {
                    name: String::new(),
                    source: std::io::Error::other(format!("file task failed: {e}")),
                })
            })
    }

    /// Documents on disk below the root, relative and sorted
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let scanner = self.reconciler.scanner().clone();
        self.blocking(move || mdkb_core::files::list(&scanner)).await
    }

    pub async fn get_document(&self, path: PathBuf) -> Result<Option<DocumentSummary>> {
        let store = Arc::clone(self.reconciler.store());
        self.blocking(move || store.get(&path)).await
    }

    /// Full scan, then every changed path concurrently (bounded by the semaphore)
    pub async fn reconcile_full(&self) -> Result<ReconcileReport> {
        let _guard = self.full_run.lock().await;
        let start = Instant::now();

        let reconciler = Arc::clone(&self.reconciler);
        let plan = tokio::task::spawn_blocking(move || reconciler.plan_full())
            .await
            .context("Scan task failed")??;
        let mut report = plan.report();

        let mut tasks = JoinSet::new();
        for path in plan.paths().cloned() {
            let reconciler = Arc::clone(&self.reconciler);
            let permits = Arc::clone(&self.permits);
            let timeout = self.limits.reconcile_timeout;
            self.active.fetch_add(1, Ordering::SeqCst);
            tasks.spawn(async move {
                let outcome = run_path_counted(reconciler, permits, timeout, path.clone()).await;
                (path, outcome)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            self.active.fetch_sub(1, Ordering::SeqCst);
            match joined {
                Ok((path, outcome)) => report.record(&path, &outcome),
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("Reconciliation task failed: {}", e);
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report.log_summary();

        self.fresh.store(report.is_clean(), Ordering::SeqCst);
        *self.last_full.lock().unwrap_or_else(PoisonError::into_inner) = Some(FullRun {
            report: report.clone(),
            finished_at: now_millis(),
        });
        Ok(report)
    }

    /// Run a search on the blocking pool, bounded by the search timeout
    pub async fn search(
        &self,
        query: String,
        options: SearchOptions,
    ) -> Result<Vec<SearchHit>, SearchError> {
        options.validate()?;
        let store = Arc::clone(self.reconciler.store());
        let embedder = Arc::clone(self.reconciler.embedder());
        let task = tokio::task::spawn_blocking(move || {
            mdkb_core::search(store.as_ref(), embedder.as_ref(), &query, &options)
        });

        match tokio::time::timeout(self.limits.search_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SearchError::Store(anyhow!("search task failed: {e}"))),
            Err(_) => Err(SearchError::Timeout(self.limits.search_timeout.as_secs())),
        }
    }

    pub async fn document_count(&self) -> Result<usize> {
        let store = Arc::clone(self.reconciler.store());
        self.blocking(move || store.count()).await
    }

    pub async fn list_documents(&self, offset: usize, limit: usize) -> Result<Vec<DocumentSummary>> {
        let store = Arc::clone(self.reconciler.store());
        self.blocking(move || store.list(offset, limit)).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.limits.search_timeout, task).await {
            Ok(joined) => joined.context("Store task failed")?,
            Err(_) => Err(anyhow!(
                "store call timed out after {}s",
                self.limits.search_timeout.as_secs()
            )),
        }
    }
}

async fn run_path(
    reconciler: Arc<Reconciler>,
    permits: Arc<Semaphore>,
    active: &AtomicUsize,
    timeout: Duration,
    path: PathBuf,
) -> PathOutcome {
    active.fetch_add(1, Ordering::SeqCst);
    let outcome = run_path_counted(reconciler, permits, timeout, path).await;
    active.fetch_sub(1, Ordering::SeqCst);
    outcome
}

async fn run_path_counted(
    reconciler: Arc<Reconciler>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    path: PathBuf,
) -> PathOutcome {
    let Ok(_permit) = permits.acquire_owned().await else {
        return PathOutcome::Failed("reconciliation pool closed".to_string());
    };

    let task_path = path.clone();
    let task = tokio::task::spawn_blocking(move || reconciler.reconcile_path(&task_path));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => PathOutcome::Failed(format!("reconciliation task failed: {e}")),
        Err(_) => {
            tracing::warn!(
                "Reconciliation of {} timed out after {}s",
                path.display(),
                timeout.as_secs()
            );
            PathOutcome::Failed(format!("timed out after {}s", timeout.as_secs()))
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
