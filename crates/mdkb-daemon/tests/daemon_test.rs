//! Integration tests for the daemon
//!
//! Each test runs a real server on a temporary socket, backed by an in-memory
//! store and a deterministic letter-count embedder, and talks to it through
//! the synchronous client.

use mdkb_core::{EmbeddingClient, Reconciler, Scanner, SearchOptions, SqliteStore};
use mdkb_daemon::{
    Client, Coordinator, CoordinatorLimits, Request, Response, Server, ServerOptions, WatchState,
};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const DIM: usize = 26;

/// Counts ASCII letters; can be switched off to simulate an outage
#[derive(Default)]
struct LetterEmbedder {
    down: AtomicBool,
}

impl EmbeddingClient for LetterEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let mut v = vec![0.0; DIM];
        for c in text.chars().filter(char::is_ascii_alphabetic) {
            v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

struct Harness {
    root: TempDir,
    _sockets: TempDir,
    client: Client,
    embedder: Arc<LetterEmbedder>,
    server: Option<thread::JoinHandle<anyhow::Result<()>>>,
}

impl Harness {
    fn start(files: &[(&str, &str)]) -> Self {
        let root = TempDir::new().unwrap();
        for (name, content) in files {
            std::fs::write(root.path().join(name), content).unwrap();
        }
        let sockets = TempDir::new().unwrap();
        let socket_path = sockets.path().join("daemon.sock");
        let embedder = Arc::new(LetterEmbedder::default());

        let reconciler = Arc::new(Reconciler::new(
            Scanner::new(root.path().canonicalize().unwrap(), &["md".to_string()]),
            Arc::new(SqliteStore::in_memory(DIM).unwrap()),
            embedder.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            reconciler,
            CoordinatorLimits {
                reconcile_timeout: Duration::from_secs(10),
                search_timeout: Duration::from_secs(10),
                max_concurrent: 2,
            },
        ));
        let options = ServerOptions {
            debounce: Duration::from_millis(50),
            rescan_interval: Duration::from_secs(300),
            degraded_rescan_interval: Duration::from_secs(30),
            queue_capacity: 64,
            max_concurrent: 2,
            search_defaults: SearchOptions::default(),
        };

        let server_socket = socket_path.clone();
        let server = thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(async move {
                let server = Server::new(&server_socket, coordinator, options)?;
                server.run().await
            })
        });

        let client = Client::new(&socket_path).with_timeout(Duration::from_secs(10));
        assert!(
            wait_until(Duration::from_secs(10), || client.is_daemon_running()),
            "daemon did not come up"
        );

        Self {
            root,
            _sockets: sockets,
            client,
            embedder,
            server: Some(server),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.path().canonicalize().unwrap().join(name)
    }

    /// Wait for the startup reconciliation to finish
    fn wait_fresh(&self) {
        assert!(
            wait_until(Duration::from_secs(10), || self
                .client
                .status()
                .map(|s| s.fresh)
                .unwrap_or(false)),
            "index never became fresh"
        );
    }

    fn wait_count(&self, expected: usize) -> bool {
        wait_until(Duration::from_secs(10), || {
            self.client.document_count().ok() == Some(expected)
        })
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.client.shutdown();
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

fn raw_request(socket: &Path, line: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).unwrap();
    stream.write_all(line).unwrap();
    stream.flush().unwrap();
    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).unwrap();
    serde_json::from_str(&response).unwrap()
}

#[test]
fn test_startup_indexes_and_serves_queries() {
    let harness = Harness::start(&[("a.md", "hello world"), ("b.md", "goodbye world")]);
    harness.wait_fresh();

    assert_eq!(harness.client.document_count().unwrap(), 2);

    let docs = harness.client.list_documents(0, None).unwrap();
    let mut paths: Vec<_> = docs.iter().map(|d| d.path.clone()).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            harness.path("a.md").to_string_lossy().into_owned(),
            harness.path("b.md").to_string_lossy().into_owned(),
        ]
    );

    let results = harness.client.search("hello world", Some(5), Some(2.0)).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(
        results[0].path,
        harness.path("a.md").to_string_lossy().into_owned()
    );
    assert!(results[0].distance < 1e-6);
    assert_eq!(results[0].snippet, "hello world");

    let status = harness.client.status().unwrap();
    assert_eq!(status.document_count, 2);
    assert!(status.fresh);
    assert_eq!(status.last_full_reconcile.unwrap().created, 2);
    assert_ne!(status.watch_state, WatchState::Idle);
}

#[test]
fn test_forced_reconcile_is_idempotent() {
    let harness = Harness::start(&[("a.md", "hello world")]);
    harness.wait_fresh();

    let report = harness.client.reconcile().unwrap();
    assert_eq!(report.changes(), 0);
    assert_eq!(report.unchanged, 1);
    assert!(report.is_clean());
}

#[test]
fn test_watcher_propagates_changes() {
    let harness = Harness::start(&[("a.md", "hello world"), ("b.md", "goodbye world")]);
    harness.wait_fresh();

    std::fs::write(harness.root.path().join("c.md"), "new notes").unwrap();
    assert!(harness.wait_count(3), "created file was not indexed");

    std::fs::remove_file(harness.root.path().join("b.md")).unwrap();
    assert!(harness.wait_count(2), "deleted file was not removed");

    let docs = harness.client.list_documents(0, Some(10)).unwrap();
    let b = harness.path("b.md").to_string_lossy().into_owned();
    assert!(docs.iter().all(|d| d.path != b));
}

#[test]
fn test_search_errors_carry_cause() {
    let harness = Harness::start(&[("a.md", "hello world")]);
    harness.wait_fresh();

    let err = harness
        .client
        .search("hello", Some(5), Some(3.0))
        .unwrap_err();
    assert!(err.to_string().contains("invalid request"), "{err}");

    harness.embedder.down.store(true, Ordering::SeqCst);
    let err = harness.client.search("hello", None, None).unwrap_err();
    assert!(err.to_string().contains("embedding"), "{err}");

    // An outage is an explicit error, never an empty result set
    harness.embedder.down.store(false, Ordering::SeqCst);
    assert!(!harness
        .client
        .search("hello world", None, None)
        .unwrap()
        .is_empty());
}

#[test]
fn test_embedding_outage_keeps_records_and_clears_freshness() {
    let harness = Harness::start(&[("a.md", "hello world")]);
    harness.wait_fresh();

    harness.embedder.down.store(true, Ordering::SeqCst);
    std::fs::write(harness.root.path().join("a.md"), "hello mars").unwrap();

    // Let the watcher's own attempt fail first so the forced run is not coalesced
    assert!(wait_until(Duration::from_secs(10), || !harness
        .client
        .status()
        .map(|s| s.fresh)
        .unwrap_or(true)));

    let report = harness.client.reconcile().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].path, harness.path("a.md"));
    assert!(!harness.client.status().unwrap().fresh);
    assert_eq!(harness.client.document_count().unwrap(), 1);

    harness.embedder.down.store(false, Ordering::SeqCst);
    let report = harness.client.reconcile().unwrap();
    assert!(report.is_clean());
    assert!(harness.client.status().unwrap().fresh);
}

#[test]
fn test_document_write_tools() {
    let harness = Harness::start(&[("a.md", "hello world")]);
    harness.wait_fresh();

    let created = harness
        .client
        .create_document("plan.md", "# Plan\n\nship the release")
        .unwrap();
    assert_eq!(created.path, harness.path("plan.md").to_string_lossy());
    assert_eq!(
        std::fs::read_to_string(harness.path("plan.md")).unwrap(),
        "# Plan\n\nship the release"
    );
    // Indexed by the time the call returns
    let results = harness
        .client
        .search("ship the release plan", Some(1), Some(2.0))
        .unwrap();
    assert_eq!(results[0].path, created.path);

    let updated = harness
        .client
        .update_document("plan.md", "# Plan\n\npostponed")
        .unwrap();
    assert_eq!(updated.indexed_at, created.indexed_at);
    assert!(updated.updated_at > created.updated_at);
    let results = harness.client.search("postponed plan", Some(1), Some(2.0)).unwrap();
    assert_eq!(results[0].snippet, "# Plan\n\npostponed");

    assert_eq!(
        harness.client.list_files().unwrap(),
        vec!["a.md".to_string(), "plan.md".to_string()]
    );

    harness.client.delete_document("plan.md").unwrap();
    assert!(!harness.path("plan.md").exists());
    assert_eq!(harness.client.document_count().unwrap(), 1);
    assert_eq!(harness.client.list_files().unwrap(), vec!["a.md".to_string()]);
}

#[test]
fn test_document_write_tools_reject_bad_requests() {
    let harness = Harness::start(&[("a.md", "hello world")]);
    harness.wait_fresh();

    let invalid = |result: anyhow::Result<()>| {
        let err = result.unwrap_err().to_string();
        assert!(err.contains("invalid request"), "{err}");
    };
    invalid(harness.client.create_document("a.md", "again").map(drop));
    invalid(harness.client.create_document("notes.txt", "text").map(drop));
    invalid(harness.client.create_document("../escape.md", "out").map(drop));
    invalid(harness.client.create_document("sub/inner.md", "nested").map(drop));
    invalid(harness.client.create_document("blank.md", "  \n").map(drop));
    invalid(harness.client.update_document("missing.md", "x").map(drop));
    invalid(harness.client.delete_document("missing.md"));

    let parent = harness.root.path().parent().unwrap();
    assert!(!parent.join("escape.md").exists());
    assert_eq!(
        std::fs::read_to_string(harness.path("a.md")).unwrap(),
        "hello world"
    );
    assert_eq!(harness.client.document_count().unwrap(), 1);
}

#[test]
fn test_created_document_survives_embedding_outage() {
    let harness = Harness::start(&[]);
    harness.wait_fresh();

    harness.embedder.down.store(true, Ordering::SeqCst);
    let err = harness
        .client
        .create_document("late.md", "written offline")
        .unwrap_err();
    assert!(err.to_string().contains("not indexed"), "{err}");
    assert!(harness.path("late.md").exists());
    assert_eq!(harness.client.document_count().unwrap(), 0);

    // The file is on disk, so the next reconciliation picks it up
    harness.embedder.down.store(false, Ordering::SeqCst);
    harness.client.reconcile().unwrap();
    assert!(harness.wait_count(1));
}

#[test]
fn test_invalid_request() {
    let harness = Harness::start(&[]);

    match raw_request(harness.client.socket_path(), b"not valid json\n") {
        Response::Error { message, .. } => assert!(message.contains("Invalid request")),
        other => panic!("Expected error response, got {other:?}"),
    }

    // Unknown request types are rejected the same way
    match raw_request(harness.client.socket_path(), b"\"Watch\"\n") {
        Response::Error { .. } => {}
        other => panic!("Expected error response, got {other:?}"),
    }

    match raw_request(
        harness.client.socket_path(),
        format!("{}\n", serde_json::to_string(&Request::DocumentCount).unwrap()).as_bytes(),
    ) {
        Response::Count(0) => {}
        other => panic!("Expected empty count, got {other:?}"),
    }
}

#[test]
fn test_shutdown_stops_server() {
    let mut harness = Harness::start(&[]);
    harness.client.shutdown().unwrap();

    let server = harness.server.take().unwrap();
    server.join().unwrap().unwrap();
}
