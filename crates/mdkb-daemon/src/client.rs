//! Client library for communicating with mdkb-daemon
//!
//! Synchronous: the CLI has no runtime of its own.

use crate::protocol::{DaemonStatus, DocumentWire, Request, Response, SearchResultWire};
use anyhow::{Context, Result};
use mdkb_core::ReconcileReport;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for client requests (30 seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Synchronous client for communicating with the daemon
pub struct Client {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Client {
    /// Create a new client with the given socket path
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Create a client with the default socket path
    pub fn with_default_socket() -> Self {
        Self::new(&crate::config::default_socket_path())
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check if the daemon is running (socket exists and responds)
    pub fn is_daemon_running(&self) -> bool {
        if !self.socket_path.exists() {
            return false;
        }
        self.status().is_ok()
    }

    /// Send a request to the daemon and wait for a response
    pub fn send_request(&self, request: &Request) -> Result<Response> {
        let mut stream =
            UnixStream::connect(&self.socket_path).context("Failed to connect to daemon")?;

        stream
            .set_read_timeout(Some(self.timeout))
            .context("Failed to set read timeout")?;
        stream
            .set_write_timeout(Some(self.timeout))
            .context("Failed to set write timeout")?;

        let request_json = serde_json::to_string(request)?;
        stream.write_all(request_json.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .context("Failed to read daemon response")?;

        serde_json::from_str(&response_line).context("Failed to parse daemon response")
    }

    /// Semantic search; `None` uses the daemon's configured defaults
    pub fn search(
        &self,
        query: &str,
        limit: Option<usize>,
        max_distance: Option<f32>,
    ) -> Result<Vec<SearchResultWire>> {
        let request = Request::Search {
            query: query.to_string(),
            limit,
            max_distance,
        };

        match self.send_request(&request)? {
            Response::SearchResults(results) => Ok(results),
            other => Err(unexpected(other)),
        }
    }

    pub fn document_count(&self) -> Result<usize> {
        match self.send_request(&Request::DocumentCount)? {
            Response::Count(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub fn list_documents(&self, offset: usize, limit: Option<usize>) -> Result<Vec<DocumentWire>> {
        match self.send_request(&Request::ListDocuments { offset, limit })? {
            Response::Documents(docs) => Ok(docs),
            other => Err(unexpected(other)),
        }
    }

    /// Run a full reconciliation in the daemon and wait for its report
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        match self.send_request(&Request::Reconcile)? {
            Response::Reconciled(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// Write a new document below the root; returns its record once indexed
    pub fn create_document(&self, filename: &str, content: &str) -> Result<DocumentWire> {
        let request = Request::CreateDocument {
            filename: filename.to_string(),
            content: content.to_string(),
        };
        match self.send_request(&request)? {
            Response::Document(doc) => Ok(doc),
            other => Err(unexpected(other)),
        }
    }

    /// Replace an existing document; returns its record once re-indexed
    pub fn update_document(&self, filename: &str, content: &str) -> Result<DocumentWire> {
        let request = Request::UpdateDocument {
            filename: filename.to_string(),
            content: content.to_string(),
        };
        match self.send_request(&request)? {
            Response::Document(doc) => Ok(doc),
            other => Err(unexpected(other)),
        }
    }

    pub fn delete_document(&self, filename: &str) -> Result<()> {
        let request = Request::DeleteDocument {
            filename: filename.to_string(),
        };
        match self.send_request(&request)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Document files on disk, relative to the daemon's root
    pub fn list_files(&self) -> Result<Vec<String>> {
        match self.send_request(&Request::ListFiles)? {
            Response::Files(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    /// Get daemon status
    pub fn status(&self) -> Result<DaemonStatus> {
        match self.send_request(&Request::Status)? {
            Response::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the daemon to exit
    pub fn shutdown(&self) -> Result<()> {
        match self.send_request(&Request::Shutdown)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> anyhow::Error {
    match response {
        Response::Error { cause, message } => {
            anyhow::anyhow!("Daemon error ({}): {message}", cause_name(cause))
        }
        _ => anyhow::anyhow!("Unexpected response from daemon"),
    }
}

fn cause_name(cause: crate::protocol::ErrorCause) -> &'static str {
    use crate::protocol::ErrorCause;
    match cause {
        ErrorCause::InvalidRequest => "invalid request",
        ErrorCause::Embedding => "embedding",
        ErrorCause::Store => "store",
        ErrorCause::Timeout => "timeout",
        ErrorCause::Internal => "internal",
    }
}
