//! IPC protocol for daemon communication
//!
//! Newline-delimited JSON over a Unix socket: one request line, one response
//! line, then the connection closes.

use mdkb_core::{DocumentSummary, FileError, ReconcileReport, SearchError, SearchHit};
use serde::{Deserialize, Serialize};

use crate::watcher::WatchState;

/// Request from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Semantic search; unset fields use the daemon's configured defaults
    Search {
        query: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        max_distance: Option<f32>,
    },
    /// Number of indexed documents
    DocumentCount,
    /// Page through indexed documents, most recently indexed first
    ListDocuments {
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Run a full reconciliation now and report it
    Reconcile,
    /// Write a new document below the root and index it
    CreateDocument { filename: String, content: String },
    /// Replace an existing document and re-index it
    UpdateDocument { filename: String, content: String },
    /// Remove a document from disk and from the index
    DeleteDocument { filename: String },
    /// Documents on disk below the root, relative to it
    ListFiles,
    /// Get daemon status
    Status,
    /// Shutdown daemon
    Shutdown,
}

/// Response from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    SearchResults(Vec<SearchResultWire>),
    Count(usize),
    Documents(Vec<DocumentWire>),
    /// The record of a document just written
    Document(DocumentWire),
    Files(Vec<String>),
    Reconciled(ReconcileReport),
    Status(DaemonStatus),
    /// Success with no data
    Ok,
    Error { cause: ErrorCause, message: String },
}

impl Response {
    pub fn error(cause: ErrorCause, message: impl Into<String>) -> Self {
        Self::Error {
            cause,
            message: message.into(),
        }
    }
}

impl From<SearchError> for Response {
    fn from(e: SearchError) -> Self {
        let cause = match e {
            SearchError::InvalidQuery
            | SearchError::InvalidLimit(_)
            | SearchError::InvalidMaxDistance(_) => ErrorCause::InvalidRequest,
            SearchError::Embedding(_) => ErrorCause::Embedding,
            SearchError::Store(_) => ErrorCause::Store,
            SearchError::Timeout(_) => ErrorCause::Timeout,
        };
        Self::error(cause, e.to_string())
    }
}

impl From<FileError> for Response {
    fn from(e: FileError) -> Self {
        let cause = if e.is_invalid_request() {
            ErrorCause::InvalidRequest
        } else {
            ErrorCause::Internal
        };
        Self::error(cause, e.to_string())
    }
}

/// Which part of the system a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    InvalidRequest,
    Embedding,
    Store,
    Timeout,
    Internal,
}

/// Search result for wire protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultWire {
    pub path: String,
    pub snippet: String,
    pub distance: f32,
}

impl From<SearchHit> for SearchResultWire {
    fn from(hit: SearchHit) -> Self {
        Self {
            path: hit.path.to_string_lossy().into_owned(),
            snippet: hit.snippet,
            distance: hit.distance,
        }
    }
}

/// Document summary for wire protocol; timestamps are Unix milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentWire {
    pub path: String,
    pub indexed_at: i64,
    pub updated_at: i64,
}

impl From<DocumentSummary> for DocumentWire {
    fn from(doc: DocumentSummary) -> Self {
        Self {
            path: doc.path.to_string_lossy().into_owned(),
            indexed_at: doc.indexed_at,
            updated_at: doc.updated_at,
        }
    }
}

/// Daemon status information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub uptime_secs: u64,
    pub root: String,
    pub watch_state: WatchState,
    pub document_count: usize,
    /// True after a clean full reconciliation with no item errors since
    pub fresh: bool,
    /// Reconciliations currently queued or running
    #[serde(default)]
    pub pending: usize,
    #[serde(default)]
    pub last_full_reconcile: Option<ReconcileReport>,
    /// Unix milliseconds when the last full reconciliation finished
    #[serde(default)]
    pub last_full_reconcile_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_search_request_optional_fields() {
        let json = r#"{"Search":{"query":"rust"}}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            request,
            Request::Search {
                query: "rust".to_string(),
                limit: None,
                max_distance: None
            }
        );
    }

    #[test]
    fn test_unit_requests_are_strings() {
        assert_eq!(serde_json::to_string(&Request::Status).unwrap(), "\"Status\"");
        let request: Request = serde_json::from_str("\"DocumentCount\"").unwrap();
        assert_eq!(request, Request::DocumentCount);
    }

    #[test]
    fn test_list_documents_defaults() {
        let request: Request = serde_json::from_str(r#"{"ListDocuments":{}}"#).unwrap();
        assert_eq!(
            request,
            Request::ListDocuments {
                offset: 0,
                limit: None
            }
        );
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::error(ErrorCause::Embedding, "connection refused");
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(
            json,
            r#"{"Error":{"cause":"embedding","message":"connection refused"}}"#
        );
    }

    #[test]
    fn test_search_error_causes_are_distinguishable() {
        let cause = |e: SearchError| match Response::from(e) {
            Response::Error { cause, .. } => cause,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(cause(SearchError::InvalidLimit(0)), ErrorCause::InvalidRequest);
        assert_eq!(
            cause(SearchError::Embedding(anyhow::anyhow!("down"))),
            ErrorCause::Embedding
        );
        assert_eq!(
            cause(SearchError::Store(anyhow::anyhow!("locked"))),
            ErrorCause::Store
        );
        assert_eq!(cause(SearchError::Timeout(5)), ErrorCause::Timeout);
    }

    #[test]
    fn test_document_write_requests() {
        let json = r##"{"CreateDocument":{"filename":"a.md","content":"# A"}}"##;
        assert_eq!(
            serde_json::from_str::<Request>(json).unwrap(),
            Request::CreateDocument {
                filename: "a.md".to_string(),
                content: "# A".to_string()
            }
        );
        // Content is required, not defaulted
        assert!(serde_json::from_str::<Request>(r#"{"UpdateDocument":{"filename":"a.md"}}"#).is_err());
        assert_eq!(serde_json::to_string(&Request::ListFiles).unwrap(), "\"ListFiles\"");
    }

    #[test]
    fn test_file_error_causes() {
        let cause = |e: FileError| match Response::from(e) {
            Response::Error { cause, .. } => cause,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            cause(FileError::AlreadyExists("a.md".to_string())),
            ErrorCause::InvalidRequest
        );
        assert_eq!(cause(FileError::EmptyContent), ErrorCause::InvalidRequest);
        assert_eq!(
            cause(FileError::Io {
                name: "a.md".to_string(),
                source: std::io::Error::other("read-only file system"),
            }),
            ErrorCause::Internal
        );
    }

    #[test]
    fn test_document_wire_from_summary() {
        let wire = DocumentWire::from(DocumentSummary {
            path: PathBuf::from("/n/a.md"),
            fingerprint: "ab".to_string(),
            indexed_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_500,
        });
        assert_eq!(wire.path, "/n/a.md");
        assert_eq!(wire.updated_at, 1_700_000_000_500);
    }

    #[test]
    fn test_status_roundtrip_with_report() {
        let status = DaemonStatus {
            uptime_secs: 42,
            root: "/n".to_string(),
            watch_state: WatchState::Watching,
            document_count: 3,
            fresh: true,
            pending: 0,
            last_full_reconcile: Some(ReconcileReport {
                created: 3,
                ..Default::default()
            }),
            last_full_reconcile_at: Some(1),
        };
        let json = serde_json::to_string(&Response::Status(status.clone())).unwrap();
        assert_eq!(
            serde_json::from_str::<Response>(&json).unwrap(),
            Response::Status(status)
        );
    }
}
