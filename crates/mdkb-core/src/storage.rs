//! Document store
//!
//! [`DocumentStore`] is the only way the rest of the crate touches persisted
//! documents. [`SqliteStore`] implements it on a single SQLite file.
//!
//! Schema:
//! - documents: path (unique), fingerprint, content, embedding, indexed_at, updated_at
//! - index_state: key/value metadata (the embedding dimension the store was created with)

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default SQLite busy timeout
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    fingerprint TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    indexed_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS index_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_indexed_at ON documents(indexed_at);
";

const DIMENSION_KEY: &str = "embedding_dim";

/// Store opened with a dimension different from the one it was created with
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("store was created with embedding dimension {stored}, but {configured} is configured")]
pub struct DimensionMismatch {
    pub stored: usize,
    pub configured: usize,
}

/// Metadata of an indexed document, without content or embedding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub path: PathBuf,
    pub fingerprint: String,
    /// Unix milliseconds of first successful index
    pub indexed_at: i64,
    /// Unix milliseconds of the last successful (re-)embed
    pub updated_at: i64,
}

/// A nearest-neighbor candidate
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub path: PathBuf,
    pub content: String,
    pub distance: f32,
}

/// Persisted documents keyed by path.
///
/// Every method is atomic per record: an `upsert` replaces content,
/// fingerprint and embedding together or not at all.
pub trait DocumentStore: Send + Sync {
    /// Insert or replace the record for `path`
    fn upsert(&self, path: &Path, content: &str, embedding: &[f32], fingerprint: &str) -> Result<()>;

    /// Remove the record for `path`. Returns false if there was none.
    fn delete(&self, path: &Path) -> Result<bool>;

    /// Stored fingerprint for one path
    fn fingerprint(&self, path: &Path) -> Result<Option<String>>;

    /// Every (path, fingerprint) pair, sorted by path
    fn list_fingerprints(&self) -> Result<Vec<(PathBuf, String)>>;

    fn count(&self) -> Result<usize>;

    /// Summaries, most recently indexed first
    fn list(&self, offset: usize, limit: usize) -> Result<Vec<DocumentSummary>>;

    /// Summary of a single record
    fn get(&self, path: &Path) -> Result<Option<DocumentSummary>>;

    /// Up to `limit` records closest to `vector` by cosine distance,
    /// ascending, ties broken by path
    fn nearest_neighbors(&self, vector: &[f32], limit: usize) -> Result<Vec<Neighbor>>;

    /// Embedding dimension every record has
    fn dimension(&self) -> usize;
}

/// SQLite-backed [`DocumentStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    dimension: usize,
}

impl SqliteStore {
    /// Open or create a store at path
    ///
    /// Fails with [`DimensionMismatch`] if the store was created with another dimension.
    pub fn new(path: &Path, dimension: usize, timeout: Duration) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.busy_timeout(timeout)?;

        // WAL keeps readers in other processes off the writer's lock
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        Self::init(conn, dimension)
    }

    /// Open in-memory store (for testing)
    pub fn in_memory(dimension: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, dimension)
    }

    fn init(conn: Connection, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            bail!("Embedding dimension must be positive");
        }
        conn.execute_batch(SCHEMA)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM index_state WHERE key = ?",
                params![DIMENSION_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(value) => {
                let stored: usize = value
                    .parse()
                    .with_context(|| format!("Corrupt stored embedding dimension: {value}"))?;
                if stored != dimension {
                    return Err(DimensionMismatch {
                        stored,
                        configured: dimension,
                    }
                    .into());
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO index_state (key, value) VALUES (?, ?)",
                    params![DIMENSION_KEY, dimension.to_string()],
                )?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            dimension,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied row:
        // every write is a single statement.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for SqliteStore {
    fn upsert(&self, path: &Path, content: &str, embedding: &[f32], fingerprint: &str) -> Result<()> {
        if embedding.len() != self.dimension {
            bail!(
                "Embedding dimension mismatch for {}: expected {}, got {}",
                path.display(),
                self.dimension,
                embedding.len()
            );
        }
        let bytes = encode_embedding(embedding);
        let now = now_millis();

        // updated_at strictly advances even when two writes land in the same millisecond
        self.conn().execute(
            "INSERT INTO documents (path, fingerprint, content, embedding, indexed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(path) DO UPDATE SET
                 fingerprint = excluded.fingerprint,
                 content = excluded.content,
                 embedding = excluded.embedding,
                 updated_at = MAX(excluded.updated_at, documents.updated_at + 1)",
            params![path_key(path)?, fingerprint, content, bytes, now],
        )?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM documents WHERE path = ?", params![path_key(path)?])?;
        Ok(removed > 0)
    }

    fn fingerprint(&self, path: &Path) -> Result<Option<String>> {
        let fingerprint = self
            .conn()
            .query_row(
                "SELECT fingerprint FROM documents WHERE path = ?",
                params![path_key(path)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fingerprint)
    }

    fn list_fingerprints(&self) -> Result<Vec<(PathBuf, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT path, fingerprint FROM documents ORDER BY path")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((path_from_key(&row.get::<_, String>(0)?), row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn list(&self, offset: usize, limit: usize) -> Result<Vec<DocumentSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT path, fingerprint, indexed_at, updated_at FROM documents
             ORDER BY indexed_at DESC, path ASC
             LIMIT ? OFFSET ?",
        )?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get(&self, path: &Path) -> Result<Option<DocumentSummary>> {
        let summary = self
            .conn()
            .query_row(
                "SELECT path, fingerprint, indexed_at, updated_at FROM documents WHERE path = ?",
                params![path_key(path)?],
                summary_from_row,
            )
            .optional()?;
        Ok(summary)
    }

    fn nearest_neighbors(&self, vector: &[f32], limit: usize) -> Result<Vec<Neighbor>> {
        if vector.len() != self.dimension {
            bail!(
                "Query vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            );
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Scoring and content fetch share one lock so a concurrent upsert
        // cannot pair a new snippet with a stale distance
        let conn = self.conn();
        let rows: Vec<(String, Vec<u8>)> = {
            let mut stmt = conn.prepare_cached("SELECT path, embedding FROM documents")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut scored: Vec<(String, f32)> = rows
            .into_iter()
            .map(|(path, bytes)| {
                let embedding = decode_embedding(&bytes);
                let distance = cosine_distance(vector, &embedding);
                (path, distance)
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);

        let mut stmt = conn.prepare_cached("SELECT content FROM documents WHERE path = ?")?;
        let mut neighbors = Vec::with_capacity(scored.len());
        for (path, distance) in scored {
            let content: String = stmt.query_row(params![path], |row| row.get(0))?;
            neighbors.push(Neighbor {
                path: path_from_key(&path),
                content,
                distance,
            });
        }
        Ok(neighbors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn summary_from_row(row: &rusqlite::Row) -> rusqlite::Result<DocumentSummary> {
    Ok(DocumentSummary {
        path: path_from_key(&row.get::<_, String>(0)?),
        fingerprint: row.get(1)?,
        indexed_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

/// Key under which a path is stored.
///
/// Keys must round-trip exactly, so paths that are not valid UTF-8 are refused
/// instead of being stored under a lossy name.
fn path_key(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Path is not valid UTF-8: {}", path.display()))
}

fn path_from_key(key: &str) -> PathBuf {
    PathBuf::from(key)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine distance in `[0, 2]`. A zero vector is treated as orthogonal to everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 2.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    (1.0 - similarity).clamp(0.0, 2.0) as f32
}
