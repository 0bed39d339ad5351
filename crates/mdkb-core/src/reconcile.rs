//! Reconciliation: converging the store to the filesystem
//!
//! A full run scans the tree, compares every fingerprint with the store, and
//! applies only the differences. A targeted run does the same for one path.
//! Both go through the same per-path step, which re-reads the file at apply
//! time, so whichever run finishes last writes what is actually on disk.
//!
//! Failures are per item: a file whose embedding or store write fails is left
//! exactly as it was and counted in the report; the run carries on.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::embedder::EmbeddingClient;
use crate::inflight::InFlight;
use crate::scanner::{ScanOutcome, Scanner};
use crate::storage::DocumentStore;

/// Paths grouped by the action a full reconciliation takes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub creates: Vec<PathBuf>,
    pub updates: Vec<PathBuf>,
    pub deletes: Vec<PathBuf>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }
}

/// Classify every path in the scan and the index.
///
/// Indexed paths that failed to scan are left alone: their disk state is
/// unknown, so they are neither updated nor deleted.
pub fn plan(scan: &ScanOutcome, indexed: &[(PathBuf, String)]) -> ChangeSet {
    let indexed_map: HashMap<&Path, &str> = indexed
        .iter()
        .map(|(path, fp)| (path.as_path(), fp.as_str()))
        .collect();

    let mut changes = ChangeSet::default();
    for file in &scan.files {
        match indexed_map.get(file.path.as_path()) {
            None => changes.creates.push(file.path.clone()),
            Some(fp) if *fp == file.fingerprint => changes.unchanged += 1,
            Some(_) => changes.updates.push(file.path.clone()),
        }
    }

    let current: HashSet<&Path> = scan.files.iter().map(|f| f.path.as_path()).collect();
    for (path, _) in indexed {
        if !current.contains(path.as_path()) && !scan.is_unknown(path) {
            changes.deletes.push(path.clone());
        }
    }
    changes.deletes.sort();

    changes
}

/// A classified full scan, ready to apply
#[derive(Debug, Clone, Default)]
pub struct FullPlan {
    pub changes: ChangeSet,
    pub scan_errors: usize,
}

impl FullPlan {
    /// Paths needing work: creates, then updates, then deletes
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.changes
            .creates
            .iter()
            .chain(&self.changes.updates)
            .chain(&self.changes.deletes)
    }

    /// Report seeded with the counts known before applying anything
    pub fn report(&self) -> ReconcileReport {
        ReconcileReport {
            unchanged: self.changes.unchanged,
            scan_errors: self.scan_errors,
            ..Default::default()
        }
    }
}

/// What one targeted reconciliation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOutcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
    /// Another reconciliation of the same path was in flight and will rerun
    Coalesced,
    /// Nothing was written; the record is as it was
    Failed(String),
}

/// One item that failed during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Counts of what a reconciliation did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Items skipped because embedding or the store write failed
    pub failed: usize,
    /// Items handed to a reconciliation already in flight for the same path
    pub coalesced: usize,
    /// Files or directories that could not be read
    pub scan_errors: usize,
    pub failures: Vec<ItemFailure>,
    pub duration_ms: u64,
}

impl ReconcileReport {
    /// True if nothing failed and the whole tree could be read
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.scan_errors == 0
    }

    /// Number of store mutations applied
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn log_summary(&self) {
        tracing::info!(
            "Reconciliation finished in {}ms: {} created, {} updated, {} deleted, {} failed, {} coalesced",
            self.duration_ms,
            self.created,
            self.updated,
            self.deleted,
            self.failed,
            self.coalesced
        );
    }

    pub fn record(&mut self, path: &Path, outcome: &PathOutcome) {
        match outcome {
            PathOutcome::Created => self.created += 1,
            PathOutcome::Updated => self.updated += 1,
            PathOutcome::Deleted => self.deleted += 1,
            PathOutcome::Unchanged => self.unchanged += 1,
            PathOutcome::Coalesced => self.coalesced += 1,
            PathOutcome::Failed(message) => {
                self.failed += 1;
                self.failures.push(ItemFailure {
                    path: path.to_path_buf(),
                    message: message.clone(),
                });
            }
        }
    }
}

/// Applies changes from the filesystem to the store
pub struct Reconciler {
    scanner: Scanner,
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn EmbeddingClient>,
    inflight: InFlight,
}

impl Reconciler {
    pub fn new(
        scanner: Scanner,
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self {
            scanner,
            store,
            embedder,
            inflight: InFlight::new(),
        }
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingClient> {
        &self.embedder
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    /// Scan the whole tree and classify every path against the index.
    ///
    /// Fails only if the root cannot be read or the index cannot be listed.
    pub fn plan_full(&self) -> Result<FullPlan> {
        let scan = self.scanner.scan()?;
        let indexed = self
            .store
            .list_fingerprints()
            .context("Failed to list indexed fingerprints")?;
        let changes = plan(&scan, &indexed);

        tracing::info!(
            "Reconciling {}: {} new, {} changed, {} removed, {} unchanged",
            self.scanner.root().display(),
            changes.creates.len(),
            changes.updates.len(),
            changes.deletes.len(),
            changes.unchanged
        );

        Ok(FullPlan {
            changes,
            scan_errors: scan.errors.len(),
        })
    }

    /// Scan the whole tree and apply the differences.
    ///
    /// Per-item problems end up in the report rather than failing the run.
    pub fn reconcile_full(&self) -> Result<ReconcileReport> {
        let start = Instant::now();
        let plan = self.plan_full()?;
        let mut report = plan.report();

        for path in plan.paths() {
            let outcome = self.reconcile_path(path);
            report.record(path, &outcome);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report.log_summary();
        Ok(report)
    }

    /// Reconcile one path against what is on disk right now.
    ///
    /// If the path is already being reconciled, returns
    /// [`PathOutcome::Coalesced`] and the running task repeats its pass.
    pub fn reconcile_path(&self, path: &Path) -> PathOutcome {
        let Some(mut claim) = self.inflight.try_claim(path) else {
            tracing::debug!("Coalesced reconciliation of {}", path.display());
            return PathOutcome::Coalesced;
        };

        loop {
            let outcome = match self.apply(path) {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = format!("{e:#}");
                    tracing::warn!("Failed to reconcile {}: {}", path.display(), message);
                    PathOutcome::Failed(message)
                }
            };
            if !claim.complete() {
                return outcome;
            }
            tracing::debug!("Re-running reconciliation of {}", path.display());
        }
    }

    fn apply(&self, path: &Path) -> Result<PathOutcome> {
        let indexed = self
            .store
            .fingerprint(path)
            .context("Failed to read stored fingerprint")?;
        let document = self
            .scanner
            .load(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        match (document, indexed) {
            (None, None) => Ok(PathOutcome::Unchanged),
            (None, Some(_)) => {
                self.store.delete(path).context("Failed to delete record")?;
                tracing::info!("Removed {}", path.display());
                Ok(PathOutcome::Deleted)
            }
            (Some(doc), Some(fp)) if fp == doc.fingerprint => {
                tracing::debug!("Unchanged {}", path.display());
                Ok(PathOutcome::Unchanged)
            }
            (Some(doc), indexed) => {
                let embedding = self
                    .embedder
                    .embed(&doc.content)
                    .context("Embedding failed")?;
                self.store
                    .upsert(path, &doc.content, &embedding, &doc.fingerprint)
                    .context("Failed to write record")?;
                if indexed.is_some() {
                    tracing::info!("Updated {}", path.display());
                    Ok(PathOutcome::Updated)
                } else {
                    tracing::info!("Indexed {}", path.display());
                    Ok(PathOutcome::Created)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{ScanError, ScannedFile};

    fn scanned(path: &str, fp: &str) -> ScannedFile {
        ScannedFile {
            path: PathBuf::from(path),
            fingerprint: fp.to_string(),
            size: 1,
            modified: None,
        }
    }

    fn indexed(entries: &[(&str, &str)]) -> Vec<(PathBuf, String)> {
        entries
            .iter()
            .map(|(p, f)| (PathBuf::from(p), f.to_string()))
            .collect()
    }

    #[test]
    fn test_plan_classifies_each_case() {
        let scan = ScanOutcome {
            files: vec![
                scanned("/n/new.md", "1"),
                scanned("/n/same.md", "2"),
                scanned("/n/changed.md", "3"),
            ],
            errors: vec![],
        };
        let indexed = indexed(&[
            ("/n/changed.md", "old"),
            ("/n/gone.md", "4"),
            ("/n/same.md", "2"),
        ]);

        let changes = plan(&scan, &indexed);
        assert_eq!(changes.creates, vec![PathBuf::from("/n/new.md")]);
        assert_eq!(changes.updates, vec![PathBuf::from("/n/changed.md")]);
        assert_eq!(changes.deletes, vec![PathBuf::from("/n/gone.md")]);
        assert_eq!(changes.unchanged, 1);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_plan_identical_sets_is_empty() {
        let scan = ScanOutcome {
            files: vec![scanned("/n/a.md", "1"), scanned("/n/b.md", "2")],
            errors: vec![],
        };
        let changes = plan(&scan, &indexed(&[("/n/a.md", "1"), ("/n/b.md", "2")]));
        assert!(changes.is_empty());
        assert_eq!(changes.unchanged, 2);
    }

    #[test]
    fn test_plan_keeps_unreadable_paths() {
        let scan = ScanOutcome {
            files: vec![],
            errors: vec![
                ScanError {
                    path: PathBuf::from("/n/locked.md"),
                    message: "permission denied".to_string(),
                },
                ScanError {
                    path: PathBuf::from("/n/private"),
                    message: "permission denied".to_string(),
                },
            ],
        };
        let changes = plan(
            &scan,
            &indexed(&[
                ("/n/locked.md", "1"),
                ("/n/private/x.md", "2"),
                ("/n/gone.md", "3"),
            ]),
        );
        assert_eq!(changes.deletes, vec![PathBuf::from("/n/gone.md")]);
    }

    #[test]
    fn test_report_record_and_cleanliness() {
        let mut report = ReconcileReport::default();
        report.record(Path::new("/n/a.md"), &PathOutcome::Created);
        report.record(Path::new("/n/b.md"), &PathOutcome::Deleted);
        report.record(Path::new("/n/c.md"), &PathOutcome::Coalesced);
        assert!(report.is_clean());
        assert_eq!(report.changes(), 2);

        report.record(Path::new("/n/d.md"), &PathOutcome::Failed("boom".to_string()));
        assert!(!report.is_clean());
        assert_eq!(report.failures[0].path, PathBuf::from("/n/d.md"));
    }
}
