//! Per-path in-flight tracking
//!
//! At most one reconciliation of a given path runs at a time. A request for a
//! path that is already being reconciled is coalesced: it marks the running
//! claim dirty, and the claim holder runs once more after it finishes, so the
//! last on-disk state always wins without two writers racing on one record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared set of paths currently being reconciled
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    // path -> rerun requested while in flight
    paths: Arc<Mutex<HashMap<PathBuf, bool>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` for reconciliation.
    ///
    /// Returns `None` if another task holds it; that task is asked to rerun.
    pub fn try_claim(&self, path: &Path) -> Option<Claim> {
        let mut paths = self.lock();
        if let Some(rerun) = paths.get_mut(path) {
            *rerun = true;
            return None;
        }
        paths.insert(path.to_path_buf(), false);
        Some(Claim {
            inflight: self.clone(),
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, bool>> {
        // The map holds plain flags; a panic cannot leave it inconsistent
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to reconcile one path. Released on [`complete`](Claim::complete) or drop.
#[derive(Debug)]
pub struct Claim {
    inflight: InFlight,
    path: PathBuf,
    released: bool,
}

impl Claim {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finish one pass.
    ///
    /// Returns true if another request arrived meanwhile; the claim is kept and
    /// the caller must reconcile again. Returns false once the path is released.
    pub fn complete(&mut self) -> bool {
        if self.released {
            return false;
        }
        let mut paths = self.inflight.lock();
        match paths.get_mut(&self.path) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                paths.remove(&self.path);
                self.released = true;
                false
            }
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.released {
            self.inflight.lock().remove(&self.path);
        }
    }
}
