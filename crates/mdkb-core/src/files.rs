//! Writing documents under the root
//!
//! Clients name documents by a plain file name directly below the root.
//! These functions only touch the filesystem; the index catches up through
//! the usual reconciliation of the written path.

use anyhow::Result;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use crate::scanner::Scanner;

/// Why a document could not be written or removed
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("invalid file name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("content is required")]
    EmptyContent,
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("failed to access {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl FileError {
    /// True when the caller asked for something impossible, as opposed to an I/O failure
    pub fn is_invalid_request(&self) -> bool {
        !matches!(self, Self::Io { .. })
    }

    fn io(name: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(name.to_string()),
            io::ErrorKind::NotFound => Self::NotFound(name.to_string()),
            _ => Self::Io {
                name: name.to_string(),
                source,
            },
        }
    }
}

/// Map a client-supplied file name to its path below the root.
///
/// Only a single normal component with an indexed extension is accepted, so
/// the result can never point outside the root or into a skipped directory.
pub fn resolve(scanner: &Scanner, name: &str) -> Result<PathBuf, FileError> {
    let invalid = |reason: &str| FileError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("file name is required"));
    }
    if name.contains(['/', '\\']) {
        return Err(invalid("must not contain path separators"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(invalid("must be a plain file name")),
    }

    let path = scanner.root().join(name);
    if !scanner.is_eligible(&path) {
        return Err(invalid(&format!(
            "must end with .{}",
            scanner.extensions().join(" or .")
        )));
    }
    Ok(path)
}

/// Create a new document. Fails if one already exists under that name.
pub fn create(scanner: &Scanner, name: &str, content: &str) -> Result<PathBuf, FileError> {
    let path = resolve(scanner, name)?;
    check_content(content)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| FileError::io(name, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| FileError::io(name, e))?;
    tracing::info!("Created {}", path.display());
    Ok(path)
}

/// Replace the content of an existing document
pub fn update(scanner: &Scanner, name: &str, content: &str) -> Result<PathBuf, FileError> {
    let path = resolve(scanner, name)?;
    check_content(content)?;
    check_regular_file(&path, name)?;

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| FileError::io(name, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| FileError::io(name, e))?;
    tracing::info!("Rewrote {}", path.display());
    Ok(path)
}

/// Remove a document from disk
pub fn delete(scanner: &Scanner, name: &str) -> Result<PathBuf, FileError> {
    let path = resolve(scanner, name)?;
    check_regular_file(&path, name)?;

    fs::remove_file(&path).map_err(|e| FileError::io(name, e))?;
    tracing::info!("Deleted {}", path.display());
    Ok(path)
}

/// Every eligible document on disk, relative to the root, sorted
pub fn list(scanner: &Scanner) -> Result<Vec<String>> {
    let outcome = scanner.scan()?;
    let names = outcome
        .files
        .iter()
        .filter_map(|file| file.path.strip_prefix(scanner.root()).ok())
        .map(|relative| relative.to_string_lossy().into_owned())
        .collect();
    Ok(names)
}

fn check_content(content: &str) -> Result<(), FileError> {
    // Blank files are never indexed
    if content.trim().is_empty() {
        return Err(FileError::EmptyContent);
    }
    Ok(())
}

fn check_regular_file(path: &Path, name: &str) -> Result<(), FileError> {
    let metadata = fs::symlink_metadata(path).map_err(|e| FileError::io(name, e))?;
    if !metadata.is_file() {
        return Err(FileError::InvalidName {
            name: name.to_string(),
            reason: "not a regular file".to_string(),
        });
    }
    Ok(())
}
