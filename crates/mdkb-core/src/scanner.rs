//! Directory scanning
//!
//! Walks a root directory, keeps files whose extension is in the configured
//! set, and fingerprints them. Unreadable files and directories are reported
//! as non-fatal scan errors so one bad entry never aborts a scan.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::fingerprint::fingerprint;
use crate::text::decode_text;

/// Directories never descended into (matched case-insensitively)
const SKIP_DIRS: &[&str] = &[
    // Version control
    ".git",
    ".svn",
    ".hg",
    // Editors
    ".idea",
    ".vscode",
    ".obsidian",
    ".trash",
    // Dependencies and build output
    "node_modules",
    "vendor",
    "target",
    "dist",
    "build",
    "_site",
    "__pycache__",
    ".venv",
    "venv",
    ".cache",
];

/// Check if a directory should be skipped
pub fn should_skip_dir(name: &str) -> bool {
    SKIP_DIRS.iter().any(|dir| dir.eq_ignore_ascii_case(name))
}

/// An eligible file found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub fingerprint: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// A file or directory that could not be read during a scan
#[derive(Debug, Clone)]
pub struct ScanError {
    pub path: PathBuf,
    pub message: String,
}

/// Result of scanning a tree
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Eligible files, sorted by path
    pub files: Vec<ScannedFile>,
    /// Entries that were skipped because they could not be read
    pub errors: Vec<ScanError>,
}

impl ScanOutcome {
    /// True if `path` is at or below an entry that failed to scan.
    ///
    /// Such paths have unknown on-disk state and must not be treated as deleted.
    pub fn is_unknown(&self, path: &Path) -> bool {
        self.errors.iter().any(|e| path.starts_with(&e.path))
    }
}

/// A document loaded for embedding
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// Fingerprint of the exact bytes `content` was decoded from
    pub fingerprint: String,
    pub content: String,
}

/// Enumerates and reads eligible documents below a root
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    extensions: Vec<String>,
}

impl Scanner {
    /// Create a scanner for `root` accepting the given extensions (with or without a dot)
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        let extensions = extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self {
            root: root.into(),
            extensions,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Check whether a path (existing or not) is inside the root, has an
    /// accepted extension, and is not below a skipped directory.
    ///
    /// Paths that are not valid UTF-8 are never eligible: they cannot be
    /// stored or reported under their exact name.
    pub fn is_eligible(&self, path: &Path) -> bool {
        if path.to_str().is_none() {
            return false;
        }
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if !self.has_accepted_extension(path) {
            return false;
        }

        let mut components = relative.components().peekable();
        while let Some(component) = components.next() {
            // The last component is the file itself
            if components.peek().is_none() {
                break;
            }
            if let Some(name) = component.as_os_str().to_str() {
                if should_skip_dir(name) {
                    return false;
                }
            }
        }
        true
    }

    fn has_accepted_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    /// Scan the whole tree.
    ///
    /// Fails only if the root itself cannot be listed; everything below it
    /// degrades to per-entry scan errors.
    pub fn scan(&self) -> Result<ScanOutcome> {
        fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read root directory: {}", self.root.display()))?;

        let mut candidates = Vec::new();
        let mut errors = Vec::new();
        collect_candidates(self, &self.root, &mut candidates, &mut errors);
        candidates.sort();

        let results: Vec<std::result::Result<Option<ScannedFile>, ScanError>> = candidates
            .par_iter()
            .map(|path| {
                scan_one(path).map_err(|e| ScanError {
                    path: path.clone(),
                    message: e.to_string(),
                })
            })
            .collect();

        let mut files = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(Some(file)) => files.push(file),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Skipping unreadable file {}: {}", e.path.display(), e.message);
                    errors.push(e);
                }
            }
        }

        Ok(ScanOutcome { files, errors })
    }

    /// Scan a single path.
    ///
    /// Returns `Ok(None)` if the path is ineligible, missing, or blank.
    pub fn scan_path(&self, path: &Path) -> std::io::Result<Option<ScannedFile>> {
        if !self.is_eligible(path) {
            return Ok(None);
        }
        match scan_one(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            other => other,
        }
    }

    /// Read and decode a document for embedding.
    ///
    /// The fingerprint is computed from the same bytes the content is decoded
    /// from, so the two can never disagree. Returns `Ok(None)` if the file is
    /// missing, ineligible, or blank.
    pub fn load(&self, path: &Path) -> std::io::Result<Option<LoadedDocument>> {
        if !self.is_eligible(path) {
            return Ok(None);
        }
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if is_blank(&bytes) {
            return Ok(None);
        }
        Ok(Some(LoadedDocument {
            fingerprint: fingerprint(&bytes),
            content: decode_text(&bytes),
        }))
    }
}

fn collect_candidates(
    scanner: &Scanner,
    dir: &Path,
    files: &mut Vec<PathBuf>,
    errors: &mut Vec<ScanError>,
) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Skipping unreadable directory {}: {}", dir.display(), e);
            errors.push(ScanError {
                path: dir.to_path_buf(),
                message: e.to_string(),
            });
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors.push(ScanError {
                    path: dir.to_path_buf(),
                    message: e.to_string(),
                });
                continue;
            }
        };
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            let skip = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(should_skip_dir);
            if !skip {
                collect_candidates(scanner, &path, files, errors);
            }
        } else if file_type.is_file() || file_type.is_symlink() {
            // Symlinked directories are never followed; symlinked files are
            // checked again when read.
            if scanner.is_eligible(&path) {
                files.push(path);
            } else if path.to_str().is_none() && scanner.has_accepted_extension(&path) {
                // Reported rather than skipped so any record under it is kept
                tracing::warn!("Skipping file with non-UTF-8 name {}", path.display());
                errors.push(ScanError {
                    path,
                    message: "file name is not valid UTF-8".to_string(),
                });
            }
        }
    }
}

fn scan_one(path: &Path) -> std::io::Result<Option<ScannedFile>> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    if is_blank(&bytes) {
        return Ok(None);
    }
    Ok(Some(ScannedFile {
        path: path.to_path_buf(),
        fingerprint: fingerprint(&bytes),
        size: bytes.len() as u64,
        modified: metadata.modified().ok(),
    }))
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn md() -> Vec<String> {
        vec!["md".to_string()]
    }

    #[test]
    fn test_scan_finds_markdown_sorted() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.md"), "goodbye world").unwrap();
        fs::write(dir.path().join("a.md"), "hello world").unwrap();
        fs::write(dir.path().join("sub/c.md"), "nested").unwrap();
        fs::write(dir.path().join("notes.txt"), "not markdown").unwrap();

        let scanner = Scanner::new(dir.path(), &md());
        let outcome = scanner.scan().unwrap();

        let names: Vec<_> = outcome
            .files
            .iter()
            .map(|f| f.path.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.md"),
                PathBuf::from("b.md"),
                PathBuf::from("sub/c.md")
            ]
        );
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.files[0].size, 11);
        assert_eq!(outcome.files[0].fingerprint, fingerprint(b"hello world"));
    }

    #[test]
    fn test_scan_skips_blank_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("empty.md"), "").unwrap();
        fs::write(dir.path().join("spaces.md"), "  \n\t\n").unwrap();
        fs::write(dir.path().join("real.md"), "content").unwrap();

        let outcome = Scanner::new(dir.path(), &md()).scan().unwrap();
        assert_eq!(outcome.files.len(), 1);
    }

    #[test]
    fn test_scan_skips_ignored_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join(".git/HEAD.md"), "ref").unwrap();
        fs::write(dir.path().join("node_modules/pkg/README.md"), "readme").unwrap();
        fs::write(dir.path().join("kept.md"), "kept").unwrap();

        let outcome = Scanner::new(dir.path(), &md()).scan().unwrap();
        assert_eq!(outcome.files.len(), 1);
        assert!(outcome.files[0].path.ends_with("kept.md"));
    }

    #[test]
    fn test_scan_missing_root_is_error() {
        let scanner = Scanner::new("/nonexistent/mdkb/root", &md());
        assert!(scanner.scan().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_nonfatal() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked.md");
        fs::write(&locked, "secret").unwrap();
        fs::write(dir.path().join("open.md"), "open").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root can read anything; only assert when permissions are enforced.
        if fs::read(&locked).is_ok() {
            return;
        }

        let outcome = Scanner::new(dir.path(), &md()).scan().unwrap();
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.is_unknown(&locked));

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_name_is_a_scan_error() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        let raw = dir.path().join(OsStr::from_bytes(b"caf\xe9.md"));
        if fs::write(&raw, "latin-1 name").is_err() {
            // Some filesystems reject such names outright
            return;
        }
        fs::write(dir.path().join(OsStr::from_bytes(b"caf\xe9.txt")), "ignored").unwrap();
        fs::write(dir.path().join("plain.md"), "plain").unwrap();

        let scanner = Scanner::new(dir.path(), &md());
        let outcome = scanner.scan().unwrap();
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.is_unknown(&raw));

        assert!(!scanner.is_eligible(&raw));
        assert!(scanner.load(&raw).unwrap().is_none());
    }

    #[test]
    fn test_is_eligible() {
        let scanner = Scanner::new("/notes", &["md".to_string(), ".Markdown".to_string()]);

        assert!(scanner.is_eligible(Path::new("/notes/a.md")));
        assert!(scanner.is_eligible(Path::new("/notes/deep/dir/A.MD")));
        assert!(scanner.is_eligible(Path::new("/notes/b.markdown")));
        assert!(!scanner.is_eligible(Path::new("/notes/a.txt")));
        assert!(!scanner.is_eligible(Path::new("/notes/README")));
        assert!(!scanner.is_eligible(Path::new("/elsewhere/a.md")));
        assert!(!scanner.is_eligible(Path::new("/notes/.git/a.md")));
        assert!(!scanner.is_eligible(Path::new("/notes/node_modules/x/a.md")));
    }

    #[test]
    fn test_root_components_do_not_count_as_skipped() {
        let scanner = Scanner::new("/home/user/.cache/notes", &md());
        assert!(scanner.is_eligible(Path::new("/home/user/.cache/notes/a.md")));
    }

    #[test]
    fn test_scan_path_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.md");
        fs::write(&path, "hello world").unwrap();
        let scanner = Scanner::new(dir.path(), &md());

        let scanned = scanner.scan_path(&path).unwrap().unwrap();
        let loaded = scanner.load(&path).unwrap().unwrap();
        assert_eq!(scanned.fingerprint, loaded.fingerprint);
        assert_eq!(loaded.content, "hello world");

        fs::remove_file(&path).unwrap();
        assert!(scanner.scan_path(&path).unwrap().is_none());
        assert!(scanner.load(&path).unwrap().is_none());
    }

    #[test]
    fn test_should_skip_dir_case_insensitive() {
        assert!(should_skip_dir(".git"));
        assert!(should_skip_dir("Node_Modules"));
        assert!(!should_skip_dir("docs"));
    }
}
