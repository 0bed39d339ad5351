//! Configuration loading for mdkb.
//!
//! Layers, later wins: built-in defaults, the system file, the user file (or
//! `--config`), environment variables, command-line flags. Each layer is a
//! [`Config`] of optional fields; [`Settings::resolve`] turns the merged
//! result into one immutable value with every default filled in.

use anyhow::Context;
use directories::ProjectDirs;
use mdkb_core::embedder::{
    HttpEmbedderConfig, DEFAULT_EMBEDDING_DIM, DEFAULT_EMBEDDING_MODEL, DEFAULT_EMBEDDING_URL,
    DEFAULT_MAX_INPUT_CHARS,
};
use mdkb_core::search::{SearchOptions, DEFAULT_LIMIT, DEFAULT_MAX_DISTANCE};
use mdkb_core::{DimensionMismatch, HttpEmbedder, Reconciler, Scanner, SqliteStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// System-wide config file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/mdkb/config.toml";

/// Default debounce window (500ms)
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Default interval between safety-net full reconciliations (5 minutes)
pub const DEFAULT_RESCAN_SECS: u64 = 300;

/// Rescan interval while file notifications are unavailable
pub const DEFAULT_DEGRADED_RESCAN_SECS: u64 = 30;

pub const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 60;

/// Default per-item reconciliation timeout (covers embed + store write)
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 120;

/// Default number of reconciliations running at once
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Default capacity of the watcher's work queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Invalid or missing configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no document root configured (set MDKB_DIR, index.root, or --root)")]
    MissingRoot,

    #[error("document root does not exist: {}", .0.display())]
    RootNotFound(PathBuf),

    #[error("document root is not a directory: {}", .0.display())]
    RootNotDirectory(PathBuf),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("could not determine a default {0} location")]
    NoDefaultLocation(&'static str),

    #[error("embedding dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    pub index: Option<IndexConfig>,
    pub store: Option<StoreConfig>,
    pub embedding: Option<EmbeddingConfig>,
    pub watch: Option<WatchConfig>,
    pub search: Option<SearchConfig>,
    pub daemon: Option<DaemonConfig>,
    pub log: Option<LogConfig>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct IndexConfig {
    pub root: Option<PathBuf>,
    pub extensions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub dimension: Option<usize>,
    pub api_key: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_input_chars: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct WatchConfig {
    pub debounce_ms: Option<u64>,
    pub rescan_secs: Option<u64>,
    pub degraded_rescan_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct SearchConfig {
    pub default_limit: Option<usize>,
    pub default_max_distance: Option<f32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct DaemonConfig {
    pub socket: Option<PathBuf>,
    pub reconcile_timeout_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct LogConfig {
    pub level: Option<String>,
}

/// Field-wise overlay: every `Some` in `over` replaces the value in `base`
trait Overlay {
    fn overlay(self, over: Self) -> Self;
}

impl<T: Overlay> Overlay for Option<T> {
    fn overlay(self, over: Self) -> Self {
        match (self, over) {
            (Some(base), Some(over)) => Some(base.overlay(over)),
            (base, over) => over.or(base),
        }
    }
}

macro_rules! overlay_fields {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl Overlay for $ty {
            fn overlay(self, over: Self) -> Self {
                Self { $($field: over.$field.or(self.$field)),* }
            }
        }
    };
}

overlay_fields!(IndexConfig { root, extensions });
overlay_fields!(StoreConfig { path, timeout_secs });
overlay_fields!(EmbeddingConfig { url, model, dimension, api_key, timeout_secs, max_input_chars });
overlay_fields!(WatchConfig { debounce_ms, rescan_secs, degraded_rescan_secs });
overlay_fields!(SearchConfig { default_limit, default_max_distance, timeout_secs });
overlay_fields!(DaemonConfig { socket, reconcile_timeout_secs, max_concurrent, queue_capacity });
overlay_fields!(LogConfig { level });

impl Config {
    /// Overlay `over` on top of `self`
    #[must_use]
    pub fn merge(self, over: Config) -> Config {
        Config {
            index: self.index.overlay(over.index),
            store: self.store.overlay(over.store),
            embedding: self.embedding.overlay(over.embedding),
            watch: self.watch.overlay(over.watch),
            search: self.search.overlay(over.search),
            daemon: self.daemon.overlay(over.daemon),
            log: self.log.overlay(over.log),
        }
    }

    /// Build a layer from environment variables.
    ///
    /// `lookup` is `std::env::var(..).ok()` in production and a map in tests.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let index = IndexConfig {
            root: get("MDKB_DIR").map(PathBuf::from),
            extensions: get("MDKB_EXTENSIONS").map(|v| parse_list(&v)),
        };
        let store = StoreConfig {
            path: get("MDKB_DB_PATH").map(PathBuf::from),
            timeout_secs: None,
        };
        let embedding = EmbeddingConfig {
            url: get("EMBEDDING_URL"),
            model: get("EMBEDDING_MODEL"),
            dimension: parse_env(&get, "EMBEDDING_DIMENSION")?,
            api_key: get("EMBEDDING_API_KEY"),
            timeout_secs: parse_env(&get, "EMBEDDING_TIMEOUT_SECS")?,
            max_input_chars: None,
        };
        let watch = WatchConfig {
            debounce_ms: parse_env(&get, "MDKB_DEBOUNCE_MS")?,
            ..Default::default()
        };
        let daemon = DaemonConfig {
            socket: get("MDKB_SOCKET").map(PathBuf::from),
            ..Default::default()
        };
        let log = LogConfig {
            level: get("MDKB_LOG_LEVEL"),
        };

        Ok(Config {
            index: Some(index),
            store: Some(store),
            embedding: Some(embedding),
            watch: Some(watch),
            search: None,
            daemon: Some(daemon),
            log: Some(log),
        })
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(key, format!("{v:?}: {e}")))
        })
        .transpose()
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let dirs = ProjectDirs::from("", "", "mdkb").ok_or(ConfigError::NoDefaultLocation("config"))?;
    Ok(dirs.config_dir().join("config.toml"))
}

/// Read one config file. A missing file is an empty layer.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge the file and environment layers.
///
/// An explicit `--config` path must exist; the default locations may not.
pub fn load_layers(
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut config = load_config(Path::new(SYSTEM_CONFIG_PATH))?;

    let user = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            load_config(path)?
        }
        None => match default_config_path() {
            Ok(path) => load_config(&path)?,
            Err(_) => Config::default(),
        },
    };
    config = config.merge(user);

    Ok(config.merge(Config::from_env(lookup)?))
}

/// Default database location
pub fn default_db_path() -> PathBuf {
    ProjectDirs::from("", "", "mdkb").map_or_else(
        || PathBuf::from("/tmp/mdkb/index.db"),
        |dirs| dirs.data_dir().join("index.db"),
    )
}

/// Default daemon socket location
pub fn default_socket_path() -> PathBuf {
    ProjectDirs::from("", "", "mdkb").map_or_else(
        || PathBuf::from("/tmp/mdkb/daemon.sock"),
        |dirs| {
            dirs.runtime_dir()
                .unwrap_or_else(|| dirs.data_dir())
                .join("daemon.sock")
        },
    )
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub root: PathBuf,
    pub extensions: Vec<String>,
    pub db_path: PathBuf,
    pub store_timeout: Duration,
    pub embedding: HttpEmbedderConfig,
    pub debounce: Duration,
    pub rescan_interval: Duration,
    pub degraded_rescan_interval: Duration,
    pub search_defaults: SearchOptions,
    pub search_timeout: Duration,
    pub socket_path: PathBuf,
    pub reconcile_timeout: Duration,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub log_level: String,
}

impl Settings {
    /// Fill defaults and validate. The root must exist and is canonicalized.
    pub fn resolve(config: Config) -> Result<Settings, ConfigError> {
        let index = config.index.unwrap_or_default();
        let store = config.store.unwrap_or_default();
        let embedding = config.embedding.unwrap_or_default();
        let watch = config.watch.unwrap_or_default();
        let search = config.search.unwrap_or_default();
        let daemon = config.daemon.unwrap_or_default();
        let log = config.log.unwrap_or_default();

        let root = index.root.ok_or(ConfigError::MissingRoot)?;
        if !root.exists() {
            return Err(ConfigError::RootNotFound(root));
        }
        if !root.is_dir() {
            return Err(ConfigError::RootNotDirectory(root));
        }
        let root = root.canonicalize().map_err(|source| ConfigError::Read {
            path: root.clone(),
            source,
        })?;

        let extensions = index.extensions.unwrap_or_else(|| vec!["md".to_string()]);
        if extensions.iter().all(|e| e.trim().trim_start_matches('.').is_empty()) {
            return Err(ConfigError::invalid("index.extensions", "at least one extension is required"));
        }

        let dimension = embedding.dimension.unwrap_or(DEFAULT_EMBEDDING_DIM);
        if dimension == 0 {
            return Err(ConfigError::invalid("embedding.dimension", "must be positive"));
        }
        let max_input_chars = embedding.max_input_chars.unwrap_or(DEFAULT_MAX_INPUT_CHARS);
        if max_input_chars == 0 {
            return Err(ConfigError::invalid("embedding.max_input_chars", "must be positive"));
        }

        let search_defaults = SearchOptions {
            limit: search.default_limit.unwrap_or(DEFAULT_LIMIT),
            max_distance: search.default_max_distance.unwrap_or(DEFAULT_MAX_DISTANCE),
        };
        search_defaults
            .validate()
            .map_err(|e| ConfigError::invalid("search", e.to_string()))?;

        let max_concurrent = daemon.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT);
        if max_concurrent == 0 {
            return Err(ConfigError::invalid("daemon.max_concurrent", "must be positive"));
        }
        let queue_capacity = daemon.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            return Err(ConfigError::invalid("daemon.queue_capacity", "must be positive"));
        }

        Ok(Settings {
            root,
            extensions,
            db_path: store.path.unwrap_or_else(default_db_path),
            store_timeout: secs(store.timeout_secs, DEFAULT_STORE_TIMEOUT_SECS),
            embedding: HttpEmbedderConfig {
                url: embedding.url.unwrap_or_else(|| DEFAULT_EMBEDDING_URL.to_string()),
                model: embedding.model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
                dimension,
                api_key: embedding.api_key,
                timeout: secs(embedding.timeout_secs, DEFAULT_EMBEDDING_TIMEOUT_SECS),
                max_input_chars,
            },
            debounce: Duration::from_millis(watch.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)),
            rescan_interval: secs(watch.rescan_secs, DEFAULT_RESCAN_SECS),
            degraded_rescan_interval: secs(watch.degraded_rescan_secs, DEFAULT_DEGRADED_RESCAN_SECS),
            search_defaults,
            search_timeout: secs(search.timeout_secs, DEFAULT_SEARCH_TIMEOUT_SECS),
            socket_path: daemon.socket.unwrap_or_else(default_socket_path),
            reconcile_timeout: secs(daemon.reconcile_timeout_secs, DEFAULT_RECONCILE_TIMEOUT_SECS),
            max_concurrent,
            queue_capacity,
            log_level: log.level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }

    /// Open the store and wire up the scanner and embedding client.
    ///
    /// A store created with another embedding dimension is a [`ConfigError`].
    pub fn open_reconciler(&self) -> anyhow::Result<Reconciler> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = SqliteStore::new(&self.db_path, self.embedding.dimension, self.store_timeout)
            .map_err(|e| match e.downcast_ref::<DimensionMismatch>() {
                Some(mismatch) => anyhow::Error::new(ConfigError::DimensionMismatch(format!(
                    "{mismatch} ({})",
                    self.db_path.display()
                ))),
                None => e.context(format!("Failed to open store {}", self.db_path.display())),
            })?;
        let embedder = HttpEmbedder::new(self.embedding.clone());

        Ok(Reconciler::new(
            Scanner::new(&self.root, &self.extensions),
            Arc::new(store),
            Arc::new(embedder),
        ))
    }
}

/// Zero is treated as "use the default"; a zero timeout would fail everything
fn secs(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.filter(|v| *v > 0).unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn with_root(dir: &TempDir) -> Config {
        Config {
            index: Some(IndexConfig {
                root: Some(dir.path().to_path_buf()),
                extensions: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::resolve(with_root(&dir)).unwrap();

        assert_eq!(settings.root, dir.path().canonicalize().unwrap());
        assert_eq!(settings.extensions, vec!["md".to_string()]);
        assert_eq!(settings.embedding.url, "http://127.0.0.1:1338/v1");
        assert_eq!(
            settings.embedding.model,
            "text-embedding-nomic-embed-text-v1.5-embedding"
        );
        assert_eq!(settings.embedding.dimension, 768);
        assert_eq!(settings.debounce, Duration::from_millis(500));
        assert_eq!(settings.search_defaults.limit, 10);
        assert!((settings.search_defaults.max_distance - 0.5).abs() < f32::EPSILON);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_missing_root() {
        assert!(matches!(
            Settings::resolve(Config::default()),
            Err(ConfigError::MissingRoot)
        ));
    }

    #[test]
    fn test_root_must_be_existing_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.md");
        std::fs::write(&file, "x").unwrap();

        let mut config = with_root(&dir);
        config.index = Some(IndexConfig {
            root: Some(file),
            extensions: None,
        });
        assert!(matches!(
            Settings::resolve(config),
            Err(ConfigError::RootNotDirectory(_))
        ));

        let mut config = with_root(&dir);
        config.index = Some(IndexConfig {
            root: Some(dir.path().join("missing")),
            extensions: None,
        });
        assert!(matches!(
            Settings::resolve(config),
            Err(ConfigError::RootNotFound(_))
        ));
    }

    #[test]
    fn test_merge_later_wins_per_field() {
        let base = Config {
            embedding: Some(EmbeddingConfig {
                url: Some("http://base".to_string()),
                model: Some("base-model".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let over = Config {
            embedding: Some(EmbeddingConfig {
                url: Some("http://over".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = base.merge(over);
        let embedding = merged.embedding.unwrap();
        assert_eq!(embedding.url.as_deref(), Some("http://over"));
        assert_eq!(embedding.model.as_deref(), Some("base-model"));
    }

    #[test]
    fn test_from_env() {
        let config = Config::from_env(env(&[
            ("MDKB_DIR", "/notes"),
            ("MDKB_EXTENSIONS", "md, markdown ,"),
            ("EMBEDDING_DIMENSION", "1024"),
            ("MDKB_DEBOUNCE_MS", "250"),
            ("EMBEDDING_URL", ""),
        ]))
        .unwrap();

        let index = config.index.unwrap();
        assert_eq!(index.root, Some(PathBuf::from("/notes")));
        assert_eq!(
            index.extensions,
            Some(vec!["md".to_string(), "markdown".to_string()])
        );
        assert_eq!(config.embedding.as_ref().unwrap().dimension, Some(1024));
        // Empty values are ignored
        assert_eq!(config.embedding.unwrap().url, None);
        assert_eq!(config.watch.unwrap().debounce_ms, Some(250));
    }

    #[test]
    fn test_from_env_rejects_bad_numbers() {
        let err = Config::from_env(env(&[("EMBEDDING_DIMENSION", "big")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "EMBEDDING_DIMENSION"));
    }

    #[test]
    fn test_layer_order_file_then_env() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
[index]
root = "{}"

[embedding]
model = "file-model"
dimension = 384

[watch]
debounce_ms = 100
"#,
                dir.path().display()
            ),
        )
        .unwrap();

        let config =
            load_layers(Some(config_path.as_path()), env(&[("EMBEDDING_DIMENSION", "512")])).unwrap();
        let settings = Settings::resolve(config).unwrap();

        assert_eq!(settings.embedding.model, "file-model");
        assert_eq!(settings.embedding.dimension, 512);
        assert_eq!(settings.debounce, Duration::from_millis(100));
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let err = load_layers(Some(Path::new("/nonexistent/mdkb.toml")), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_unparsable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[index\nroot = ").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();

        let mut config = with_root(&dir);
        config.search = Some(SearchConfig {
            default_max_distance: Some(3.0),
            ..Default::default()
        });
        assert!(matches!(
            Settings::resolve(config),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut config = with_root(&dir);
        config.embedding = Some(EmbeddingConfig {
            dimension: Some(0),
            ..Default::default()
        });
        assert!(Settings::resolve(config).is_err());

        let mut config = with_root(&dir);
        config.index = Some(IndexConfig {
            root: Some(dir.path().to_path_buf()),
            extensions: Some(vec![" ".to_string()]),
        });
        assert!(Settings::resolve(config).is_err());
    }

    #[test]
    fn test_default_paths_not_empty() {
        assert!(!default_db_path().as_os_str().is_empty());
        assert!(!default_socket_path().as_os_str().is_empty());
    }
}
