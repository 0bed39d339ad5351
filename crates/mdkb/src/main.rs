//! mdkb - markdown knowledge base CLI
//!
//! Semantic search over a directory of markdown notes.
//!
//! Usage:
//!   mdkb "query"              Search the notes
//!   mdkb index                Reconcile the index with the directory
//!   mdkb count                Number of indexed documents
//!   mdkb list                 Page through indexed documents
//!   mdkb status               Show daemon and index status
//!
//! Requests go to `mdkb-daemon` when it is running. Otherwise the CLI opens
//! the store itself and reconciles before searching.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use mdkb_core::{search, ReconcileReport, Reconciler, SearchOptions};
use mdkb_daemon::config::{load_layers, Config, DaemonConfig, IndexConfig, StoreConfig};
use mdkb_daemon::server::DEFAULT_LIST_LIMIT;
use mdkb_daemon::{default_socket_path, Client, DocumentWire, SearchResultWire, Settings};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long `index` waits for the daemon's reconciliation report
const INDEX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Options shared by every command
#[derive(Parser, Clone, Debug, Default)]
struct GlobalArgs {
    /// Directory of documents (overrides MDKB_DIR and config files)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Config file (default: the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path for direct mode
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Daemon socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Never use the daemon; open the store directly
    #[arg(long, global = true)]
    direct: bool,
}

/// Search options shared between the bare query form and the search subcommand
#[derive(Parser, Clone, Debug, Default)]
struct SearchArgs {
    /// Number of results to return (1-100)
    #[arg(short = 'n', long)]
    limit: Option<usize>,

    /// Maximum cosine distance (0.0-2.0); lower is stricter
    #[arg(short = 'd', long)]
    max_distance: Option<f32>,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// In direct mode, search the index as it is without reconciling first
    #[arg(long)]
    no_reconcile: bool,
}

#[derive(Parser)]
#[command(name = "mdkb")]
#[command(about = "mdkb - semantic search over markdown notes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Search query (when no subcommand given)
    query: Option<String>,

    #[command(flatten)]
    search: SearchArgs,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the notes (use this when your query matches a subcommand name)
    Search {
        /// Search query
        query: String,

        #[command(flatten)]
        args: SearchArgs,
    },
    /// Bring the index in line with the directory
    Index {
        /// Output the reconciliation report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the number of indexed documents
    Count {
        #[arg(long)]
        json: bool,
    },
    /// List indexed documents, most recently indexed first
    List {
        /// Number of documents to skip
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Maximum number of documents to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },
    /// Show daemon and index status
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let ctx = Session::new(&cli.global)?;

    match cli.command {
        Some(Commands::Search { query, args }) => cmd_search(&ctx, &query, &args),
        Some(Commands::Index { json }) => cmd_index(&ctx, json),
        Some(Commands::Count { json }) => cmd_count(&ctx, json),
        Some(Commands::List {
            offset,
            limit,
            json,
        }) => cmd_list(&ctx, offset, limit, json),
        Some(Commands::Status { json }) => cmd_status(&ctx, json),
        None => match cli.query {
            Some(query) => cmd_search(&ctx, &query, &cli.search),
            None => {
                use clap::CommandFactory;
                Cli::command().print_help()?;
                Ok(())
            }
        },
    }
}

/// Merged configuration plus the daemon client, if one is reachable
struct Session {
    config: Config,
    client: Option<Client>,
}

impl Session {
    fn new(global: &GlobalArgs) -> Result<Self> {
        let config = load_layers(global.config.as_deref(), |key| std::env::var(key).ok())?
            .merge(cli_layer(global));

        let socket = config
            .daemon
            .as_ref()
            .and_then(|d| d.socket.clone())
            .unwrap_or_else(default_socket_path);
        let client = if global.direct {
            None
        } else {
            Some(Client::new(&socket)).filter(Client::is_daemon_running)
        };
        tracing::debug!(
            "Using {}",
            if client.is_some() { "daemon" } else { "direct store access" }
        );

        Ok(Self { config, client })
    }

    fn settings(&self) -> Result<Settings> {
        Ok(Settings::resolve(self.config.clone())?)
    }

    fn open_direct(&self) -> Result<(Settings, Reconciler)> {
        let settings = self.settings()?;
        let reconciler = settings.open_reconciler()?;
        Ok((settings, reconciler))
    }

    /// Root used to shorten displayed paths
    fn display_root(&self) -> Option<PathBuf> {
        self.config
            .index
            .as_ref()
            .and_then(|i| i.root.as_ref())
            .and_then(|root| root.canonicalize().ok())
    }
}

fn cli_layer(global: &GlobalArgs) -> Config {
    Config {
        index: Some(IndexConfig {
            root: global.root.clone(),
            extensions: None,
        }),
        store: Some(StoreConfig {
            path: global.db.clone(),
            timeout_secs: None,
        }),
        daemon: Some(DaemonConfig {
            socket: global.socket.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn spinner(message: &str, show: bool) -> Result<Option<ProgressBar>> {
    if !show || !std::io::stderr().is_terminal() {
        return Ok(None);
    }
    let sp = ProgressBar::new_spinner();
    sp.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]")?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    sp.set_message(message.to_string());
    sp.enable_steady_tick(Duration::from_millis(80));
    Ok(Some(sp))
}

/// Full reconciliation in direct mode, with spinner feedback
fn reconcile_direct(reconciler: &Reconciler, show_spinner: bool) -> Result<ReconcileReport> {
    let sp = spinner(
        &format!("Reconciling {}...", reconciler.scanner().root().display()),
        show_spinner,
    )?;
    let result = reconciler.reconcile_full();
    if let Some(sp) = sp {
        sp.finish_and_clear();
    }
    result
}

fn cmd_search(ctx: &Session, query: &str, args: &SearchArgs) -> Result<()> {
    let query = query.trim();
    if query.is_empty() {
        anyhow::bail!("Query cannot be empty. Usage: mdkb \"your search query\"");
    }

    let results = match &ctx.client {
        Some(client) => client.search(query, args.limit, args.max_distance)?,
        None => search_direct(ctx, query, args)?,
    };

    if args.json {
        return print_results_json(&results, query);
    }
    print_results_human(&results, query, ctx.display_root().as_deref());
    Ok(())
}

/// Search without the daemon
fn search_direct(ctx: &Session, query: &str, args: &SearchArgs) -> Result<Vec<SearchResultWire>> {
    let (settings, reconciler) = ctx.open_direct()?;
    let options = SearchOptions {
        limit: args.limit.unwrap_or(settings.search_defaults.limit),
        max_distance: args
            .max_distance
            .unwrap_or(settings.search_defaults.max_distance),
    };
    options.validate()?;

    if !args.no_reconcile {
        let report = reconcile_direct(&reconciler, !args.json)?;
        if !report.is_clean() && !args.json {
            eprintln!(
                "{} {} document(s) could not be indexed; results may be stale",
                "Warning:".yellow().bold(),
                report.failed + report.scan_errors
            );
        }
    }

    let hits = search(
        reconciler.store().as_ref(),
        reconciler.embedder().as_ref(),
        query,
        &options,
    )?;
    Ok(hits.into_iter().map(SearchResultWire::from).collect())
}

fn print_results_json(results: &[SearchResultWire], query: &str) -> Result<()> {
    #[derive(serde::Serialize)]
    struct JsonOutput<'a> {
        query: &'a str,
        count: usize,
        results: &'a [SearchResultWire],
    }

    let output = JsonOutput {
        query,
        count: results.len(),
        results,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn format_result_path(path: &str, root: Option<&Path>) -> String {
    let path_buf = Path::new(path);
    if let Some(relative) = root.and_then(|root| path_buf.strip_prefix(root).ok()) {
        if !relative.as_os_str().is_empty() {
            return relative.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

fn print_results_human(results: &[SearchResultWire], query: &str, root: Option<&Path>) {
    if results.is_empty() {
        println!("No results found for \"{query}\"");
        return;
    }

    println!(
        "Found {} results for \"{}\":",
        results.len().to_string().cyan(),
        query.yellow()
    );
    println!();

    for (i, result) in results.iter().enumerate() {
        println!(
            "{} {} {}",
            format!("{}.", i + 1).dimmed(),
            format_result_path(&result.path, root).cyan().bold(),
            format!("(distance {:.3})", result.distance).dimmed()
        );
        println!("   {}", result.snippet);
        println!();
    }
}

fn cmd_index(ctx: &Session, json: bool) -> Result<()> {
    let report = match &ctx.client {
        Some(client) => {
            let sp = spinner("Reconciling (daemon)...", !json)?;
            // A first full index can take far longer than a query
            let report = Client::new(client.socket_path())
                .with_timeout(INDEX_TIMEOUT)
                .reconcile();
            if let Some(sp) = sp {
                sp.finish_and_clear();
            }
            report?
        }
        None => {
            let (_, reconciler) = ctx.open_direct()?;
            reconcile_direct(&reconciler, !json)?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let headline = if report.is_clean() {
        "Index up to date".green().bold()
    } else {
        "Index updated with errors".yellow().bold()
    };
    println!("{} ({}ms)", headline, report.duration_ms);
    println!("  Created:   {}", report.created.to_string().cyan());
    println!("  Updated:   {}", report.updated.to_string().cyan());
    println!("  Deleted:   {}", report.deleted.to_string().cyan());
    println!("  Unchanged: {}", report.unchanged.to_string().dimmed());
    if report.coalesced > 0 {
        println!("  Coalesced: {}", report.coalesced.to_string().dimmed());
    }
    if report.scan_errors > 0 {
        println!("  Unreadable: {}", report.scan_errors.to_string().red());
    }
    if report.failed > 0 {
        println!("  Failed:    {}", report.failed.to_string().red());
        for failure in &report.failures {
            println!(
                "    {} {}",
                failure.path.display().to_string().red(),
                failure.message.dimmed()
            );
        }
    }
    Ok(())
}

fn cmd_count(ctx: &Session, json: bool) -> Result<()> {
    let count = match &ctx.client {
        Some(client) => client.document_count()?,
        None => ctx.open_direct()?.1.store().count()?,
    };

    if json {
        println!("{}", serde_json::json!({ "count": count }));
    } else {
        println!("{count}");
    }
    Ok(())
}

fn cmd_list(ctx: &Session, offset: usize, limit: Option<usize>, json: bool) -> Result<()> {
    let docs: Vec<DocumentWire> = match &ctx.client {
        Some(client) => client.list_documents(offset, limit)?,
        None => ctx
            .open_direct()?
            .1
            .store()
            .list(offset, limit.unwrap_or(DEFAULT_LIST_LIMIT))?
            .into_iter()
            .map(DocumentWire::from)
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&docs)?);
        return Ok(());
    }

    if docs.is_empty() {
        println!("No documents indexed");
        return Ok(());
    }

    let root = ctx.display_root();
    let now = now_millis();
    for doc in &docs {
        println!(
            "{}  {}",
            format_result_path(&doc.path, root.as_deref()).cyan(),
            format!(
                "indexed {} ago, updated {} ago",
                format_age(now, doc.indexed_at),
                format_age(now, doc.updated_at)
            )
            .dimmed()
        );
    }
    Ok(())
}

fn cmd_status(ctx: &Session, json: bool) -> Result<()> {
    let status = match &ctx.client {
        Some(client) => Some(client.status()?),
        None => None,
    };

    if json {
        #[derive(serde::Serialize)]
        struct StatusJson {
            running: bool,
            #[serde(flatten)]
            status: Option<mdkb_daemon::DaemonStatus>,
        }
        let output = StatusJson {
            running: status.is_some(),
            status,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", "Daemon Status".cyan().bold());
    println!();

    let Some(status) = status else {
        println!("Status: {}", "not running".yellow());
        // Still useful: what the store holds right now
        if let Ok((settings, reconciler)) = ctx.open_direct() {
            println!("Root: {}", settings.root.display().to_string().cyan());
            println!(
                "Documents: {}",
                reconciler.store().count()?.to_string().cyan()
            );
        }
        return Ok(());
    };

    println!("Status: {}", "running".green());
    println!("Uptime: {}", format_duration(status.uptime_secs).cyan());
    println!("Root: {}", status.root.cyan());
    println!("Watcher: {}", status.watch_state.as_str().cyan());
    println!("Documents: {}", status.document_count.to_string().cyan());
    println!(
        "Fresh: {}",
        if status.fresh {
            "yes".green()
        } else {
            "no".yellow()
        }
    );
    if status.pending > 0 {
        println!("Pending: {}", status.pending.to_string().cyan());
    }
    if let (Some(report), Some(at)) = (&status.last_full_reconcile, status.last_full_reconcile_at) {
        println!(
            "Last full reconcile: {} ago ({} changes, {} failed)",
            format_age(now_millis(), at),
            report.changes(),
            report.failed
        );
    }
    Ok(())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Age of a Unix-millisecond timestamp
fn format_age(now_ms: i64, then_ms: i64) -> String {
    format_duration((now_ms.saturating_sub(then_ms).max(0) / 1000) as u64)
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_query_parses_as_search() {
        let cli = Cli::parse_from(["mdkb", "rust lifetimes", "-n", "5", "-d", "0.3"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.query.as_deref(), Some("rust lifetimes"));
        assert_eq!(cli.search.limit, Some(5));
        assert_eq!(cli.search.max_distance, Some(0.3));
    }

    #[test]
    fn test_search_subcommand_for_reserved_words() {
        let cli = Cli::parse_from(["mdkb", "search", "status", "--json"]);
        match cli.command {
            Some(Commands::Search { query, args }) => {
                assert_eq!(query, "status");
                assert!(args.json);
                assert!(args.limit.is_none());
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["mdkb", "count", "--root", "/notes", "--direct"]);
        assert!(matches!(cli.command, Some(Commands::Count { json: false })));
        assert_eq!(cli.global.root.as_deref(), Some(Path::new("/notes")));
        assert!(cli.global.direct);
    }

    #[test]
    fn test_list_defaults() {
        let cli = Cli::parse_from(["mdkb", "list"]);
        match cli.command {
            Some(Commands::List {
                offset,
                limit,
                json,
            }) => {
                assert_eq!(offset, 0);
                assert!(limit.is_none());
                assert!(!json);
            }
            _ => panic!("expected list command"),
        }
    }

    #[test]
    fn test_cli_layer_sets_only_given_flags() {
        let layer = cli_layer(&GlobalArgs {
            db: Some(PathBuf::from("/tmp/x.db")),
            ..Default::default()
        });
        assert_eq!(
            layer.store.and_then(|s| s.path),
            Some(PathBuf::from("/tmp/x.db"))
        );
        assert!(layer.index.and_then(|i| i.root).is_none());
    }

    #[test]
    fn test_format_result_path() {
        let root = Path::new("/notes");
        assert_eq!(format_result_path("/notes/a/b.md", Some(root)), "a/b.md");
        assert_eq!(format_result_path("/other/c.md", Some(root)), "/other/c.md");
        assert_eq!(format_result_path("/notes/a.md", None), "/notes/a.md");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7_260), "2h 1m");
        assert_eq!(format_duration(90_000), "1d 1h");
    }

    #[test]
    fn test_format_age_clamps_future_timestamps() {
        assert_eq!(format_age(10_000, 4_000), "6s");
        assert_eq!(format_age(1_000, 5_000), "0s");
    }
}
