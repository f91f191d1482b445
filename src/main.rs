//! quics - sync server metadata administration
//!
//! Usage:
//!   quics password set --root <root>      - Rotate a root password
//!   quics password reset --root <root>    - Reset a root password
//!   quics show client|dir|file|history    - Inspect records
//!   quics remove client|dir|file          - Remove records
//!   quics download file ...               - Fetch a past version
//!   quics verify --root <root>            - Check a root's integrity
//!   quics sweep                           - Remove orphaned records
//!   quics status                          - Show record counts

use clap::{Parser, Subcommand};
use quics::{
    config::Config,
    engine::Engine,
    index::Scope,
    Error, Result,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "quics")]
#[command(author = "quics Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Metadata administration for the quics sync server")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/quics/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage root directory passwords
    Password {
        #[command(subcommand)]
        command: PasswordCommands,
    },

    /// Show clients, roots, files or history
    Show {
        #[command(subcommand)]
        target: ShowTarget,
    },

    /// Remove clients, roots or files
    Remove {
        #[command(subcommand)]
        target: RemoveTarget,
    },

    /// Download stored content
    Download {
        #[command(subcommand)]
        target: DownloadTarget,
    },

    /// Check that every file of a root agrees with its history
    Verify {
        /// Root directory
        #[arg(long)]
        root: String,
    },

    /// Finish interrupted removals and delete orphaned records
    Sweep,

    /// Show record counts
    Status,
}

#[derive(Subcommand)]
enum PasswordCommands {
    /// Set a new password
    Set {
        /// Root directory
        #[arg(long)]
        root: String,

        /// New password (prompted for when absent)
        #[arg(long)]
        pw: Option<String>,
    },

    /// Reset to the configured default, or a generated secret
    Reset {
        /// Root directory
        #[arg(long)]
        root: String,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Registered clients
    Client {
        /// Client UUID
        #[arg(long)]
        id: Option<Uuid>,

        /// Show every client
        #[arg(long)]
        all: bool,
    },

    /// Root directories
    Dir {
        /// Root directory
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        all: bool,
    },

    /// Latest file states
    File {
        /// Restrict to one root
        #[arg(long)]
        root: Option<String>,

        /// File path (requires --root)
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        all: bool,
    },

    /// Version history
    History {
        #[arg(long)]
        root: Option<String>,

        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum RemoveTarget {
    /// Remove clients and their memberships
    Client {
        #[arg(long)]
        id: Option<Uuid>,

        #[arg(long)]
        all: bool,
    },

    /// Remove roots with all their files and history
    Dir {
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        all: bool,
    },

    /// Erase files and their history
    File {
        #[arg(long)]
        root: Option<String>,

        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum DownloadTarget {
    /// Write one version of a file to disk
    File {
        #[arg(long)]
        root: String,

        #[arg(long)]
        path: String,

        /// Version timestamp
        #[arg(long)]
        version: u64,

        /// Output file
        #[arg(long)]
        target: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);
    let config = Config::load_or_default(&config_path);

    // Setup logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config
            .as_ref()
            .map(|c| c.logging.level.clone())
            .unwrap_or_else(|_| "info".to_string())
    };
    let log_file = config
        .as_ref()
        .ok()
        .and_then(|c| c.logging.file.as_deref())
        .map(expand_tilde);
    init_logging(&level, log_file.as_deref());

    // Run the command
    if let Err(e) = config.and_then(|config| run_command(cli.command, config)) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install the global subscriber, writing to `file` when one is configured
/// and to stdout otherwise.
fn init_logging(level: &str, file: Option<&Path>) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    let result = match file.map(open_log_file) {
        Some(Ok(file)) => tracing::subscriber::set_global_default(
            builder.with_ansi(false).with_writer(Mutex::new(file)).finish(),
        ),
        Some(Err(e)) => {
            eprintln!("Failed to open log file, logging to stdout: {}", e);
            tracing::subscriber::set_global_default(builder.finish())
        }
        None => tracing::subscriber::set_global_default(builder.finish()),
    };
    if let Err(e) = result {
        eprintln!("Failed to set subscriber: {}", e);
    }
}

fn open_log_file(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)
}

fn run_command(command: Commands, config: Config) -> Result<()> {
    let engine = Engine::open(config)?;

    let result = match command {
        Commands::Password { command } => match command {
            PasswordCommands::Set { root, pw } => cmd_password_set(&engine, &root, pw),
            PasswordCommands::Reset { root } => cmd_password_reset(&engine, &root),
        },

        Commands::Show { target } => cmd_show(&engine, target),

        Commands::Remove { target } => cmd_remove(&engine, target),

        Commands::Download {
            target:
                DownloadTarget::File {
                    root,
                    path,
                    version,
                    target,
                },
        } => cmd_download(&engine, &root, &path, version, &target),

        Commands::Verify { root } => cmd_verify(&engine, &root),

        Commands::Sweep => cmd_sweep(&engine),

        Commands::Status => cmd_status(&engine),
    };

    engine.flush()?;
    result
}

fn cmd_password_set(engine: &Engine, root: &str, pw: Option<String>) -> Result<()> {
    let password = match pw {
        Some(p) => p,
        None => {
            let first = rpassword::prompt_password("New password: ")
                .map_err(|e| Error::Internal(e.to_string()))?;
            let second = rpassword::prompt_password("Confirm password: ")
                .map_err(|e| Error::Internal(e.to_string()))?;
            if first != second {
                return Err(Error::InvalidArgument("passwords do not match".to_string()));
            }
            first
        }
    };

    let epoch = engine.directories().set_password(root, &password)?;
    info!("Password of {} updated (epoch {})", root, epoch);
    Ok(())
}

fn cmd_password_reset(engine: &Engine, root: &str) -> Result<()> {
    let secret = engine.directories().reset_password(root)?;
    println!("New password for {}: {}", root, secret.as_str());
    Ok(())
}

fn cmd_show(engine: &Engine, target: ShowTarget) -> Result<()> {
    match target {
        ShowTarget::Client { id, all } => match (id, all) {
            (Some(id), _) => print_json(&engine.clients().get_client(&id)?),
            (None, true) => print_json(&engine.clients().list_clients()?),
            (None, false) => Err(missing_selector("client")),
        },

        ShowTarget::Dir { id, all } => {
            let roots = match (id, all) {
                (Some(id), _) => vec![engine.directories().get_root(&id)?],
                (None, true) => engine.directories().list_roots()?,
                (None, false) => return Err(missing_selector("dir")),
            };
            let views: Vec<_> = roots
                .iter()
                .map(|root| {
                    serde_json::json!({
                        "path": root.path,
                        "owner": root.owner,
                        "credential_epoch": root.credential_epoch,
                        "members": root.members,
                        "created_at": root.created_at,
                    })
                })
                .collect();
            print_json(&views)
        }

        ShowTarget::File { root, id, all } => {
            let scope = scope_for("file", root.as_deref(), id.as_deref(), all)?;
            print_json(&engine.files().list_files(scope)?)
        }

        ShowTarget::History { root, id, all } => {
            let scope = scope_for("history", root.as_deref(), id.as_deref(), all)?;
            print_json(&engine.history().list_history(scope)?)
        }
    }
}

fn cmd_remove(engine: &Engine, target: RemoveTarget) -> Result<()> {
    match target {
        RemoveTarget::Client { id, all } => match (id, all) {
            (Some(id), _) => {
                engine.clients().remove_client(&id)?;
                println!("Removed client {}", id);
                Ok(())
            }
            (None, true) => {
                let removed = engine.clients().remove_all_clients()?;
                println!("Removed {} clients", removed);
                Ok(())
            }
            (None, false) => Err(missing_selector("client")),
        },

        RemoveTarget::Dir { id, all } => match (id, all) {
            (Some(id), _) => {
                let report = engine.directories().remove_root(&id)?;
                println!(
                    "Removed {} ({} files, {} history records)",
                    id, report.files, report.history
                );
                Ok(())
            }
            (None, true) => {
                let removed = engine.directories().remove_all_roots()?;
                println!("Removed {} roots", removed);
                Ok(())
            }
            (None, false) => Err(missing_selector("dir")),
        },

        RemoveTarget::File { root, id, all } => {
            match scope_for("file", root.as_deref(), id.as_deref(), all)? {
                Scope::Path { root, path } => {
                    let history = engine.files().remove_file(root, path)?;
                    println!("Removed {}:{} ({} history records)", root, path, history);
                }
                scope => {
                    let removed = engine.files().remove_all_files(scope)?;
                    println!("Removed {} files", removed);
                }
            }
            Ok(())
        }
    }
}

fn cmd_download(engine: &Engine, root: &str, path: &str, version: u64, target: &Path) -> Result<()> {
    let target = expand_tilde(target);
    let written = engine.download_to(root, path, version, &target)?;
    println!("Wrote {} bytes to {:?}", written, target);
    Ok(())
}

fn cmd_verify(engine: &Engine, root: &str) -> Result<()> {
    let checked = engine.verify_root(root)?;
    println!("{}: {} files consistent", root, checked);
    Ok(())
}

fn cmd_sweep(engine: &Engine) -> Result<()> {
    let report = engine.sweep_orphans()?;
    println!(
        "Swept {} files and {} history records ({} cascades)",
        report.files, report.history, report.cascades
    );
    Ok(())
}

fn cmd_status(engine: &Engine) -> Result<()> {
    let stats = engine.status()?;
    let config = engine.config();

    println!("quics Status");
    println!("============");
    println!();
    println!("Database: {:?}", config.database_path());
    println!("Listen: {}:{} (HTTP/3 {})", config.server.address, config.server.port, config.server.port3);
    println!("Clients: {}", stats.clients);
    println!("Roots: {}", stats.roots);
    println!("Files: {}", stats.files);
    println!("History records: {}", stats.history);
    println!("Blobs: {}", stats.blobs);
    if stats.pending_sweeps > 0 {
        println!("Pending removals: {}", stats.pending_sweeps);
    }
    Ok(())
}

/// Listing scope from `--root`, `--id` and `--all`
fn scope_for<'a>(
    what: &str,
    root: Option<&'a str>,
    id: Option<&'a str>,
    all: bool,
) -> Result<Scope<'a>> {
    match (root, id, all) {
        (Some(root), Some(path), _) => Ok(Scope::Path { root, path }),
        (None, Some(_), _) => Err(Error::InvalidArgument(format!(
            "{} --id requires --root",
            what
        ))),
        (Some(root), None, true) => Ok(Scope::Root(root)),
        (None, None, true) => Ok(Scope::All),
        (_, None, false) => Err(missing_selector(what)),
    }
}

fn missing_selector(what: &str) -> Error {
    Error::InvalidArgument(format!("{}: pass --id or --all", what))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
