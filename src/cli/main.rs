//! CLI binary entry point for awh

#[cfg(feature = "cli")]
use assessment_warehouse::cli::commands::StoreArgs;
#[cfg(feature = "cli")]
use assessment_warehouse::cli::commands::diagnose::handle_diagnose;
#[cfg(feature = "cli")]
use assessment_warehouse::cli::commands::query::{QueryArgs, handle_query};
#[cfg(feature = "cli")]
use assessment_warehouse::cli::commands::run::{RunArgs, handle_run};
#[cfg(feature = "cli")]
use assessment_warehouse::cli::commands::stats::handle_stats;
#[cfg(feature = "cli")]
use assessment_warehouse::pipeline::LoadMode;
#[cfg(feature = "cli")]
use clap::{Args, Parser, Subcommand};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "awh")]
#[command(about = "Incremental loader and star-schema builder for assessment response extracts")]
#[command(version)]
struct Cli {
    /// Enable debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Args, Clone, Debug)]
struct StoreFlags {
    /// Configuration file (default: ./warehouse.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Store file path
    #[arg(long)]
    db_path: Option<PathBuf>,
    /// Source directory holding the extracts
    #[arg(long)]
    data_path: Option<PathBuf>,
    /// Processing manifest path
    #[arg(long)]
    manifest: Option<PathBuf>,
}

#[cfg(feature = "cli")]
impl From<StoreFlags> for StoreArgs {
    fn from(flags: StoreFlags) -> Self {
        StoreArgs {
            config: flags.config,
            db_path: flags.db_path,
            data_path: flags.data_path,
            manifest: flags.manifest,
        }
    }
}

#[cfg(feature = "cli")]
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    /// Drop every table and reload all source files
    Full,
    /// Load only new or modified source files
    Incremental,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Load source files and rebuild the star schema
    Run {
        /// Load mode
        #[arg(value_enum)]
        mode: ModeArg,
        #[command(flatten)]
        store: StoreFlags,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show row counts of the warehouse tables
    Stats {
        #[command(flatten)]
        store: StoreFlags,
    },

    /// Run a read-only SQL query
    Query {
        /// SQL query to execute
        sql: String,
        #[command(flatten)]
        store: StoreFlags,
        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// List student identifiers with conflicting names or national IDs
    Diagnose {
        #[command(flatten)]
        store: StoreFlags,
        /// Maximum identifiers to list
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[cfg(feature = "cli")]
fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "cli")]
fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run { mode, store, json } => {
            let mode = match mode {
                ModeArg::Full => LoadMode::Full,
                ModeArg::Incremental => LoadMode::Incremental,
            };
            let args = RunArgs {
                mode,
                store: store.into(),
                json,
            };
            handle_run(&args)
        }

        Commands::Stats { store } => handle_stats(&store.into()),

        Commands::Query { sql, store, format } => {
            let args = QueryArgs {
                sql,
                store: store.into(),
                format,
            };
            handle_query(&args)
        }

        Commands::Diagnose { store, limit } => handle_diagnose(&store.into(), limit),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature is not enabled. Build with --features cli");
    std::process::exit(1);
}
