mod commands;
mod config;
mod remote;
mod server;

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    MeasurementArgs, Store, cmd_dashboard, cmd_delete, cmd_export, cmd_history, cmd_import,
    cmd_log, cmd_restore, cmd_show, cmd_trend,
};
use crate::config::{BackendKind, BackendOptions, Config};
use vitals_core::metrics::DEFAULT_WINDOW;
use vitals_core::store::RecordStore;

#[derive(Parser)]
#[command(
    name = "vitals",
    version,
    about = "A personal health tracker: daily measurements, TDEE and vitals",
    long_about = "Track daily weight, intake and vitals in a single CSV table.\n\n\
        The table lives in a versioned blob (local file, SQLite or a remote\n\
        service); concurrent writers are detected instead of overwritten."
)]
struct Cli {
    /// Where the health table is stored
    #[arg(long, global = true, value_enum, env = "VITALS_BACKEND", default_value = "file")]
    backend: BackendKind,
    /// Blob path of the health table within the backend
    #[arg(long, global = true, env = "VITALS_BLOB", default_value = "health.csv")]
    blob: String,
    /// Base URL of the remote blob service
    #[arg(long, global = true, env = "VITALS_REMOTE_URL")]
    remote_url: Option<String>,
    /// Bearer token for the remote blob service
    #[arg(long, global = true, env = "VITALS_REMOTE_TOKEN", hide_env_values = true)]
    remote_token: Option<String>,
    /// More log output on stderr (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the measurements for a day (replaces that day's record)
    Log {
        /// Date to log for (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        #[command(flatten)]
        values: MeasurementArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the record for one day (default: today)
    Show {
        /// Date to show
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored records, oldest first
    History {
        /// Only the last N records
        #[arg(short, long)]
        days: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete the record for one day
    Delete {
        /// Date to delete (YYYY-MM-DD)
        date: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show TDEE, BMI, protein and vitals computed from the table
    Dashboard {
        /// Number of trailing records averaged for BMI, protein and vitals
        #[arg(short, long, default_value_t = DEFAULT_WINDOW)]
        window: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the moving average of one column
    Trend {
        /// Column name (e.g. `weight_kg`, `steps`, `sleep_hours`)
        #[arg(short, long, default_value = "weight_kg")]
        field: String,
        /// Moving-average window in records
        #[arg(short, long, default_value_t = DEFAULT_WINDOW)]
        window: usize,
        /// Only show the last N records
        #[arg(short, long)]
        days: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Merge a wearable ZIP export into the table
    Import {
        /// Path to the exported ZIP archive
        file: PathBuf,
        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the table as CSV (or JSON) to stdout or a file
    Export {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace the whole table with a CSV file
    Restore {
        /// CSV file with a `date` column
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "vitals=debug,vitals_core=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let config = Config::load()?;
    let options = BackendOptions {
        kind: cli.backend,
        remote_url: cli.remote_url,
        remote_token: cli.remote_token,
    };
    let backend = config.open_backend(&options, rt.handle())?;
    let store: Store = RecordStore::new(backend, cli.blob);

    match cli.command {
        Commands::Log { date, values, json } => cmd_log(&store, date, values, json),
        Commands::Show { date, json } => cmd_show(&store, date, json),
        Commands::History { days, json } => cmd_history(&store, days, json),
        Commands::Delete { date, json } => cmd_delete(&store, &date, json),
        Commands::Dashboard { window, json } => cmd_dashboard(&store, window, json),
        Commands::Trend {
            field,
            window,
            days,
            json,
        } => cmd_trend(&store, &field, window, days, json),
        Commands::Import {
            file,
            dry_run,
            json,
        } => cmd_import(&store, &file, dry_run, json),
        Commands::Export { output, json } => cmd_export(&store, output.as_deref(), json),
        Commands::Restore { file, json } => cmd_restore(&store, &file, json),
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            rt.block_on(server::start_server(store, port, &bind, api_key))
        }
    }
}
