//! Dossier CLI: run research pipelines from the terminal or serve them over HTTP.

mod commands;
mod convert;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Dossier: plan, research, write and publish reports from a single query
#[derive(Parser, Debug)]
#[command(name = "dossier", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (looked up for .dossier/config.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Research a query and publish the report
    Run {
        /// The research question
        query: String,

        /// Tone: objective, critical, optimistic, analytical, informative, formal
        #[arg(short, long, default_value = "objective")]
        tone: String,

        /// Target language of the published report (e.g. de, fr)
        #[arg(short, long)]
        lang: Option<String>,

        /// Maximum number of planned sections
        #[arg(short = 'n', long)]
        max_sections: Option<usize>,

        /// Skip the review and revision stages
        #[arg(long)]
        no_review: bool,

        /// Extra output formats besides markdown (pdf, docx)
        #[arg(short, long, value_delimiter = ',')]
        formats: Vec<String>,

        /// Writing guideline for the planner and reviewer (repeatable)
        #[arg(short, long)]
        guideline: Vec<String>,
    },
    /// Continue an interrupted or cancelled run from its latest draft
    Resume {
        /// Run ID
        run_id: uuid::Uuid,
    },
    /// Serve the HTTP gateway
    Serve {
        /// Bind address (overrides gateway.host)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides gateway.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect stored drafts
    Drafts {
        #[command(subcommand)]
        action: DraftsAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum DraftsAction {
    /// List stored runs, or the drafts of one run
    List {
        /// Run ID
        run_id: Option<uuid::Uuid>,
    },
    /// Print a stored snapshot
    Show {
        /// Run ID
        run_id: uuid::Uuid,

        /// Sequence number (defaults to the latest)
        #[arg(short, long)]
        seq: Option<u32>,

        /// Print only the report instead of the full state
        #[arg(short, long)]
        report: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let level = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let log_dir = directories::ProjectDirs::from("dev", "dossier", "dossier")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "dossier.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
