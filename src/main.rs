//! CLI entry point for `cbc`, a small search front end over the SDK.
//!
//! Credentials come from a TOML credentials file (`--credentials` and
//! `--profile`, or `CBC_CREDENTIALS_FILE` and `CBC_PROFILE`) or, when no
//! file is given, from the `CBC_*` connection variables. Each subcommand
//! runs one search and prints one line per result.
//!
//! Exit codes:
//! - 0: success
//! - 1: runtime error (credentials, API error, timeout, etc.)
//! - 2: argument validation error (clap handles this automatically)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cbc_sdk::client::ApiClient;
use cbc_sdk::credentials::Credentials;
use cbc_sdk::error::Result;
use cbc_sdk::model::Model;
use cbc_sdk::query::Query;
use cbc_sdk::{alerts, devices, processes};

#[derive(Parser)]
#[command(name = "cbc", version, about, long_about = None)]
struct Cli {
    /// TOML credentials file with one table per profile.
    #[arg(long, global = true, env = "CBC_CREDENTIALS_FILE")]
    credentials: Option<PathBuf>,

    /// Profile to read from the credentials file.
    #[arg(long, global = true, env = "CBC_PROFILE", default_value = "default")]
    profile: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search devices.
    Devices(SearchArgs),
    /// Search alerts.
    Alerts(SearchArgs),
    /// Search processes (runs an asynchronous search job).
    Processes {
        #[command(flatten)]
        search: SearchArgs,

        /// Give up on the search job after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Args)]
struct SearchArgs {
    /// Search predicate in the backend query language, e.g. `os:WINDOWS`.
    /// May start with a hyphen (e.g. `-process_name:svchost.exe`).
    #[arg(long, short, allow_hyphen_values = true)]
    query: Option<String>,

    /// Maximum number of results to print.
    #[arg(long, short, default_value_t = 20)]
    rows: usize,
}

fn load_credentials(cli: &Cli) -> Result<Credentials> {
    match &cli.credentials {
        Some(path) => Credentials::from_file(path, &cli.profile),
        None => Credentials::from_env(),
    }
}

fn with_predicate(query: Query, args: &SearchArgs) -> Result<Query> {
    match &args.query {
        Some(q) => query.where_(q.as_str()),
        None => Ok(query),
    }
}

fn summary(model: &Model, keys: &[&str]) -> String {
    keys.iter()
        .map(|k| match model.peek(k) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => "-".to_string(),
            Some(other) => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

async fn run(cli: Cli) -> Result<()> {
    let api = Arc::new(ApiClient::new(load_credentials(&cli)?)?);

    let (mut query, args, columns): (Query, &SearchArgs, &[&str]) = match &cli.command {
        Commands::Devices(args) => (
            with_predicate(devices::search(&api)?, args)?,
            args,
            &["id", "name", "os", "status"][..],
        ),
        Commands::Alerts(args) => (
            with_predicate(alerts::search(&api)?, args)?,
            args,
            &["id", "severity", "type", "device_name"][..],
        ),
        Commands::Processes { search, timeout_ms } => {
            let mut query = with_predicate(processes::search(&api)?, search)?;
            if let Some(ms) = timeout_ms {
                query = query.timeout(Duration::from_millis(*ms));
            }
            (
                query,
                search,
                &["process_guid", "device_name", "process_name"][..],
            )
        }
    };

    let mut results = query.window(0, Some(args.rows));
    while let Some(model) = results.next().await? {
        println!("{}", summary(&model, columns));
    }
    if let Some(total) = results.total() {
        eprintln!("{total} matching");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
