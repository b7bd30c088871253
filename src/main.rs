//! Export Queue - command line front end
//!
//! Runs queued or direct CSV exports of JSON-lines data sets.
//!
//! # Usage
//!
//! ```bash
//! # Queue an export and wait for it
//! export-queue run 1:orders --title orders
//!
//! # Stream straight to stdout
//! export-queue stream orders --uncompressed
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use export_queue::cli::CliInterface;
use export_queue::error::Result;

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Main application logic
///
/// 1. Parse command-line arguments
/// 2. Load configuration
/// 3. Initialize logging
/// 4. Execute the subcommand
async fn run() -> Result<()> {
    let cli = CliInterface::new()?;
    initialize_logging(&cli);
    cli.execute().await
}

/// Initialize logging
///
/// Verbosity flags win over `RUST_LOG`, which wins over the configured level.
/// Logs go to stderr so streamed CSV on stdout stays clean.
fn initialize_logging(cli: &CliInterface) {
    let level = LevelFilter::from_level(cli.config().logging.level.to_tracing_level());
    let configured = || EnvFilter::default().add_directive(level.into());

    let filter = if CliInterface::verbosity_override(cli.args()).is_some() {
        configured()
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| configured())
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if cli.config().logging.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}
