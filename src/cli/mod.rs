//! Command-line interface for export-queue
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading and CLI overrides
//! - Running queued exports through an in-process coordinator
//! - Direct streaming exports to stdout or a file

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, LogLevel};
use crate::error::{ExportError, Result};
use crate::export::{
    AddCode, ColumnFormat, CsvParams, CustomQuery, ExportPayload, ExportStatus, ExportWrapper,
    ExtraParams, FactRef, JsonLinesSource, LogNotifier, OutputWriter, StreamedExport,
};
use crate::formatter::{Formatter, OutputFormat};

pub mod completion;

/// Export Queue - queued CSV exports with a fixed worker pool
#[derive(Parser, Debug)]
#[command(
    name = "export-queue",
    version,
    about = "Queued CSV export pipeline",
    long_about = "Runs CSV exports of JSON-lines data sets through a bounded job queue and a
fixed worker pool, or streams them directly to stdout or a file."
)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Output format for job listings (table, json, json-pretty)
    #[arg(long, value_name = "FORMAT", global = true)]
    pub format: Option<String>,

    /// Disable colored output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Quiet mode (errors only, no progress)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose mode (detailed logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Very verbose mode (trace logging)
    #[arg(long = "vv", global = true)]
    pub very_verbose: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for export-queue
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue an export, wait for it to finish and print the job
    Run {
        #[command(flatten)]
        export: ExportArgs,

        /// User submitting the export
        #[arg(long, default_value = "cli")]
        user: String,

        /// Send lifecycle notifications
        #[arg(long)]
        notify: bool,
    },

    /// Stream an export directly, bypassing the queue
    Stream {
        #[command(flatten)]
        export: ExportArgs,

        /// Output file (stdout when omitted)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Remove expired export files once
    Sweep,

    /// Show version information
    Version,

    /// Generate shell completion script
    Completion {
        /// Shell type (bash, zsh, fish, powershell, elvish)
        #[arg(value_name = "SHELL")]
        shell: String,
    },

    /// Show configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Validate configuration file
        #[arg(long)]
        validate: bool,
    },
}

/// What to export and how to format it
#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Facts to export, as NAME or ID:NAME
    #[arg(value_name = "FACT")]
    pub facts: Vec<String>,

    /// Export title, used as the output file name
    #[arg(short = 't', long, default_value = "export")]
    pub title: String,

    /// Index for a custom query export (repeatable)
    #[arg(long = "index", value_name = "NAME")]
    pub indices: Vec<String>,

    /// Custom query request as a JSON object of field filters (repeatable)
    #[arg(long = "request", value_name = "JSON")]
    pub requests: Vec<String>,

    /// Connection name recorded on custom queries
    #[arg(long, default_value = "default")]
    pub connection: String,

    /// Column as NAME[:LABEL[:FORMAT]] (repeatable, inferred when omitted)
    #[arg(long = "column", value_name = "SPEC")]
    pub columns: Vec<String>,

    /// Extra filter as FIELD=VALUE (repeatable)
    #[arg(long = "extra", value_name = "FIELD=VALUE")]
    pub extra: Vec<String>,

    /// Column separator
    #[arg(long, default_value_t = ',')]
    pub separator: char,

    /// Separator for list values inside a cell
    #[arg(long, default_value_t = '|')]
    pub list_separator: char,

    /// Maximum rows to export (0 for no limit)
    #[arg(long, default_value_t = 0)]
    pub limit: usize,

    /// Write plain CSV instead of gzip
    #[arg(long)]
    pub uncompressed: bool,
}

impl ExportArgs {
    /// CSV parameters from the formatting flags
    pub fn csv_params(&self) -> CsvParams {
        CsvParams {
            separator: self.separator,
            list_separator: self.list_separator,
            limit: self.limit,
            uncompressed_output: self.uncompressed,
            columns: self.columns.iter().map(|s| ColumnFormat::parse_spec(s)).collect(),
        }
    }

    /// Facts or custom query, depending on whether indices were given
    pub fn payload(&self) -> Result<ExportPayload> {
        if !self.indices.is_empty() {
            if !self.facts.is_empty() {
                return Err(ExportError::Generic(
                    "Facts and --index cannot be combined".to_string(),
                ));
            }
            let requests = self
                .requests
                .iter()
                .map(|raw| {
                    serde_json::from_str(raw)
                        .map_err(|e| ExportError::Generic(format!("Invalid --request '{raw}': {e}")))
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(ExportPayload::Custom(CustomQuery {
                indices: self.indices.clone(),
                requests,
                connection: self.connection.clone(),
            }));
        }

        if self.facts.is_empty() {
            return Err(ExportError::Generic(
                "Nothing to export: give at least one fact or --index".to_string(),
            ));
        }
        let facts = self
            .facts
            .iter()
            .enumerate()
            .map(|(i, spec)| parse_fact(spec, i as i64 + 1))
            .collect::<Result<Vec<_>>>()?;
        Ok(ExportPayload::Facts(facts))
    }

    pub fn extra_params(&self) -> Result<ExtraParams> {
        self.extra.iter().map(|kv| parse_extra(kv)).collect()
    }
}

/// Parse `ID:NAME` or `NAME`; bare names get `default_id`
fn parse_fact(spec: &str, default_id: i64) -> Result<FactRef> {
    match spec.split_once(':') {
        Some((id, name)) => {
            let id = id
                .trim()
                .parse::<i64>()
                .map_err(|_| ExportError::Generic(format!("Invalid fact id in '{spec}'")))?;
            if name.trim().is_empty() {
                return Err(ExportError::Generic(format!("Missing fact name in '{spec}'")));
            }
            Ok(FactRef::new(id, name.trim()))
        }
        None if spec.trim().is_empty() => Err(ExportError::Generic("Empty fact name".to_string())),
        None => Ok(FactRef::new(default_id, spec.trim())),
    }
}

fn parse_extra(kv: &str) -> Result<(String, String)> {
    match kv.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ExportError::Generic(format!(
            "Invalid --extra '{kv}', expected FIELD=VALUE"
        ))),
    }
}

/// Row counter on stderr for a file export; a bar when `--limit` bounds it
fn row_progress(limit: usize, path: &Path, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let (bar, template) = if limit > 0 {
        (
            ProgressBar::new(limit as u64),
            "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} rows ({per_sec})",
        )
    } else {
        (
            ProgressBar::new_spinner(),
            "{spinner:.green} {msg}: {pos} rows ({per_sec})",
        )
    };
    if let Ok(style) = ProgressStyle::with_template(template) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar.set_message(path.display().to_string());
    bar
}

/// Spinner showing the state of a queued job while `run` waits on it
fn job_spinner(id: &str, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} export {prefix} {msg} {elapsed}") {
        spinner.set_style(style);
    }
    spinner.set_prefix(id.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

/// CLI interface handler
pub struct CliInterface {
    /// Parsed command-line arguments
    args: CliArgs,

    /// Loaded configuration
    config: Config,
}

impl CliInterface {
    /// Create a new CLI interface from the process arguments
    pub fn new() -> Result<Self> {
        let args = CliArgs::parse();
        Self::from_args(args)
    }

    /// Create a CLI interface from already parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Self::load_config(&args)?;
        Ok(Self { args, config })
    }

    /// Load configuration from file and apply verbosity flags
    fn load_config(args: &CliArgs) -> Result<Config> {
        let mut config = Config::load_from_file(args.config_file.as_deref())?;

        if let Err(e) = config.validate() {
            eprintln!("Warning: Configuration validation failed: {}", e);
            eprintln!("Using default configuration instead.");
            config = Config::default();
            config.apply_env();
        }

        if let Some(level) = Self::verbosity_override(args) {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Log level forced by -v/--vv/-q, if any
    pub fn verbosity_override(args: &CliArgs) -> Option<LogLevel> {
        if args.very_verbose {
            Some(LogLevel::Trace)
        } else if args.verbose {
            Some(LogLevel::Debug)
        } else if args.quiet {
            Some(LogLevel::Error)
        } else {
            None
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn args(&self) -> &CliArgs {
        &self.args
    }

    fn formatter(&self) -> Result<Formatter> {
        let format = match &self.args.format {
            Some(raw) => raw.parse::<OutputFormat>()?,
            None => OutputFormat::Table,
        };
        Ok(Formatter::new(format, !self.args.no_color))
    }

    /// Execute the selected subcommand
    pub async fn execute(&self) -> Result<()> {
        match &self.args.command {
            Commands::Run {
                export,
                user,
                notify,
            } => self.run_queued(export, user, *notify).await,
            Commands::Stream { export, output } => {
                self.run_stream(export, output.as_deref()).await
            }
            Commands::Sweep => self.run_sweep(),
            Commands::Version => {
                self.show_version();
                Ok(())
            }
            Commands::Completion { shell } => completion::generate_completion(shell),
            Commands::Config { show, validate } => self.handle_config_command(*show, *validate),
        }
    }

    fn wrapper(&self) -> Result<ExportWrapper> {
        let source = Arc::new(JsonLinesSource::new(&self.config.source.data_dir));
        ExportWrapper::new(self.config.export.clone(), source, Arc::new(LogNotifier))
    }

    /// Submit one export, wait for its terminal state and print it
    async fn run_queued(&self, export: &ExportArgs, user: &str, notify: bool) -> Result<()> {
        let params = export.csv_params();
        let extra = export.extra_params()?;
        let wrapper = self.wrapper()?;
        wrapper.init()?;

        let code = match export.payload()? {
            ExportPayload::Facts(facts) => {
                wrapper.add_to_queue(facts, &export.title, params, user, extra, notify)?
            }
            ExportPayload::Custom(query) => {
                wrapper.add_to_queue_custom(query, &export.title, params, user, extra, notify)?
            }
        };
        if code != AddCode::Added {
            wrapper.shutdown().await;
            return Err(ExportError::Generic(format!("Export not queued: {:?}", code)));
        }
        let id = wrapper
            .get_user_exports(user)
            .last()
            .map(|item| item.id.clone())
            .ok_or_else(|| ExportError::Generic("Queued export disappeared".to_string()))?;
        info!(job = %id, "Waiting for export");

        let poll = self.config.export.dispatch_interval().min(Duration::from_millis(100));
        let mut canceled = false;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let spinner = job_spinner(&id, self.args.quiet);
        let item = loop {
            if let Some(item) = wrapper.get_user_export(&id, user) {
                if item.status.is_terminal() {
                    break item;
                }
                spinner.set_message(item.status.to_string());
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                result = &mut ctrl_c, if !canceled => {
                    if let Err(e) = result {
                        warn!("Failed to listen for Ctrl+C: {}", e);
                    }
                    canceled = true;
                    eprintln!("Canceling export {}...", id);
                    wrapper.delete_export(&id, user);
                }
            }
            if canceled && wrapper.get_user_export(&id, user).is_none() {
                spinner.finish_and_clear();
                wrapper.shutdown().await;
                return Err(ExportError::Generic("Export canceled before it started".to_string()));
            }
        };
        spinner.finish_and_clear();

        wrapper.shutdown().await;
        println!("{}", self.formatter()?.format_jobs(std::slice::from_ref(&item))?);

        match item.status {
            ExportStatus::Error => Err(ExportError::Generic(item.error)),
            _ => Ok(()),
        }
    }

    /// Stream an export to stdout or a file without queueing
    async fn run_stream(&self, export: &ExportArgs, output: Option<&Path>) -> Result<()> {
        let payload = export.payload()?;
        let params = export.csv_params();
        let extra = export.extra_params()?;
        let source = Arc::new(JsonLinesSource::new(&self.config.source.data_dir));

        let cancel = CancellationToken::new();
        let ctrl_c_handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => cancel.cancel(),
                    Err(e) => eprintln!("Failed to listen for Ctrl+C: {}", e),
                }
            })
        };

        let pipeline = StreamedExport::new(source, &payload, params.clone())
            .with_extra(extra)
            .with_batch_size(self.config.export.batch_size)
            .with_channel_capacity(self.config.export.channel_capacity)
            .with_cancellation(cancel);

        let result = match output {
            Some(path) => {
                let bar = row_progress(params.limit, path, self.args.quiet);
                let pipeline = pipeline.with_progress(bar);
                Self::stream_to_file(pipeline, path, !params.uncompressed_output).await
            }
            None => {
                let (sink, summary) = pipeline.run(std::io::stdout()).await.into_result()?;
                if let Some(mut stdout) = sink {
                    stdout.flush().map_err(ExportError::Sink)?;
                }
                Ok(summary)
            }
        };
        ctrl_c_handle.abort();

        let summary = result?;
        if !self.args.quiet {
            eprintln!("{}", self.formatter()?.format_summary(&summary));
        }
        Ok(())
    }

    async fn stream_to_file(
        pipeline: StreamedExport,
        path: &Path,
        compressed: bool,
    ) -> Result<crate::export::ExportSummary> {
        let writer = OutputWriter::create(path, compressed)?;
        let outcome = pipeline.run(writer).await;
        let failed = outcome.error.is_some() || outcome.canceled;

        let finished = match outcome.sink {
            Some(writer) if !failed => writer.finish().map_err(ExportError::Sink),
            _ => Ok(()),
        };
        if failed || finished.is_err() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove partial output {}: {}", path.display(), e);
            }
        }
        finished?;
        if let Some(e) = outcome.error {
            return Err(e);
        }
        Ok(crate::export::ExportSummary {
            rows: outcome.rows,
            elapsed_ms: outcome.elapsed_ms,
            canceled: outcome.canceled,
        })
    }

    fn run_sweep(&self) -> Result<()> {
        let stats = self.wrapper()?.check_for_expired_files();
        if !self.args.quiet {
            println!("{}", self.formatter()?.format_sweep(&stats));
        }
        Ok(())
    }

    fn show_version(&self) {
        println!("export-queue version {}", env!("CARGO_PKG_VERSION"));
        println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
    }

    fn handle_config_command(&self, show: bool, validate: bool) -> Result<()> {
        if validate {
            self.validate_config_file();
        }
        if show || !validate {
            self.show_config()?;
        }
        Ok(())
    }

    fn validate_config_file(&self) {
        let path = self.config_path();
        println!("Validating configuration file: {}", path.display());

        if !path.exists() {
            println!("Configuration file does not exist, defaults apply");
            return;
        }

        match Config::from_file(&path) {
            Ok(config) => match config.validate() {
                Ok(()) => println!("Configuration is valid"),
                Err(e) => println!("Configuration validation failed: {}", e),
            },
            Err(e) => println!("Failed to load configuration: {}", e),
        }
    }

    fn show_config(&self) -> Result<()> {
        println!("Configuration file: {}", self.config_path().display());
        println!();
        println!("{}", self.config.to_toml()?);
        Ok(())
    }

    /// Configuration file path (from args or default)
    pub fn config_path(&self) -> PathBuf {
        self.args
            .config_file
            .clone()
            .unwrap_or_else(Config::default_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    fn export_args(args: &[&str]) -> ExportArgs {
        let mut full = vec!["export-queue", "stream"];
        full.extend_from_slice(args);
        match parse(&full).command {
            Commands::Stream { export, .. } => export,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_run_command() {
        let args = parse(&[
            "export-queue",
            "-v",
            "run",
            "7:orders",
            "--title",
            "Orders",
            "--user",
            "alice",
            "--notify",
        ]);
        assert!(args.verbose);
        match args.command {
            Commands::Run {
                export,
                user,
                notify,
            } => {
                assert_eq!(user, "alice");
                assert!(notify);
                assert_eq!(export.title, "Orders");
                assert_eq!(
                    export.payload().unwrap(),
                    ExportPayload::Facts(vec![FactRef::new(7, "orders")])
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_row_progress_sizing() {
        let path = Path::new("orders.csv");
        assert_eq!(row_progress(25, path, false).length(), Some(25));
        assert_eq!(row_progress(0, path, false).length(), None);
        assert_eq!(row_progress(0, path, false).message(), "orders.csv");
        assert!(row_progress(25, path, true).is_hidden());
        assert!(job_spinner("job-1", true).is_hidden());
    }

    #[test]
    fn test_csv_params_from_flags() {
        let export = export_args(&[
            "orders",
            "--separator",
            ";",
            "--list-separator",
            "/",
            "--limit",
            "10",
            "--uncompressed",
            "--column",
            "user.name:User",
            "--column",
            "created:Created:%Y-%m-%d",
        ]);
        let params = export.csv_params();
        assert_eq!(params.separator, ';');
        assert_eq!(params.list_separator, '/');
        assert_eq!(params.limit, 10);
        assert!(params.uncompressed_output);
        assert_eq!(params.columns.len(), 2);
        assert_eq!(params.columns[0].label.as_deref(), Some("User"));
        assert_eq!(params.columns[1].format.as_deref(), Some("%Y-%m-%d"));
    }

    #[test]
    fn test_bare_fact_names_get_positional_ids() {
        let export = export_args(&["orders", "users"]);
        assert_eq!(
            export.payload().unwrap(),
            ExportPayload::Facts(vec![FactRef::new(1, "orders"), FactRef::new(2, "users")])
        );
        assert!(parse_fact("x:orders", 1).is_err());
        assert!(parse_fact("3:", 1).is_err());
    }

    #[test]
    fn test_custom_payload() {
        let export = export_args(&[
            "--index",
            "logs",
            "--request",
            r#"{"level": "error"}"#,
            "--connection",
            "main",
        ]);
        match export.payload().unwrap() {
            ExportPayload::Custom(query) => {
                assert_eq!(query.indices, vec!["logs".to_string()]);
                assert_eq!(query.requests, vec![json!({"level": "error"})]);
                assert_eq!(query.connection, "main");
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let bad = export_args(&["--index", "logs", "--request", "{oops"]);
        assert!(bad.payload().is_err());
        let mixed = export_args(&["orders", "--index", "logs"]);
        assert!(mixed.payload().is_err());
        assert!(export_args(&[]).payload().is_err());
    }

    #[test]
    fn test_extra_params() {
        let export = export_args(&["orders", "--extra", "region=eu", "--extra", "a.b=1=2"]);
        let extra = export.extra_params().unwrap();
        assert_eq!(extra.get("region").map(String::as_str), Some("eu"));
        assert_eq!(extra.get("a.b").map(String::as_str), Some("1=2"));

        let bad = export_args(&["orders", "--extra", "novalue"]);
        assert!(bad.extra_params().is_err());
    }

    #[test]
    fn test_verbosity_override() {
        let args = parse(&["export-queue", "--vv", "sweep"]);
        assert_eq!(CliInterface::verbosity_override(&args), Some(LogLevel::Trace));
        let args = parse(&["export-queue", "sweep", "-q"]);
        assert_eq!(CliInterface::verbosity_override(&args), Some(LogLevel::Error));
        let args = parse(&["export-queue", "sweep"]);
        assert_eq!(CliInterface::verbosity_override(&args), None);
    }

    #[tokio::test]
    async fn test_stream_to_file_writes_gzip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("orders.jsonl"), "{\"id\": 1}\n{\"id\": 2}\n").unwrap();
        let out = dir.path().join("orders.csv.gz");

        let pipeline = StreamedExport::new(
            Arc::new(JsonLinesSource::new(dir.path())),
            &ExportPayload::Facts(vec![FactRef::new(1, "orders")]),
            CsvParams::default(),
        );
        let summary = CliInterface::stream_to_file(pipeline, &out, true).await.unwrap();
        assert_eq!(summary.rows, 2);

        let mut decoder = flate2::read::GzDecoder::new(std::fs::File::open(&out).unwrap());
        let mut text = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut text).unwrap();
        assert_eq!(text, "id\n1\n2\n");
    }

    #[tokio::test]
    async fn test_stream_to_file_removes_output_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("missing.csv");

        let pipeline = StreamedExport::new(
            Arc::new(JsonLinesSource::new(dir.path())),
            &ExportPayload::Facts(vec![FactRef::new(1, "missing")]),
            CsvParams::default(),
        );
        let result = CliInterface::stream_to_file(pipeline, &out, false).await;
        tokio_test::assert_err!(result);
        assert!(!out.exists());
    }
}
