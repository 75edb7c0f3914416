//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use bulkmapper_core::input::TextEncoding;
use bulkmapper_core::pipeline::{BulkConfig, BulkSummary, ProgressReporter, run_bulk};
use bulkmapper_shared::{
    AppConfig, BulkMapperError, CleanupLevel, ClientConfig, Endpoint, MAX_NUM_THREADS,
    clamp_to_max, init_config, load_config, load_config_from, parse_base_url, resolve_api_key,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// bulkmapper: map company, domain and product strings in bulk.
#[derive(Parser)]
#[command(
    name = "bulkmapper",
    version,
    about = "Submit a file of raw inputs to the Mapper API and collect the results as CSV.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.bulkmapper/bulkmapper.toml.
    #[arg(long, env = "BULKMAPPER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Input cleanup level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum CleanupArg {
    High,
    Low,
}

impl From<CleanupArg> for CleanupLevel {
    fn from(arg: CleanupArg) -> Self {
        match arg {
            CleanupArg::High => CleanupLevel::High,
            CleanupArg::Low => CleanupLevel::Low,
        }
    }
}

/// Options for `bulkmapper map`.
#[derive(clap::Args, Debug)]
pub(crate) struct MapArgs {
    /// File with one input per row; an optional second column is a type hint.
    pub input: PathBuf,

    /// Endpoint: merchant-mapper, domain-mapper or product-mapper.
    #[arg(short, long)]
    pub endpoint: Option<Endpoint>,

    /// API key (defaults to the env var named in the config, MAPPER_API_KEY).
    #[arg(short, long)]
    pub key: Option<String>,

    /// Output CSV (defaults to <input stem>-<date>.csv next to the input).
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Re-process inputs already present in the output file.
    #[arg(short = 'F', long)]
    pub force: bool,

    /// Max concurrent requests (at most 8).
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u32).range(1..))]
    pub num_threads: Option<u32>,

    /// Attempts per request (at most 10).
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..))]
    pub num_retries: Option<u32>,

    /// Per-request timeout in seconds (at most 35).
    #[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Type hint sent with every input that has no hint of its own.
    #[arg(long, visible_alias = "th")]
    pub type_hint: Option<String>,

    /// Input cleanup level.
    #[arg(long, value_enum)]
    pub cleanup: Option<CleanupArg>,

    /// Inputs are clean company names (merchant-mapper only).
    #[arg(long)]
    pub companies_only: bool,

    /// Input file encoding (utf-8, utf-8-sig, utf-16, utf-16le, utf-16be, latin-1).
    /// Detected when omitted.
    #[arg(long, value_parser = TextEncoding::from_label)]
    pub encoding: Option<TextEncoding>,

    /// Write a UTF-8 BOM at the start of a new output file.
    #[arg(long)]
    pub bom: bool,

    /// Mapper API base URL.
    #[arg(long)]
    pub base_url: Option<String>,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Map every input in a file and append the results to a CSV.
    Map(MapArgs),

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "bulkmapper=info",
        1 => "bulkmapper=debug",
        _ => "bulkmapper=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Map(args) => cmd_map(args, config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// map
// ---------------------------------------------------------------------------

/// Merge config file values with command-line overrides.
///
/// Flags win over the config file; limits are applied after merging.
pub(crate) fn build_bulk_config(app: &AppConfig, args: MapArgs, api_key: String) -> Result<BulkConfig> {
    let mut client = ClientConfig::from_app(app, api_key)?;

    if let Some(raw) = args.base_url.as_deref() {
        client.base_url = parse_base_url(raw)?;
    }
    if let Some(endpoint) = args.endpoint {
        client.endpoint = endpoint;
    }
    if let Some(retries) = args.num_retries {
        client.num_retries = retries;
    }
    if let Some(secs) = args.timeout {
        client.timeout = Duration::from_secs(secs);
    }
    if let Some(cleanup) = args.cleanup {
        client.cleanup = cleanup.into();
    }
    client.type_hint = args.type_hint.filter(|h| !h.trim().is_empty());
    client.companies_only = args.companies_only;

    if client.companies_only && client.endpoint != Endpoint::MerchantMapper {
        return Err(eyre!("--companies-only only applies to the merchant-mapper endpoint"));
    }

    let client = client.with_limits();

    let mut bulk = BulkConfig::from_app(app, args.input, client);
    if let Some(threads) = args.num_threads {
        bulk.num_threads = clamp_to_max("number of threads", threads, MAX_NUM_THREADS) as usize;
    }
    bulk.output_path = args.out;
    bulk.input_encoding = args.encoding;
    bulk.force = args.force;
    bulk.output_bom = args.bom;

    Ok(bulk)
}

async fn cmd_map(args: MapArgs, config_path: Option<&Path>) -> Result<()> {
    let app = load_app_config(config_path)?;
    let api_key = resolve_api_key(args.key.as_deref(), &app)?;
    let config = build_bulk_config(&app, args, api_key)?;

    info!(
        input = %config.input_path.display(),
        endpoint = %config.client.endpoint,
        threads = config.num_threads,
        retries = config.client.num_retries,
        timeout_secs = config.client.timeout.as_secs(),
        force = config.force,
        "mapping inputs"
    );

    let reporter = CliProgress::new();

    let summary = match run_bulk(&config, &reporter).await {
        Ok(summary) => summary,
        Err(BulkMapperError::Auth(message)) => {
            reporter.abandon();
            return Err(eyre!(
                "the Mapper API rejected the API key: {message}\n\
                 Check --key or the {} environment variable.",
                app.api.api_key_env
            ));
        }
        Err(e) => {
            reporter.abandon();
            return Err(e.into());
        }
    };

    // Print summary
    println!();
    println!("  Bulk mapping finished.");
    println!("  Rows:      {}", summary.total_inputs);
    println!("  Succeeded: {}", summary.succeeded);
    println!("  Failed:    {}", summary.failed);
    println!("  Skipped:   {}", summary.skipped);
    println!("  Output:    {}", summary.output_path.display());
    println!(
        "  Time:      {:.1}s",
        summary.elapsed.as_secs_f64()
    );
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn abandon(&self) {
        self.spinner.abandon();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn batch_started(&self, batch: usize, size: usize, concurrency: usize) {
        self.spinner.set_message(format!(
            "Batch {batch}: {size} inputs, {concurrency} threads"
        ));
    }

    fn rows_written(&self, written: usize, remaining: usize) {
        self.spinner.set_message(format!(
            "Wrote {written} rows, {remaining} left"
        ));
    }

    fn done(&self, _summary: &BulkSummary) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load_app_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
