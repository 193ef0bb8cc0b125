//! Fee management daemon for Lightning routing nodes.
//!
//! Policy-driven fee control with:
//! - CLI arguments and TOML config file support
//! - Ordered rule matching with pluggable fee strategies
//! - Phased rollout schedule with automatic rollback
//! - Structured logging with tracing

use std::sync::Arc;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use feepilot::{
    AppConfig, ExperimentController, JsonlStore, LndManageClient, LogFormat, NodeClient,
    PolicyEngine, RuleSet, TimeSeriesStore,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser)]
#[command(name = "feepilot")]
#[command(version, about = "Policy-driven fee manager for Lightning routing nodes", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "feepilot.toml", env = "FEEPILOT_CONFIG")]
    config: String,

    /// Override the node management API base URL
    #[arg(long)]
    node_url: Option<String>,

    /// Override the policy rule file path
    #[arg(long)]
    rules: Option<String>,

    /// Override the data directory for the time-series store
    #[arg(long)]
    data_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Output format (pretty, json, compact)
    #[arg(long)]
    log_format: Option<String>,

    /// Log file path (logs to both file and stdout)
    #[arg(long)]
    log_file: Option<String>,

    /// Dry run mode: validate config, connect, and enroll channels, but
    /// never apply a fee change
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample config file
    GenerateConfig {
        /// Output file path
        #[arg(short, long, default_value = "feepilot.toml")]
        output: String,
    },
    /// Validate config and rule file without running
    ValidateConfig,
    /// Show managed channels and current fees
    Status,
    /// Summarize recorded fee changes and rollbacks
    Report,
    /// Run the control loop (default)
    Run,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if it exists (before parsing CLI args)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::GenerateConfig { output }) => {
            generate_sample_config(output)?;
            return Ok(());
        }
        Some(Commands::ValidateConfig) => {
            let config = load_config(&cli)?;
            let rules = RuleSet::load(&config.engine.rule_file)?;
            println!("Configuration is valid ({} rules):\n{config:#?}", rules.len());
            return Ok(());
        }
        Some(Commands::Status) => {
            return show_status(&cli).await;
        }
        Some(Commands::Report) => {
            return show_report(&cli);
        }
        Some(Commands::Run) | None => {
            // Continue into the control loop below.
        }
    }

    let config = load_config(&cli)?;
    setup_logging(&config, &cli)?;

    // A malformed rule file refuses to start the engine.
    let rules = RuleSet::load(&config.engine.rule_file)?;
    let engine = PolicyEngine::new(rules, config.engine.clone());

    let client = Arc::new(LndManageClient::new(
        config.node.base_url.clone(),
        config.node.timeout(),
    )?);
    let store = JsonlStore::open(&config.storage.data_dir)?;

    print_startup_banner(&config, cli.dry_run);
    info!(
        node_url = %config.node.base_url,
        rule_file = %config.engine.rule_file,
        data_dir = %config.storage.data_dir,
        cycle_minutes = config.run_loop.cycle_interval_minutes,
        dry_run = cli.dry_run,
        "Starting fee pilot"
    );

    let mut controller = ExperimentController::new(config, client, store, engine);
    let enrolled = controller.initialize(chrono::Utc::now()).await?;

    if cli.dry_run {
        info!("=== DRY RUN MODE ===");
        info!("Configuration and rule file validated");
        info!(channels = enrolled, "Node connection verified, channels enrolled");
        info!("Exiting dry-run mode (no fees changed)");
        return Ok(());
    }

    // Shutdown flag: flips on Ctrl-C, interrupts the inter-cycle sleep but
    // never a cycle in progress.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(channels = enrolled, "Fee pilot initialized, starting control loop");
    if let Err(e) = controller.run(shutdown_rx).await {
        error!(error = %e, "control loop terminated with error");
        return Err(e.into());
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn load_config(cli: &Cli) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = AppConfig::load(&cli.config)?;
    // CLI args override config
    if let Some(ref url) = cli.node_url {
        config.node.base_url = url.clone();
    }
    if let Some(ref rules) = cli.rules {
        config.engine.rule_file = rules.clone();
    }
    if let Some(ref dir) = cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    Ok(config)
}

fn setup_logging(config: &AppConfig, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let level = cli.log_level.as_ref().unwrap_or(&config.logging.level);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(level)
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap())
    });

    let format = cli
        .log_format
        .as_deref()
        .unwrap_or(match config.logging.format {
            LogFormat::Json => "json",
            LogFormat::Compact => "compact",
            LogFormat::Pretty => "pretty",
        });

    let log_file = cli.log_file.as_ref().or(config.logging.log_file.as_ref());

    if let Some(log_path) = log_file {
        let file = std::fs::File::create(log_path)?;
        let file = Mutex::new(file);

        // When logging to file, use JSON format for both (easier to parse)
        let stdout_layer = tracing_subscriber::fmt::layer().json();
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .json();

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .init();

        eprintln!("Logging to file: {log_path} (JSON format for both stdout and file)");
    } else {
        match format {
            "json" => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .json()
                    .init();
            }
            "compact" => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .compact()
                    .init();
            }
            _ => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .init();
            }
        }
    }

    Ok(())
}

fn generate_sample_config(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let sample = AppConfig::default();
    let content = toml::to_string_pretty(&sample)?;

    let with_comments = format!(
        r#"# feepilot configuration
# See: feepilot --help

{content}
# Policy rules live in a separate file ([engine] rule_file).
# Update hours are UTC; fees only change during those hours.
"#
    );

    std::fs::write(path, with_comments)?;
    println!("Sample config written to: {path}");
    Ok(())
}

fn print_startup_banner(config: &AppConfig, dry_run: bool) {
    let version = env!("CARGO_PKG_VERSION");
    let mode = if dry_run { " [DRY RUN]" } else { "" };

    eprintln!();
    eprintln!("╔═══════════════════════════════════════════════════════════╗");
    eprintln!("║        feepilot v{version:<10}{mode:<10}                     ║");
    eprintln!("║                                                           ║");
    eprintln!("║  Node: {:<50} ║", config.node.base_url);
    eprintln!("╚═══════════════════════════════════════════════════════════╝");
    eprintln!();
}

/// Show managed channels without starting the loop.
async fn show_status(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli)?;

    println!("Connecting to {}...", config.node.base_url);
    let client = LndManageClient::new(config.node.base_url.clone(), config.node.timeout())?;
    let ids = client.list_channel_ids().await?;

    println!();
    println!("═══════════════════════════════════════════════════════════");
    println!("  Channel Status ({} channels)", ids.len());
    println!("═══════════════════════════════════════════════════════════");
    println!();

    for id in &ids {
        match client.channel_snapshot(id).await {
            Ok(snapshot) => {
                let total = snapshot.local_balance_sat + snapshot.remote_balance_sat;
                let ratio = if total > 0 {
                    snapshot.local_balance_sat as f64 / total as f64
                } else {
                    0.5
                };
                println!(
                    "  {:<16} cap {:>12}  local {:>5.1}%  out {:>5} ppm  in {:>5} ppm  {}",
                    id,
                    snapshot.capacity_sat,
                    ratio * 100.0,
                    snapshot.outbound_fee_ppm,
                    snapshot.inbound_fee_ppm,
                    snapshot.peer_alias.as_deref().unwrap_or("-"),
                );
            }
            Err(e) => println!("  {id:<16} unavailable: {e}"),
        }
    }

    println!();
    println!("═══════════════════════════════════════════════════════════");
    println!();
    Ok(())
}

/// Summarize recorded changes and safety events from the store.
fn show_report(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli)?;
    let store = JsonlStore::open(&config.storage.data_dir)?;

    let experiment = store.load_experiment()?;
    let channels = store.load_channels()?;
    let rollbacks = store.query_rollbacks()?;

    println!();
    println!("═══════════════════════════════════════════════════════════");
    println!("  Experiment Report");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    match experiment {
        Some(record) => {
            println!("  Started:        {}", record.started_at);
            println!("  Channels:       {}", record.channel_count);
        }
        None => println!("  No experiment recorded in {}", config.storage.data_dir),
    }

    if !channels.is_empty() {
        let mut by_segment: std::collections::BTreeMap<String, usize> =
            std::collections::BTreeMap::new();
        for channel in &channels {
            *by_segment.entry(channel.segment.clone()).or_default() += 1;
        }
        println!();
        println!("  Segments:");
        for (segment, count) in by_segment {
            println!("    {segment:<20} {count}");
        }

        println!();
        println!("  Fees (baseline -> current):");
        for channel in &channels {
            println!(
                "    {:<16} out {:>5} -> {:<5}  in {:>5} -> {:<5}",
                channel.channel_id,
                channel.baseline_outbound_ppm,
                channel.current_outbound_ppm,
                channel.baseline_inbound_ppm,
                channel.current_inbound_ppm,
            );
        }
    }

    println!();
    println!("  Rollbacks:      {}", rollbacks.len());
    for rollback in &rollbacks {
        println!(
            "    {} {:<16} {}",
            rollback.at.format("%Y-%m-%d %H:%M"),
            rollback.channel_id,
            rollback.reason
        );
    }
    println!();
    println!("═══════════════════════════════════════════════════════════");
    println!();
    Ok(())
}
