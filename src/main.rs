use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod cli;

use cli::Cli;
use cli::commands::Commands;
use retrigger::collab::{IngestReport, ingest};
use retrigger::config::Config;
use retrigger::github::{GitHubClient, GitHubDiscovery, GitHubTrigger};
use retrigger::scheduler::{
    BreakerState, CircuitBreaker, PassReport, PassStatus, ProcessingLoop, RetryPolicy, SlotCalculator,
};
use retrigger::store::{ItemKey, StateStore};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("retrigger")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("retrigger.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Narrow the log level to the configured one unless RUST_LOG is in charge.
fn apply_log_level(cli: &Cli, config: &Config) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let level = if cli.is_verbose() {
        log::LevelFilter::Debug
    } else {
        config
            .log_level
            .as_deref()
            .and_then(|l| l.parse().ok())
            .unwrap_or(log::LevelFilter::Info)
    };
    log::set_max_level(level);
}

fn env_credential(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| eyre!("{} environment variable not set", var))
}

fn open_store(config: &Config) -> retrigger::Result<StateStore> {
    StateStore::open(
        &config.storage.db_path,
        std::time::Duration::from_millis(config.storage.busy_timeout_ms),
    )
}

fn github_client(config: &Config) -> Result<GitHubClient> {
    let token = env_credential(&config.github.token_env)?;
    GitHubClient::new(&config.github, token).context("Failed to create GitHub client")
}

/// Ctrl-C asks the running pass to stop at the next item boundary.
fn install_stop_handler() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current item");
            eprintln!("{}", "Interrupt received, stopping after the current item...".yellow());
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

async fn run_application(cli: &Cli, config: &Config) -> Result<ExitCode> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Scan => {
            handle_scan_command(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Process => handle_process_command(config).await,
        Commands::Run => {
            // A failed scan still leaves earlier discoveries to process
            if let Err(e) = handle_scan_command(config).await {
                log::error!("Scan failed: {:#}", e);
                eprintln!("{} {:#}", "Scan failed:".red(), e);
            }
            handle_process_command(config).await
        }
        Commands::Enqueue {
            namespace,
            identifier,
            throttle_secs,
        } => {
            handle_enqueue_command(namespace, *identifier, *throttle_secs, config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            handle_status_command(config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Prune { days } => {
            handle_prune_command(*days, config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn handle_scan_command(config: &Config) -> Result<IngestReport> {
    println!("{}", "Scanning repositories for rate-limited issues...".cyan());
    let store = open_store(config).context("Failed to open state store")?;
    let discovery = GitHubDiscovery::new(github_client(config)?, config.github.bot_login.clone());
    let policy = RetryPolicy::from_config(&config.scheduler);

    let report = ingest(&store, &discovery, &policy, chrono::Utc::now())
        .await
        .context("Scan failed")?;

    println!("\n{}", "Scan complete:".green());
    println!("  Issues queued:    {}", report.queued());
    println!("  Issues refreshed: {}", report.refreshed);
    println!("  Issues resolved:  {}", report.resolved);
    if report.ignored > 0 {
        println!("  Stale sightings:  {}", report.ignored);
    }
    if report.failures > 0 {
        println!("  {} {}", "Repo failures:".red(), report.failures);
    }
    Ok(report)
}

async fn handle_process_command(config: &Config) -> Result<ExitCode> {
    println!("{}", "Processing queued issues...".cyan());
    let store = match open_store(config) {
        Ok(store) => store,
        Err(e) => {
            log::error!("State store unavailable: {}", e);
            eprintln!("{} {}", "State store unavailable:".red(), e);
            return Ok(ExitCode::from(PassStatus::StoreUnavailable.exit_code()));
        }
    };

    let username = env_credential(&config.github.username_env)?;
    let trigger = GitHubTrigger::new(github_client(config)?, username, &config.github);
    let stop = install_stop_handler();

    let report = ProcessingLoop::new(&store, &trigger, config.scheduler.clone())
        .with_stop_flag(stop)
        .run_pass()
        .await;

    print_pass_report(&report);
    Ok(ExitCode::from(report.status.exit_code()))
}

fn print_pass_report(report: &PassReport) {
    let summary = &report.summary;
    println!("Available processing slots: {}", summary.available_slots);
    if let Some(at) = summary.next_slot_at {
        println!("No slots available. Next slot at: {}", at.to_rfc3339());
    }

    println!("\n{}", "Processing complete:".green());
    println!("  Processed:    {}", summary.attempted);
    println!("  Succeeded:    {}", summary.accepted);
    println!("  Rate limited: {}", summary.throttled);
    println!("  Failed:       {}", summary.errored);
    if summary.ceiling_reached > 0 {
        println!("  Gave up:      {}", summary.ceiling_reached);
    }

    let detail = report.detail.as_deref().unwrap_or("");
    match report.status {
        PassStatus::Completed => {}
        PassStatus::Cancelled => println!("{} {}", "Pass cancelled:".yellow(), detail),
        PassStatus::BreakerHalted => eprintln!("\n{} {}", "Circuit breaker open:".red(), detail),
        PassStatus::StoreUnavailable => eprintln!("\n{} {}", "State store unavailable:".red(), detail),
    }
}

fn handle_enqueue_command(namespace: &str, identifier: u64, throttle_secs: u64, config: &Config) -> Result<()> {
    let store = open_store(config).context("Failed to open state store")?;
    let policy = RetryPolicy::from_config(&config.scheduler);
    let key = ItemKey::new(namespace, identifier);
    let now = chrono::Utc::now();

    let outcome = store
        .upsert_item(&key, throttle_secs, now, &policy)
        .context("Failed to enqueue item")?;
    info!("Manual enqueue of {}: {:?}", key, outcome);

    let next = store
        .get_item(&key)?
        .map(|item| item.next_eligible_at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!("{} {} ({:?}, eligible at {})", "Enqueued:".green(), key, outcome, next);
    Ok(())
}

fn handle_status_command(config: &Config) -> Result<()> {
    let store = open_store(config).context("Failed to open state store")?;
    let now = chrono::Utc::now();

    let stats = store.queue_stats(now).context("Failed to read queue")?;
    let slots = SlotCalculator::new(&store, &config.scheduler).status(now)?;
    let breaker = CircuitBreaker::new(&store, &config.scheduler).evaluate(now)?;

    println!("{}", "Queue".cyan().bold());
    println!("  Pending:  {}", stats.pending);
    println!("  Eligible: {}", stats.eligible);
    println!("  Retried:  {}", stats.retried);
    println!("  Removed:  {}", stats.removed);

    println!("{}", "Capacity".cyan().bold());
    println!("  Slots: {}/{} available", slots.available, slots.total);
    if let Some(at) = slots.next_slot_at {
        println!("  Next slot at: {}", at.to_rfc3339());
    }

    println!("{}", "Circuit breaker".cyan().bold());
    let state = match breaker.state {
        BreakerState::Closed => breaker.state.as_str().green(),
        BreakerState::Open => breaker.state.as_str().red(),
    };
    println!(
        "  State: {} ({} consecutive failures, threshold {})",
        state, breaker.consecutive_failures, config.scheduler.breaker_threshold
    );
    Ok(())
}

fn handle_prune_command(days: i64, config: &Config) -> Result<()> {
    let store = open_store(config).context("Failed to open state store")?;
    let before = config.scheduler.prune_cutoff(chrono::Utc::now(), days)?;

    let (attempts, errors) = store.prune_history(before).context("Failed to prune history")?;
    info!("Pruned {} attempts and {} error events before {}", attempts, errors, before);
    println!(
        "{} {} attempts, {} error events older than {}",
        "Pruned:".green(),
        attempts,
        errors,
        before.to_rfc3339()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    apply_log_level(&cli, &config);

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")
}
