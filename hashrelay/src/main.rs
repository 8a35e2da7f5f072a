//! hashrelay - queue malware detection digests and relay them to a collector
//!
//! This tool provides commands for:
//! - Queueing detection records
//! - Inspecting the pending queue and sender status
//! - Resolving the collector address
//! - Sending the queue once, or running the background sender
//!
//! Uses XDG Base Directory specification for file locations:
//! - Queue: $XDG_DATA_HOME/hashrelay/pending.json (~/.local/share/hashrelay/pending.json)
//! - Logs: $XDG_STATE_HOME/hashrelay/ (~/.local/state/hashrelay/)
//! - Config: $XDG_CONFIG_HOME/hashrelay/config.toml (~/.config/hashrelay/config.toml)

mod process_lock;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use hashrelay_core::format::format_relative_time_opt;
use hashrelay_core::record::DEFAULT_HASH_TYPE;
use hashrelay_core::{Config, PendingRecord, Relay};
use process_lock::acquire_delivery_guard;

#[derive(Parser)]
#[command(name = "hashrelay")]
#[command(about = "Queue detection digests and relay them to a remote collector")]
#[command(version)]
struct Args {
    /// Verbose output (-v shows collector responses and record details)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: $XDG_CONFIG_HOME/hashrelay/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show sender configuration and queue status
    Status,

    /// Queue one detection record
    Add {
        /// Digest of the detected artifact
        hash: String,

        /// Digest algorithm
        #[arg(short = 't', long = "type", default_value = DEFAULT_HASH_TYPE)]
        hash_type: String,

        /// Malware family or detection name
        #[arg(short, long, default_value = "")]
        label: String,

        /// Matching rule identifier (repeatable)
        #[arg(short, long = "rule")]
        rules: Vec<String>,
    },

    /// List pending records
    Queue {
        /// Print the queue as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fetch the collector address from the bootstrap URL
    Resolve,

    /// Deliver the pending queue once
    Send,

    /// Run the background sender until Ctrl+C
    Run,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    // Initialize logging
    let _log_guard =
        hashrelay_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("hashrelay starting");

    match args.command {
        Command::Status => cmd_status(&config, args.verbose),
        Command::Add {
            hash,
            hash_type,
            label,
            rules,
        } => cmd_add(&config, hash, hash_type, label, rules),
        Command::Queue { json } => cmd_queue(&config, json, args.verbose),
        Command::Resolve => cmd_resolve(&config),
        Command::Send => cmd_send(&config, args.verbose),
        Command::Run => cmd_run(&config),
    }
}

fn open_relay(config: &Config) -> Result<Relay> {
    Relay::new(config).context("failed to initialize relay")
}

fn cmd_status(config: &Config, verbose: u8) -> Result<()> {
    println!("Hashrelay Sender Configuration");
    println!("==============================");
    println!();

    let sender = &config.sender;

    println!("Enabled:         {}", sender.enabled);
    println!(
        "Bootstrap URL:   {}",
        sender.bootstrap_url.as_deref().unwrap_or("<not set>")
    );
    println!(
        "Server URL:      {}",
        sender.server_url.as_deref().unwrap_or("<not set>")
    );
    println!("Poll Interval:   {}s", sender.poll_interval_secs);
    println!("Timeout:         {}s", sender.network_timeout_secs);
    println!("Max Attempts:    {}", sender.max_attempts);
    println!("Queue:           {}", config.queue_path().display());

    let relay = open_relay(config)?;
    let pending = relay.pending_count().context("failed to read queue")?;
    println!("Pending:         {}", pending);
    println!(
        "Collector:       {}",
        relay
            .endpoints()
            .map(|e| e.base)
            .unwrap_or_else(|| "<unknown>".to_string())
    );

    println!();
    if !sender.is_ready() {
        println!("Status: Not ready (no collector configured)");
        println!();
        println!("Point the sender at a collector in config.toml:");
        println!();
        println!("  [sender]");
        println!("  bootstrap_url = \"https://example.com/server_address.txt\"");
        println!("  # or");
        println!("  server_url = \"https://collector.example.com\"");
        return Ok(());
    }

    println!("Status: {}", relay.status_report());

    if verbose >= 1 {
        let state = relay.state();
        println!("Delivery state:  {}", state.status);
        println!("Next retry:      {}", format_relative_time_opt(state.next_retry_at));
        if let Some(endpoints) = relay.endpoints() {
            println!("Check URL:       {}", endpoints.check_url);
            println!("Report URL:      {}", endpoints.report_url);
        }
    }

    Ok(())
}

fn cmd_add(
    config: &Config,
    hash: String,
    hash_type: String,
    label: String,
    rules: Vec<String>,
) -> Result<()> {
    let record = PendingRecord::new(hash.trim())
        .with_type(hash_type)
        .with_label(label)
        .with_rules(&rules);
    record.validate().context("invalid record")?;

    let relay = open_relay(config)?;
    if !relay.add_record(record) {
        anyhow::bail!("failed to queue record; see the log for details");
    }

    let pending = relay.pending_count().context("failed to read queue")?;
    println!("Queued {} ({} pending)", hash.trim(), pending);
    Ok(())
}

fn cmd_queue(config: &Config, json: bool, verbose: u8) -> Result<()> {
    let relay = open_relay(config)?;
    let records = relay.pending().context("failed to read queue")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("failed to render queue")?
        );
        return Ok(());
    }

    if records.is_empty() {
        println!("No pending records.");
        return Ok(());
    }

    println!("Pending records ({}):", records.len());
    for record in &records {
        let label = if record.label.is_empty() {
            "-"
        } else {
            record.label.as_str()
        };
        println!("  [{}] {}  {}", record.hash_type, record.hash, label);
        if verbose >= 1 && !record.rule_match.is_empty() {
            println!("      rules: {}", record.rule_match);
        }
    }

    Ok(())
}

fn cmd_resolve(config: &Config) -> Result<()> {
    if config.sender.bootstrap_url.is_none() {
        println!("No bootstrap URL configured.");
    }

    let relay = open_relay(config)?;
    let resolved = relay.resolve();

    match relay.endpoints() {
        Some(endpoints) => {
            println!("Collector:  {}", endpoints.base);
            println!("Check:      {}", endpoints.check_url);
            println!("Report:     {}", endpoints.report_url);
            if !resolved {
                println!("(bootstrap fetch failed; showing last known address)");
            }
            Ok(())
        }
        None => anyhow::bail!("collector address could not be resolved"),
    }
}

fn cmd_send(config: &Config, verbose: u8) -> Result<()> {
    let _guard =
        acquire_delivery_guard(&config.queue_path()).context("failed to acquire process lock")?;

    let relay = open_relay(config)?;
    let pending = relay.pending_count().context("failed to read queue")?;
    if pending == 0 {
        println!("Nothing to send.");
        return Ok(());
    }

    if !relay.resolve() && relay.endpoints().is_none() {
        anyhow::bail!("collector address could not be resolved");
    }

    println!("Sending {} record(s)...", pending);
    let status = relay.send_now();
    let state = relay.state();

    println!("Result: {}", status);
    if verbose >= 1 {
        if let Some(response) = &state.last_response {
            println!("Collector response: {}", response);
        }
    }

    tracing::info!(status = %status, pending, "hashrelay send complete");

    if !status.is_success() {
        anyhow::bail!(
            "delivery did not complete ({}); {} record(s) kept for retry",
            status,
            relay.pending_count().unwrap_or(pending)
        );
    }

    Ok(())
}

fn cmd_run(config: &Config) -> Result<()> {
    let _guard =
        acquire_delivery_guard(&config.queue_path()).context("failed to acquire process lock")?;

    let relay = open_relay(config)?;
    if !relay.is_enabled() {
        println!("Background sender is disabled in config.toml ([sender] enabled = false).");
        return Ok(());
    }

    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    relay.start().context("failed to start background sender")?;

    println!(
        "Background sender active (poll every {}s). Press Ctrl+C to stop.",
        config.sender.poll_interval_secs
    );
    println!();

    let mut last_report = String::new();

    while running.load(Ordering::SeqCst) {
        // Only print when something changed
        let report = relay.status_report();
        if report != last_report {
            let timestamp = chrono::Local::now().format("%H:%M:%S");
            println!("[{}] {}", timestamp, report);
            last_report = report;
        }

        if !relay.is_running() {
            tracing::error!("Background sender exited unexpectedly");
            anyhow::bail!("background sender exited unexpectedly");
        }

        thread::sleep(Duration::from_millis(250));
    }

    // A send in progress may need every attempt to time out before it stops
    let sender = &config.sender;
    let grace = sender.network_timeout() * (sender.max_attempts + 1)
        + sender.retry_delay() * sender.max_attempts;
    if !relay.stop(grace) {
        println!("Background sender did not stop in time; exiting anyway.");
    }

    println!("Background sender stopped.");
    tracing::info!("hashrelay run stopped");

    Ok(())
}
