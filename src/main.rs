//! Margin Liquidator - Main Entry Point
//!
//! Runs the sweep producer and consumer workers against the ledger gateway,
//! or against an in-memory paper ledger seeded from a fixture.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use margin_liquidator::config::{CoordinationBackend, LoggingConfig};
use margin_liquidator::coordination;
use margin_liquidator::journal::ClosureJournal;
use margin_liquidator::ledger::{
    Address, FixedGasPrice, GasPolicy, HttpLedgerClient, Ledger, PaperLedger,
};
use margin_liquidator::pipeline::{Consumer, Producer};
use margin_liquidator::Config;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Margin Liquidator CLI
#[derive(Parser)]
#[command(name = "margin-liquidator")]
#[command(version, about = "Force-closes unsafe margin loans on a lending ledger")]
struct Cli {
    /// Ledger network (overrides ledger.network)
    #[arg(long, global = true)]
    network: Option<String>,

    /// Run against a paper ledger seeded from this JSON fixture
    #[arg(long, global = true, value_name = "FIXTURE")]
    paper: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the producer and consumer workers in one process (default)
    Run,

    /// Run only the sweep producer
    Produce,

    /// Run only consumer workers
    Consume {
        /// Number of workers (default: pipeline.workers)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show recent closure outcomes from the journal
    Status {
        /// Path to the journal database (default: journal.path)
        #[arg(short, long)]
        db: Option<String>,

        /// Number of recent entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(network) = cli.network {
        config.ledger.network = network;
    }
    config.validate()?;

    init_logging(&config.logging)?;

    let (run_producer, workers) = match cli.command.unwrap_or(Commands::Run) {
        Commands::Status { db, limit } => {
            let db = db.unwrap_or_else(|| config.journal.path.clone());
            return show_status(&db, limit);
        }
        Commands::Run => (true, config.pipeline.workers),
        Commands::Produce => (true, 0),
        Commands::Consume { workers } => (false, workers.unwrap_or(config.pipeline.workers)),
    };

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Margin Liquidator v{}                        ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    log_config(&config);

    // ═══════════════════════════════════════════════════════════════
    // Ledger binding
    // ═══════════════════════════════════════════════════════════════
    let (ledger, sender): (Arc<dyn Ledger>, Address) = match &cli.paper {
        Some(fixture) => {
            info!("📝 PAPER MODE - closures are simulated in memory");
            let json = std::fs::read_to_string(fixture)
                .with_context(|| format!("Failed to read paper fixture {}", fixture))?;
            let paper = PaperLedger::new();
            let seeded = paper.seed_from_json(&json).await?;
            info!("📂 [INIT] Paper ledger seeded with {} positions", seeded);

            let sender = if config.ledger.sender.is_empty() {
                Address::default()
            } else {
                parse_sender(&config.ledger.sender)?
            };
            let ledger: Arc<dyn Ledger> = Arc::new(paper);
            (ledger, sender)
        }
        None => {
            warn!("⚠️  LIVE MODE - closures are submitted to {}", config.ledger.gateway_url);
            let sender = parse_sender(&config.ledger.sender)?;
            let ledger: Arc<dyn Ledger> = Arc::new(HttpLedgerClient::new(&config.ledger)?);
            (ledger, sender)
        }
    };

    // ═══════════════════════════════════════════════════════════════
    // Coordination and journal
    // ═══════════════════════════════════════════════════════════════
    if config.coordination.backend == CoordinationBackend::Memory && !(run_producer && workers > 0) {
        warn!("⚠️  [INIT] Memory coordination backend is process-local; producer and consumers must share a process");
    }

    let dedup = coordination::connect(&config.coordination, &config.pipeline)
        .await
        .context("Failed to initialize coordination backend")?;
    info!("✅ [INIT] Coordination backend ready ({:?})", config.coordination.backend);

    let journal = if config.journal.enabled && workers > 0 {
        if let Some(parent) = Path::new(&config.journal.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Some(Arc::new(ClosureJournal::open(&config.journal.path)?))
    } else {
        None
    };

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let mut tasks = Vec::new();

    if run_producer {
        let producer = Arc::new(Producer::new(
            ledger.clone(),
            dedup.clone(),
            sender,
            config.pipeline.clone(),
        ));
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { producer.run(shutdown).await }));
        info!("🚀 [PRODUCER] Sweeping as {}", sender);
    }

    if workers > 0 {
        let gas = GasPolicy::new(
            config.gas.clone(),
            Arc::new(FixedGasPrice::new(config.gas.default_gas_price)),
        );
        let mut consumer = Consumer::new(ledger.clone(), dedup.clone(), gas, config.pipeline.clone());
        if let Some(journal) = journal {
            consumer = consumer.with_journal(journal);
        }
        let consumer = Arc::new(consumer);

        for worker in 0..workers {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                consumer.run_worker(worker, shutdown).await
            }));
        }
        {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move { consumer.run_reaper(shutdown).await }));
        }
        info!("🚀 [CONSUMER] {} workers started", workers);
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for task in tasks {
        if let Err(e) = task.await {
            error!("❌ Pipeline task ended abnormally: {}", e);
        }
    }

    info!("👋 Margin liquidator stopped");
    Ok(())
}

fn parse_sender(raw: &str) -> Result<Address> {
    raw.parse::<Address>()
        .map_err(|e| anyhow::anyhow!("Invalid ledger.sender '{}': {}", raw, e))
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(&config.directory)?;

    let file_appender = tracing_appender::rolling::hourly(&config.directory, "margin-liquidator.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("margin_liquidator=debug".parse()?)
        .add_directive(Level::INFO.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if config.json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Ledger: {} (network {})",
        config.ledger.gateway_url, config.ledger.network
    );
    info!("   Page Size: {}", config.pipeline.page_size);
    info!("   Max Blocks Delay: {}", config.pipeline.max_blocks_delay);
    info!("   Workers: {}", config.pipeline.workers);
    info!("   Marker TTL: {}s", config.pipeline.marker_ttl_secs);
    info!("   Visibility Timeout: {}s", config.pipeline.visibility_timeout_secs);
    info!("   Min Close Amount: {}", config.pipeline.min_close_amount);
    info!(
        "   Gas: buffer {}, multiplier {}x, cap {}",
        config.gas.limit_buffer, config.gas.fee_multiplier, config.gas.max_gas_limit
    );
    info!("   Coordination: {:?}", config.coordination.backend);
}

/// Print journal outcome counts and the most recent entries.
fn show_status(db_path: &str, limit: usize) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              MARGIN LIQUIDATOR STATUS                      ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Journal not found: {}", db_path);
        println!("   No consumer has run yet, or the journal path is incorrect.");
        return Ok(());
    }

    let journal = ClosureJournal::open(db_path)?;

    let counts = journal.outcome_counts()?;
    if counts.is_empty() {
        println!("\n❌ No closures recorded yet.");
        return Ok(());
    }

    println!("\n📊 Outcomes");
    for (outcome, count) in &counts {
        println!("   ├─ {:<18} {}", outcome, count);
    }

    println!("\n📜 Recent Closures");
    for entry in journal.recent(limit)? {
        let amount = if entry.close_amount == "0" {
            "max".to_string()
        } else {
            entry.close_amount.clone()
        };
        println!(
            "   ┌─ {} {} block {}",
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.outcome,
            entry.observed_block
        );
        println!("   ├─ Position: {} / {}", entry.position_id, entry.counterparty);
        println!(
            "   ├─ Amount:   {}{}",
            amount,
            if entry.is_forced { " (forced)" } else { "" }
        );
        if let Some(follow_up) = &entry.follow_up_amount {
            println!("   ├─ Follow-up: {}", follow_up);
        }
        if let Some(detail) = &entry.detail {
            println!("   ├─ Detail:   {}", detail);
        }
        println!(
            "   └─ Tx:       {}",
            entry.tx_hash.as_deref().unwrap_or("-")
        );
    }

    println!();
    Ok(())
}
