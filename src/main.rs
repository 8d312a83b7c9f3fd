//! Order Scheduler - Main Entry Point
//!
//! Runs strategy trigger loops and the reconciliation loop against Binance
//! Futures, or against the in-memory mock venue for paper trading.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use order_scheduler::config::Config;
use order_scheduler::engine::{
    BracketManager, BracketStatus, DecisionSource, EventJournal, JsonFileDecisionSource,
    MarginModeCoordinator, MarginTaskPool, OrderScheduler, OrderStatus, OrderSubmitter, OrderSync,
    RetryPolicy, SymbolGate,
};
use order_scheduler::exchange::{BinanceClient, ExchangeAdapter, MockExchange, SymbolFilters};
use order_scheduler::persistence::OrderStore;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Order Scheduler CLI
#[derive(Parser)]
#[command(name = "order-scheduler")]
#[command(version, about = "Idempotent order scheduling and reconciliation for Binance Futures")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run strategy triggers and the order sync loop until Ctrl-C
    Run {
        /// Trade against the in-memory mock venue
        #[arg(long)]
        mock: bool,
    },

    /// Run a single reconciliation pass and print the report
    Sync {
        /// Reconcile against the in-memory mock venue
        #[arg(long)]
        mock: bool,
    },

    /// Show executions, open orders, brackets and recent events
    Status {
        /// Number of executions and events to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

/// Shared engine components.
struct Engine {
    store: Arc<OrderStore>,
    margin_pool: Arc<MarginTaskPool>,
    scheduler: Arc<OrderScheduler>,
    sync: Arc<OrderSync>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Some(Commands::Status { limit }) => show_status(&config.database.path, limit),
        Some(Commands::Sync { mock }) => run_sync_once(&config, mock).await,
        Some(Commands::Run { mock }) => run(&config, mock).await,
        None => run(&config, false).await,
    }
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "order-scheduler.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("order_scheduler=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn log_config(config: &Config, mock: bool) {
    info!("📋 Configuration:");
    info!("   Venue: {}", if mock { "mock" } else if config.binance.testnet { "testnet" } else { "live" });
    info!("   Database: {}", config.database.path);
    info!("   Lease TTL: {}s", config.scheduler.lease_ttl_secs);
    info!("   Call Timeout: {}s", config.submission.call_timeout_secs);
    info!(
        "   Margin Pool: {} workers, queue {}",
        config.margin.worker_count, config.margin.queue_capacity
    );
    info!("   Sync Interval: {}s", config.sync.interval_secs);
    for strategy in &config.strategies {
        info!(
            "   Strategy {}: every {}s, {} {}x{}",
            strategy.id,
            strategy.interval(&config.scheduler).as_secs(),
            strategy.margin_mode,
            strategy.leverage,
            if strategy.enabled { "" } else { " (disabled)" }
        );
    }
}

fn build_exchange(config: &Config, mock: bool) -> Result<Arc<dyn ExchangeAdapter>> {
    if mock {
        info!("📝 MOCK VENUE - paper trading enabled");
        return Ok(Arc::new(MockExchange::new().with_default_filters(
            SymbolFilters {
                step_size: dec!(0.001),
                min_notional: dec!(5),
                min_qty: dec!(0.001),
                max_qty: dec!(1000000),
                tick_size: dec!(0.01),
            },
        )));
    }

    if config.binance.api_key.is_empty() || config.binance.secret_key.is_empty() {
        anyhow::bail!("Binance credentials missing; set OSCHED__BINANCE__API_KEY/SECRET_KEY or use --mock");
    }
    if !config.binance.testnet {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
    }
    let client = BinanceClient::new(&config.binance, config.submission.call_timeout())?;
    Ok(Arc::new(client))
}

fn build_engine(config: &Config, exchange: Arc<dyn ExchangeAdapter>) -> Result<Engine> {
    let store = Arc::new(
        OrderStore::new(&config.database.path)
            .with_context(|| format!("Failed to open order store {}", config.database.path))?,
    );
    let journal = EventJournal::new(store.clone());
    let call_timeout = config.submission.call_timeout();
    let gate = Arc::new(SymbolGate::new());

    let margin = Arc::new(MarginModeCoordinator::new(
        exchange.clone(),
        journal.clone(),
        RetryPolicy::new(config.margin.max_retries, config.margin.retry_backoff_ms),
        call_timeout,
    ));
    let margin_pool = Arc::new(MarginTaskPool::start(
        margin.clone(),
        gate.clone(),
        config.margin.worker_count,
        config.margin.queue_capacity,
    ));
    let submitter = Arc::new(OrderSubmitter::new(
        exchange.clone(),
        store.clone(),
        journal.clone(),
        margin,
        gate,
        RetryPolicy::new(
            config.submission.max_retries,
            config.submission.retry_backoff_ms,
        ),
        call_timeout,
        Duration::from_secs(config.submission.filter_cache_secs),
    ));
    let brackets = Arc::new(BracketManager::new(
        store.clone(),
        journal.clone(),
        submitter.clone(),
        RetryPolicy::new(config.bracket.cancel_max_retries, config.bracket.cancel_backoff_ms),
    ));
    let sync = Arc::new(OrderSync::new(
        store.clone(),
        journal.clone(),
        submitter.clone(),
        brackets.clone(),
        Duration::from_secs(config.sync.pending_grace_secs),
    ));

    let decisions: Arc<dyn DecisionSource> =
        Arc::new(JsonFileDecisionSource::new(&config.scheduler.signals_dir));
    let scheduler = Arc::new(OrderScheduler::new(
        store.clone(),
        journal,
        exchange,
        submitter,
        brackets,
        margin_pool.clone(),
        decisions,
        Duration::from_secs(config.scheduler.lease_ttl_secs),
        call_timeout,
    ));

    Ok(Engine {
        store,
        margin_pool,
        scheduler,
        sync,
    })
}

async fn run(config: &Config, mock: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║             Order Scheduler v{}                         ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(config, mock);

    let exchange = build_exchange(config, mock)?;
    let engine = build_engine(config, exchange)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received, stopping new triggers...");
        shutdown_tx.send_replace(true);
    });

    let mut loops = Vec::new();
    for strategy in config.strategies.iter().filter(|s| s.enabled) {
        let interval = strategy.interval(&config.scheduler);
        loops.push(tokio::spawn(engine.scheduler.clone().run_strategy(
            strategy.clone(),
            interval,
            shutdown_rx.clone(),
        )));
    }
    if loops.is_empty() {
        warn!("No enabled strategies configured, running order sync only");
    }

    let sync = engine.sync.clone();
    let sync_interval = Duration::from_secs(config.sync.interval_secs);
    let sync_rx = shutdown_rx.clone();
    loops.push(tokio::spawn(async move {
        sync.run(sync_interval, sync_rx).await;
    }));

    for handle in loops {
        if let Err(e) = handle.await {
            error!(error = %e, "Loop task panicked");
        }
    }

    engine.margin_pool.shutdown().await;

    let open = engine.store.orders_with_status(OrderStatus::Submitted)?.len()
        + engine.store.orders_with_status(OrderStatus::Pending)?.len();
    info!("👋 Order scheduler stopped ({} orders still open on the venue side)", open);
    Ok(())
}

async fn run_sync_once(config: &Config, mock: bool) -> Result<()> {
    let exchange = build_exchange(config, mock)?;
    let engine = build_engine(config, exchange)?;

    let report = engine.sync.run_once().await?;
    engine.margin_pool.shutdown().await;

    println!("🔄 Order sync pass");
    println!("   ├─ Orders Checked:    {}", report.orders_checked);
    println!("   ├─ Orders Corrected:  {}", report.orders_corrected);
    println!("   ├─ Ambiguous:         {}", report.ambiguous);
    println!("   ├─ Brackets Checked:  {}", report.brackets_checked);
    println!(
        "   ├─ Orphans Resolved:  {}/{}",
        report.orphans_resolved, report.orphans_retried
    );
    println!("   └─ Errors:            {}", report.errors);
    Ok(())
}

/// Print persisted state; never touches the exchange.
fn show_status(db_path: &str, limit: usize) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              ORDER SCHEDULER STATUS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The scheduler has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = OrderStore::new(db_path)?;

    let executions = store.recent_executions(limit)?;
    println!("\n📈 Recent Executions");
    if executions.is_empty() {
        println!("   (none)");
    }
    for execution in &executions {
        println!(
            "   ├─ #{} {} [{}] orders {} filled {} failed {} pnl {:.4} @ {}",
            execution.id,
            execution.strategy_id,
            execution.status,
            execution.orders_total,
            execution.orders_filled,
            execution.orders_failed,
            execution.realized_pnl,
            execution.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
        if let Some(error) = &execution.error {
            println!("   │    error: {}", error);
        }
    }

    let mut open = store.orders_with_status(OrderStatus::Pending)?;
    open.extend(store.orders_with_status(OrderStatus::Submitted)?);
    println!("\n🔓 Open Orders");
    if open.is_empty() {
        println!("   (none)");
    }
    for order in &open {
        println!(
            "   ┌─ {} {} {} {:?} [{}]",
            order.client_order_id, order.symbol, order.side, order.leg, order.status
        );
        println!(
            "   ├─ Quantity: requested {} / adjusted {}",
            order.requested_qty,
            order
                .adjusted_qty
                .map(|q| q.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        if order.intended_margin.is_some() || order.effective_margin.is_some() {
            println!(
                "   ├─ Margin: intended {} / effective {}",
                order
                    .intended_margin
                    .map(|m| format!("{:.4}", m))
                    .unwrap_or_else(|| "-".to_string()),
                order
                    .effective_margin
                    .map(|m| format!("{:.4}", m))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        if let Some(error) = &order.last_error {
            println!("   ├─ Last Error: {}", error);
        }
        println!("   └─ Updated: {}", order.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    println!("\n🎯 Brackets");
    let mut any = false;
    for status in [
        BracketStatus::Created,
        BracketStatus::Active,
        BracketStatus::Orphaned,
    ] {
        for link in store.brackets_with_status(status)? {
            any = true;
            let marker = if status == BracketStatus::Orphaned { "⚠️ " } else { "" };
            println!(
                "   ├─ {}#{} {} [{}] entry {} tp {} sl {}",
                marker, link.id, link.symbol, link.status, link.entry_client_id, link.tp_client_id, link.sl_client_id
            );
        }
    }
    if !any {
        println!("   (none open)");
    }

    let events = store.recent_events(limit)?;
    println!("\n📜 Recent Events");
    if events.is_empty() {
        println!("   (none)");
    }
    for event in &events {
        println!(
            "   ├─ {} {} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.kind,
            event.symbol.as_deref().unwrap_or("-")
        );
    }

    println!();
    Ok(())
}
