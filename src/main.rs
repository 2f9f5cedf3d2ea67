//! Liquidation Shield - Main Entry Point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use liquidation_shield::config::Config;
use liquidation_shield::exchange::{BinanceClient, MarginVenue, MockVenue};
use liquidation_shield::health;
use liquidation_shield::strategy::{FundingStatus, PatrolLoop, TickReport};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Liquidation Shield CLI
#[derive(Parser)]
#[command(name = "liquidation-shield")]
#[command(version, about = "Isolated margin top-up and release for Binance futures")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Patrol positions until interrupted (default)
    Run,

    /// Run a single patrol tick and exit
    Once {
        /// Mirror the account into an in-memory venue and run the tick there
        #[arg(long)]
        dry_run: bool,
    },

    /// Scan positions and print the adjustment plans without moving funds
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Liquidation Shield v{}                       ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;
    log_config(&config);

    if config.binance.api_key.is_empty() || config.binance.secret_key.is_empty() {
        warn!("⚠️  No API keys provided. Signed requests will be rejected.");
    }
    if config.binance.testnet {
        info!("🧪 TESTNET MODE");
    }

    let client = BinanceClient::new(&config.binance)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Once { dry_run: true } => run_dry_run(&config, &client).await,
        command => {
            let venue: Arc<dyn MarginVenue> = Arc::new(client);
            let mut patrol = PatrolLoop::new(venue, &config);

            match command {
                Commands::Plan => run_plan(&mut patrol).await,
                Commands::Once { .. } => run_once(&mut patrol).await,
                Commands::Run => run_patrol(&config, &mut patrol).await,
            }
        }
    }
}

/// Patrol until Ctrl+C.
async fn run_patrol(config: &Config, patrol: &mut PatrolLoop) -> Result<()> {
    if config.health.enabled {
        let bind = config.health.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(&bind).await {
                error!("❌ [HEALTH] {:#}", e);
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_tx.send(true).ok();
    });

    info!("🚀 Starting patrol loop...");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    patrol.run(shutdown_rx).await;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("👋 Liquidation Shield shutdown complete ({} ticks)", patrol.ticks());
    Ok(())
}

/// Single tick, then print what happened.
async fn run_once(patrol: &mut PatrolLoop) -> Result<()> {
    info!("📡 [TICK] Running a single patrol tick");
    let report = patrol.tick().await.context("Patrol tick aborted")?;
    print_report(&report);
    Ok(())
}

/// Single tick against a mirrored copy of the account; nothing is sent live.
async fn run_dry_run(config: &Config, client: &BinanceClient) -> Result<()> {
    info!("📝 [DRY RUN] Mirroring account state");
    let simulated = Arc::new(
        MockVenue::mirror(client, &config.capital)
            .await
            .context("Failed to mirror account state")?,
    );

    let mut patrol = PatrolLoop::new(simulated.clone(), config);
    let report = patrol.tick().await.context("Patrol tick aborted")?;
    print_report(&report);

    let mutations = simulated.mutations().await;
    info!(
        "📝 [DRY RUN] {} call(s) would have been sent",
        mutations.len()
    );
    for call in &mutations {
        info!("   {:?}", call);
    }

    let state = simulated.snapshot().await;
    for (asset, balance) in &state.spot {
        info!("   Simulated spot {}: {}", asset, balance);
    }
    for (asset, balance) in &state.futures_wallet {
        if !balance.is_zero() {
            warn!("⚠️  [DRY RUN] {} {} left in futures wallet", balance, asset);
        }
    }
    Ok(())
}

/// Scan only.
async fn run_plan(patrol: &mut PatrolLoop) -> Result<()> {
    info!("📡 [SCAN] Scanning positions");
    let plans = patrol.plan().await.context("Position scan failed")?;

    if plans.is_empty() {
        info!("✅ [SCAN] No position needs an adjustment");
        return Ok(());
    }

    info!("📊 [SCAN] {} adjustment(s) planned", plans.len());
    for (i, plan) in plans.iter().enumerate() {
        info!(
            "   #{}: {} | {} {} {}",
            i + 1,
            plan.symbol,
            plan.direction,
            plan.magnitude,
            plan.asset
        );
    }
    Ok(())
}

fn print_report(report: &TickReport) {
    info!(
        "📊 [TICK] #{} started {} | {} plan(s) | {}ms",
        report.tick,
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.plans.len(),
        report.elapsed.as_millis()
    );

    for result in &report.reductions {
        log_result(
            "REDUCE",
            &result.symbol,
            result.amount,
            &result.asset,
            result.error(),
            result.is_stranded(),
        );
    }

    for funding in &report.additions {
        match &funding.status {
            FundingStatus::Funded(collection) => {
                info!(
                    "💰 [FUND] {} {} collected ({} draw(s))",
                    collection.funded(),
                    funding.asset,
                    collection.draws.len()
                );
                for draw in &collection.draws {
                    info!("   {}: {}", draw.tier, draw.amount);
                }
            }
            FundingStatus::Shortfall(collection) => {
                warn!(
                    "⚠️  [FUND] {} {} short of {}; {} addition(s) skipped",
                    collection.shortfall,
                    funding.asset,
                    funding.required,
                    funding.plans.len()
                );
            }
            FundingStatus::Failed(e) => {
                error!(
                    "❌ [FUND] {}; {} addition(s) skipped, {} draw(s) already in spot",
                    e,
                    funding.plans.len(),
                    e.committed.len()
                );
            }
        }

        for result in &funding.results {
            log_result(
                "ADD",
                &result.symbol,
                result.amount,
                &result.asset,
                result.error(),
                result.is_stranded(),
            );
        }
    }

    info!(
        "🏁 [TICK] applied: {} | failed: {} | skipped: {}",
        report.applied(),
        report.failed(),
        report.skipped_additions()
    );
}

fn log_result(
    action: &str,
    symbol: &str,
    amount: rust_decimal::Decimal,
    asset: &str,
    error: Option<&liquidation_shield::exchange::VenueError>,
    stranded: bool,
) {
    match error {
        None => info!("✅ [{}] {} {} {}", action, symbol, amount, asset),
        Some(e) if stranded => warn!(
            "⚠️  [{}] {} {} {} stranded in futures wallet: {}",
            action, symbol, amount, asset, e
        ),
        Some(e) => error!("❌ [{}] {} {} {} failed: {}", action, symbol, amount, asset, e),
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "liquidation-shield.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer flushing for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("liquidation_shield=debug".parse()?)
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

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Adjustment Threshold: {}",
        config.patrol.adjustment_threshold
    );
    info!("   Buffer Amount: {}", config.patrol.buffer_amount);
    info!(
        "   Patrol Frequency: {}s",
        config.patrol.patrol_frequency_secs
    );
    info!("   Cooldown Period: {}s", config.patrol.cooldown_period_secs);
    info!("   LTV Limit: {}", config.capital.ltv_limit);
    info!("   Collateral: {}", config.capital.collateral_asset);
    for (asset, product) in &config.capital.earn_products {
        info!("   Flexible Product: {} -> {}", asset, product);
    }
    if config.health.enabled {
        info!("   Health Endpoint: {}", config.health.bind);
    }
}
