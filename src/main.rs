//! Perp Maker - Main Entry Point
//!
//! Paper trading against the simulated ledger, with an optional live hedge
//! venue, plus block monitoring through the RPC failover manager.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perp_maker::config::Config;
use perp_maker::exchange::{
    HedgeVenue, HedgeVenueClient, Ledger, MockHedgeVenue, MockLedger, TxOverrides,
};
use perp_maker::rpc::{DefaultProviderFactory, EndpointFailover, FailoverSettings};
use perp_maker::strategy::Maker;
use perp_maker::tx::{RetryPolicy, TxOperations, TxSequencer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Perp Maker CLI
#[derive(Parser)]
#[command(name = "perp-maker")]
#[command(version, about = "Range liquidity maker for a perpetual DEX")]
struct Cli {
    /// Config file (defaults to ./config.{toml,yaml,json} when present)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the maker (default)
    Run,
    /// Follow new blocks through the endpoint failover manager
    Blocks,
    /// Load and validate the configuration, then print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.json)?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_maker(config).await,
        Commands::Blocks => follow_blocks(config).await,
        Commands::CheckConfig => {
            config.validate()?;
            log_config(&config);
            info!("Configuration OK");
            Ok(())
        }
    }
}

async fn run_maker(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    info!("Perp Maker v{} starting", env!("CARGO_PKG_VERSION"));
    log_config(&config);
    let config = Arc::new(config);

    let ledger = Arc::new(MockLedger::from_config(&config));
    info!("Paper ledger enabled");
    if !config.chain.endpoints.is_empty() {
        // Paper nonces and gas are simulated; the endpoints only back `blocks`
        info!(
            endpoints = config.chain.endpoints.len(),
            "RPC endpoints unused in paper mode, nonces and gas come from the paper ledger"
        );
    }

    let venue: Arc<dyn HedgeVenue> = if config.hedge_venue.is_live() {
        warn!(base_url = %config.hedge_venue.base_url, "LIVE hedge venue - real orders will be placed");
        Arc::new(HedgeVenueClient::new(&config.hedge_venue)?)
    } else {
        info!("Paper hedge venue enabled");
        Arc::new(MockHedgeVenue::from_config(&config))
    };

    let sequencer = Arc::new(TxSequencer::new(
        ledger.clone(),
        RetryPolicy::from_config(&config.maker),
    ));
    let ledger: Arc<dyn Ledger> = ledger;
    let ops = Arc::new(TxOperations::new(
        ledger.clone(),
        sequencer,
        config.trader.address.clone(),
        TxOverrides::from_config(&config.maker),
        config.maker.confirm_timeout(),
    ));

    let maker = Maker::new(config.clone(), ledger, venue, ops)
        .await
        .context("Failed to initialize maker")?;
    maker.setup().await.context("Startup setup failed")?;

    tokio::select! {
        result = maker.run() => {
            if let Err(e) = result {
                error!(error = %e, "Maker stopped");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Perp Maker shutdown complete");
    Ok(())
}

async fn follow_blocks(config: Config) -> Result<()> {
    let chain = &config.chain;
    let factory = Arc::new(DefaultProviderFactory::new(Duration::from_millis(
        chain.http_poll_interval_ms,
    )));
    let failover = Arc::new(EndpointFailover::new(
        chain.layer,
        chain.endpoints.clone(),
        factory,
        FailoverSettings::from_config(chain),
    )?);

    let layer = chain.layer;
    failover
        .subscribe_blocks(move |block| info!(%layer, block, "New block"))
        .await;
    info!(%layer, endpoint = %failover.current_endpoint().await, "Following blocks");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "perp-maker.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("perp_maker=debug".parse()?)
        .add_directive(Level::INFO.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!(
        layer = %config.chain.layer,
        endpoints = config.chain.endpoints.len(),
        trader = %config.trader.address,
        "Chain"
    );
    info!(
        order_check_secs = config.maker.order_check_interval_secs,
        leverage = %config.maker.leverage,
        max_gas_gwei = %config.maker.adjust_max_gas_price_gwei,
        max_retries = config.maker.max_retry_count,
        "Maker"
    );
    info!(
        hedge = config.hedge.enabled,
        reduce = config.reduce.enabled,
        emergency = config.emergency.enabled,
        margin_threshold = %config.emergency.margin_ratio_threshold,
        "Routines"
    );
    for (name, market) in config.enabled_markets() {
        info!(
            market = %name,
            hedge_market = %market.hedge_market,
            liquidity = %market.liquidity_amount,
            range_offset = %market.range_offset,
            "Market"
        );
    }
}
