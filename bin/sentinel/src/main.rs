use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{
    shutdown_channel, CandleSource, Config, ConfigWatcher, Position, Shutdown, TradingApi,
    TradingMode,
};
use engine::{BitmexClient, Credentials, PositionStream, SignalExecutor};
use paper::PaperExchange;
use risk::{OrderProcessor, PositionCache, PositionScheduler};
use strategy::TimeframeLoop;

/// How often paper mode pulls a fresh quote from the public API.
const PAPER_QUOTE_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(mode = %cfg.trading_mode, symbol = %cfg.symbol, testnet = cfg.bitmex_testnet, "Sentinel starting");

    let (watcher, settings) = ConfigWatcher::new(
        &cfg.settings_path,
        Duration::from_secs(cfg.settings_reload_secs.max(1)),
    )
    .with_context(|| format!("loading settings from {}", cfg.settings_path))?;
    let initial = settings.borrow().clone();
    info!(
        timeframes = initial.timeframes.len(),
        scheduler_bin = %initial.scheduler_bin,
        "Settings loaded"
    );

    let (trigger, shutdown) = shutdown_channel();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ── Exchange wiring (injected based on TRADING_MODE) ──────────────────────
    let (position_tx, position_rx) = mpsc::channel::<Position>(64);
    let public = Arc::new(BitmexClient::public(cfg.bitmex_testnet).context("building HTTP client")?);
    let candles: Arc<dyn CandleSource> = public.clone();

    let client: Arc<dyn TradingApi> = match cfg.trading_mode {
        TradingMode::Live => {
            info!("Live trading mode, using BitMEX account");
            let credentials = Credentials::new(&cfg.bitmex_api_key, &cfg.bitmex_secret);
            let stream = PositionStream::new(
                &cfg.symbol,
                credentials.clone(),
                cfg.bitmex_testnet,
                position_tx,
            );
            tasks.push(tokio::spawn(stream.run(shutdown.clone())));
            Arc::new(
                BitmexClient::new(Some(credentials), cfg.bitmex_testnet)
                    .context("building HTTP client")?,
            )
        }
        TradingMode::Paper => {
            info!(balance_xbt = cfg.paper_balance_xbt, "Paper trading mode, using PaperExchange");
            let exchange = Arc::new(PaperExchange::new(&cfg.symbol, cfg.paper_balance_xbt));
            tasks.push(tokio::spawn(bridge_positions(
                exchange.subscribe_positions(),
                position_tx,
                shutdown.clone(),
            )));
            tasks.push(tokio::spawn(feed_quotes(
                exchange.clone(),
                public.clone(),
                cfg.symbol.clone(),
                shutdown.clone(),
            )));
            exchange
        }
    };

    // ── Risk ──────────────────────────────────────────────────────────────────
    let position: PositionCache = Arc::new(RwLock::new(None));
    let processor = Arc::new(OrderProcessor::new(&cfg.symbol, client.clone(), position.clone()));
    let scheduler = PositionScheduler::new(processor.clone(), client, position, settings.clone());

    // ── Signal pipeline ───────────────────────────────────────────────────────
    let (signal_tx, signal_rx) = mpsc::channel::<common::Signal>(128);
    for bin in initial.timeframes.iter().map(|tf| tf.bin) {
        let timeframe = TimeframeLoop::new(bin, &cfg.symbol, candles.clone(), settings.clone());
        tasks.push(tokio::spawn(timeframe.run(signal_tx.clone(), shutdown.clone())));
    }
    drop(signal_tx);
    let executor = SignalExecutor::new(signal_rx, processor, settings);

    // ── Spawn remaining tasks ─────────────────────────────────────────────────
    tasks.push(tokio::spawn(scheduler.run(position_rx, shutdown.clone())));
    tasks.push(tokio::spawn(executor.run(shutdown.clone())));
    tasks.push(tokio::spawn(watcher.run(shutdown)));

    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("Shutdown signal received. Stopping tasks.");
    trigger.trigger();

    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("Task did not stop within grace period");
        }
    }
    info!("Exiting.");
    Ok(())
}

/// Forward paper position updates onto the scheduler's channel.
async fn bridge_positions(
    mut rx: broadcast::Receiver<Position>,
    tx: mpsc::Sender<Position>,
    mut shutdown: Shutdown,
) {
    loop {
        let position = tokio::select! {
            res = rx.recv() => match res {
                Ok(position) => position,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Position bridge lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = shutdown.wait() => return,
        };
        if tx.send(position).await.is_err() {
            return;
        }
    }
}

/// Mark the paper book to the live public quote.
async fn feed_quotes(
    exchange: Arc<PaperExchange>,
    public: Arc<BitmexClient>,
    symbol: String,
    mut shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(PAPER_QUOTE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => return,
        }
        match public.get_quote(&symbol).await {
            Ok(quote) => exchange.set_quote(quote).await,
            Err(e) => warn!(error = %e, "Paper quote refresh failed"),
        }
    }
}
