use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use common::{
    Error, ExchangeOrder, PnlSample, Position, Result, SentinelConfig, Shutdown, TradingApi,
};

use crate::processor::{OrderIntent, OrderProcessor, PositionCache};
use crate::window::{classify, PnlWindow, WindowDecision};

/// Default period of the resting-order reconciliation tick.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Owns the position snapshot and the PnL window.
///
/// Position pushes and reconciliation ticks are handled on one serial loop, so
/// they never interleave. The window sits behind its own lock so
/// `pnl_window()` can be inspected from other tasks.
pub struct PositionScheduler {
    processor: Arc<OrderProcessor>,
    client: Arc<dyn TradingApi>,
    position: PositionCache,
    window: Arc<Mutex<PnlWindow>>,
    settings: watch::Receiver<Arc<SentinelConfig>>,
    reconcile_every: Duration,
}

impl PositionScheduler {
    pub fn new(
        processor: Arc<OrderProcessor>,
        client: Arc<dyn TradingApi>,
        position: PositionCache,
        settings: watch::Receiver<Arc<SentinelConfig>>,
    ) -> Self {
        let capacity = settings.borrow().pnl_window;
        Self {
            processor,
            client,
            position,
            window: Arc::new(Mutex::new(PnlWindow::new(capacity))),
            settings,
            reconcile_every: RECONCILE_INTERVAL,
        }
    }

    pub fn with_reconcile_interval(mut self, every: Duration) -> Self {
        self.reconcile_every = every;
        self
    }

    /// Shared handle to the PnL window for introspection.
    pub fn pnl_window(&self) -> Arc<Mutex<PnlWindow>> {
        self.window.clone()
    }

    /// Run until shutdown or until the position stream closes. Call from `tokio::spawn`.
    pub async fn run(self, mut updates: mpsc::Receiver<Position>, mut shutdown: Shutdown) {
        info!(symbol = %self.processor.symbol(), "PositionScheduler running");
        if let Err(e) = self.refresh_position().await {
            warn!(error = %e, "Initial position fetch failed");
        }

        let mut ticker = tokio::time::interval(self.reconcile_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(position) => {
                        if let Err(e) = self.on_position(position).await {
                            error!(error = %e, "Position close attempt failed");
                        }
                    }
                    None => {
                        warn!("Position channel closed, PositionScheduler exiting");
                        return;
                    }
                },

                _ = ticker.tick() => self.on_tick().await,

                _ = shutdown.wait() => {
                    info!("PositionScheduler stopping");
                    return;
                }
            }
        }
    }

    /// Store the pushed position, sample its PnL and close when the window says so.
    ///
    /// Returns the flattening order when one was placed. A failed close leaves the
    /// window untouched so the next sample re-evaluates it.
    pub async fn on_position(&self, position: Position) -> Result<Option<ExchangeOrder>> {
        *self.position.write().await = Some(position.clone());

        let settings = self.settings.borrow().clone();
        let tf = match settings.timeframe(settings.scheduler_bin) {
            Ok(tf) => tf,
            Err(e) => {
                warn!(error = %e, "Skipping PnL sample");
                return Ok(None);
            }
        };

        let value = position.unrealised_pnl_btc();
        let sample = PnlSample {
            value,
            class: classify(value, tf.close_position_min_btc),
        };

        let decision = {
            let mut window = self.window.lock().await;
            if window.capacity() != settings.pnl_window {
                window.set_capacity(settings.pnl_window);
            }
            window.push(sample);
            window.decision()
        };
        debug!(pnl_btc = value, class = ?sample.class, decision = ?decision, "PnL sampled");

        let WindowDecision::Close(reason) = decision else {
            return Ok(None);
        };

        let side = position.closing_side().ok_or(Error::NoOpenPosition)?;
        let quantity = position.current_qty.abs();
        info!(reason = ?reason, side = %side, qty = quantity, pnl_btc = value, "Closing position");

        let order = self
            .processor
            .place_order(&OrderIntent::close(side, quantity), tf)
            .await?;
        self.window.lock().await.clear();
        Ok(Some(order))
    }

    async fn on_tick(&self) {
        if let Err(e) = self.refresh_position().await {
            warn!(error = %e, "Position refresh failed");
        }
        match self.reconcile_orders().await {
            Ok(0) => {}
            Ok(amended) => info!(amended, "Resting orders repriced"),
            Err(e) => warn!(error = %e, "Order reconciliation failed"),
        }
    }

    /// Replace the snapshot with the exchange's current position. No PnL sampling.
    pub async fn refresh_position(&self) -> Result<()> {
        let position = self.client.get_position(self.processor.symbol()).await?;
        *self.position.write().await = Some(position);
        Ok(())
    }

    /// Move every resting priced order whose best quote has drifted further than
    /// `price_trailing`. Returns how many orders were amended.
    pub async fn reconcile_orders(&self) -> Result<usize> {
        let symbol = self.processor.symbol();
        let orders = self.client.open_orders(symbol).await?;
        if orders.is_empty() {
            return Ok(0);
        }

        let threshold = {
            let settings = self.settings.borrow();
            settings.timeframe(settings.scheduler_bin)?.price_trailing
        };
        let quote = self.client.get_quote(symbol).await?;

        let mut amended = 0;
        for order in orders {
            let Some(price) = order.price else {
                continue;
            };
            let target = quote.best_for(order.side);
            if (target - price).abs() <= threshold {
                continue;
            }
            match self.client.amend_order(&order.order_id, target).await {
                Ok(_) => {
                    debug!(order_id = %order.order_id, from = price, to = target, "Order repriced");
                    amended += 1;
                }
                Err(e) => warn!(order_id = %order.order_id, error = %e, "Amend failed"),
            }
        }
        Ok(amended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BinSize, FilterKind, MacdParams, OrderKind, Quote, Side, TimeframeConfig};
    use paper::PaperExchange;
    use tokio::sync::RwLock;

    const THRESHOLD_BTC: f64 = 0.001;

    fn settings() -> Arc<SentinelConfig> {
        Arc::new(SentinelConfig {
            pnl_window: 2,
            order_retry_count: 3,
            scheduler_bin: BinSize::FiveMinutes,
            timeframes: vec![TimeframeConfig {
                bin: BinSize::FiveMinutes,
                filter: FilterKind::Candles,
                buy_order_coef: 0.15,
                sell_order_coef: 0.10,
                limit_contracts_count: 500_000,
                close_position_min_btc: THRESHOLD_BTC,
                price_trailing: 5.0,
                max_filter_trend_count: 3,
                max_candles_filter_count: 3,
                protective_stop: false,
                candles: 100,
                macd: MacdParams::default(),
            }],
        })
    }

    struct Harness {
        scheduler: PositionScheduler,
        exchange: Arc<PaperExchange>,
        _settings_tx: watch::Sender<Arc<SentinelConfig>>,
    }

    async fn harness() -> Harness {
        let exchange = Arc::new(PaperExchange::new("XBTUSD", 1_000_000));
        exchange
            .set_quote(Quote { bid: 10_000.0, ask: 10_000.5, mark: 10_000.2 })
            .await;
        let cache: PositionCache = Arc::new(RwLock::new(None));
        let processor = Arc::new(OrderProcessor::new("XBTUSD", exchange.clone(), cache.clone()));
        let (settings_tx, settings_rx) = watch::channel(settings());
        let scheduler = PositionScheduler::new(processor, exchange.clone(), cache, settings_rx);
        Harness {
            scheduler,
            exchange,
            _settings_tx: settings_tx,
        }
    }

    /// Long 1000 contracts carrying `pnl_btc` of unrealised PnL.
    fn long_with_pnl(pnl_btc: f64) -> Position {
        Position {
            current_qty: 1_000,
            unrealised_pnl: (pnl_btc * 100_000_000.0).round() as i64,
            ..Position::flat("XBTUSD")
        }
    }

    #[tokio::test]
    async fn first_sample_never_closes() {
        let h = harness().await;
        let result = h.scheduler.on_position(long_with_pnl(-0.01)).await.unwrap();
        assert!(result.is_none());
        assert_eq!(h.scheduler.pnl_window().lock().await.len(), 1);
    }

    #[tokio::test]
    async fn two_losses_flatten_long_with_passive_sell() {
        let h = harness().await;
        h.scheduler.on_position(long_with_pnl(-0.0005)).await.unwrap();
        let order = h.scheduler.on_position(long_with_pnl(-0.0006)).await.unwrap();
        assert!(order.is_some());

        let sent = h.exchange.submitted().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].side, Side::Sell);
        assert_eq!(sent[0].quantity, 1_000);
        assert_eq!(sent[0].kind, OrderKind::Limit { price: 10_000.5 });
        assert!(sent[0].passive);
        assert!(h.scheduler.pnl_window().lock().await.is_empty());
    }

    #[tokio::test]
    async fn shrinking_profit_closes_growing_profit_holds() {
        let h = harness().await;
        h.scheduler.on_position(long_with_pnl(0.002)).await.unwrap();
        assert!(h.scheduler.on_position(long_with_pnl(0.003)).await.unwrap().is_none());
        assert_eq!(h.scheduler.pnl_window().lock().await.len(), 2);

        assert!(h.scheduler.on_position(long_with_pnl(0.0025)).await.unwrap().is_some());
        assert!(h.scheduler.pnl_window().lock().await.is_empty());
    }

    #[tokio::test]
    async fn short_position_closes_with_buy() {
        let h = harness().await;
        let short = |pnl_btc: f64| Position {
            current_qty: -700,
            ..long_with_pnl(pnl_btc)
        };
        h.scheduler.on_position(short(0.002)).await.unwrap();
        h.scheduler.on_position(short(-0.001)).await.unwrap();

        let sent = h.exchange.submitted().await;
        assert_eq!(sent[0].side, Side::Buy);
        assert_eq!(sent[0].quantity, 700);
    }

    #[tokio::test]
    async fn failed_close_keeps_window_for_retry() {
        let h = harness().await;
        h.exchange.fail_next_order("HTTP 502").await;

        h.scheduler.on_position(long_with_pnl(-0.0005)).await.unwrap();
        let err = h.scheduler.on_position(long_with_pnl(-0.0005)).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
        assert_eq!(h.scheduler.pnl_window().lock().await.len(), 2);

        let order = h.scheduler.on_position(long_with_pnl(-0.0005)).await.unwrap();
        assert!(order.is_some());
        assert!(h.scheduler.pnl_window().lock().await.is_empty());
    }

    #[tokio::test]
    async fn close_on_flat_position_reports_no_open_position() {
        let h = harness().await;
        let flat_losing = Position {
            current_qty: 0,
            ..long_with_pnl(-0.0005)
        };
        h.scheduler.on_position(flat_losing.clone()).await.unwrap();
        let err = h.scheduler.on_position(flat_losing).await.unwrap_err();
        assert!(matches!(err, Error::NoOpenPosition));
        assert!(h.exchange.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn reconciliation_amends_only_past_threshold() {
        let h = harness().await;
        let far = h
            .exchange
            .place_order(&common::OrderRequest::limit("XBTUSD", Side::Buy, 100, 9_990.0))
            .await
            .unwrap();
        h.exchange
            .place_order(&common::OrderRequest::limit("XBTUSD", Side::Sell, 100, 10_004.0))
            .await
            .unwrap();
        h.exchange
            .place_order(&common::OrderRequest::trailing_stop("XBTUSD", Side::Sell, 100, -10.0))
            .await
            .unwrap();

        assert_eq!(h.scheduler.reconcile_orders().await.unwrap(), 1);
        assert_eq!(h.exchange.amendments().await, vec![(far.order_id, 10_000.0)]);

        // Unchanged quote: nothing left to move.
        assert_eq!(h.scheduler.reconcile_orders().await.unwrap(), 0);
        assert_eq!(h.exchange.amendments().await.len(), 1);
    }

    #[tokio::test]
    async fn run_loop_processes_pushes_and_stops_on_shutdown() {
        let h = harness().await;
        let window = h.scheduler.pnl_window();
        let (tx, rx) = mpsc::channel(8);
        let (trigger, shutdown) = common::shutdown_channel();

        let task = tokio::spawn(h.scheduler.run(rx, shutdown));
        tx.send(long_with_pnl(-0.0005)).await.unwrap();
        tx.send(long_with_pnl(-0.0005)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.exchange.submitted().await.len(), 1);
        assert!(window.lock().await.is_empty());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("scheduler did not observe shutdown")
            .unwrap();
    }
}
