use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use common::{Error, ExchangeOrder, OrderRequest, Result, SentinelConfig, Shutdown, Signal};
use risk::{OrderIntent, OrderProcessor};

/// Delay before the first resubmission; doubles on every further attempt.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Turns confirmed signals into passive auto-sized entries.
///
/// Each order is built once per signal and the same request, `clOrdID`
/// included, is resubmitted on transient upstream failures up to
/// `order_retry_count` times with exponential backoff. An exchange that
/// already took an earlier attempt refuses the resubmission as a duplicate.
/// Risk rejections are final.
pub struct SignalExecutor {
    signal_rx: mpsc::Receiver<Signal>,
    processor: Arc<OrderProcessor>,
    settings: watch::Receiver<Arc<SentinelConfig>>,
    retry_backoff: Duration,
}

impl SignalExecutor {
    pub fn new(
        signal_rx: mpsc::Receiver<Signal>,
        processor: Arc<OrderProcessor>,
        settings: watch::Receiver<Arc<SentinelConfig>>,
    ) -> Self {
        Self {
            signal_rx,
            processor,
            settings,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Run the executor loop. Call from `tokio::spawn`.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!(symbol = %self.processor.symbol(), "SignalExecutor running");
        loop {
            let signal = tokio::select! {
                signal = self.signal_rx.recv() => match signal {
                    Some(signal) => signal,
                    None => {
                        warn!("SignalExecutor: signal channel closed");
                        return;
                    }
                },
                _ = shutdown.wait() => {
                    info!("SignalExecutor stopping");
                    return;
                }
            };

            if let Err(e) = self.execute(&signal, &mut shutdown).await {
                if e.is_risk_rejection() {
                    warn!(bin = %signal.bin, side = %signal.side, error = %e, "Signal refused by risk checks");
                } else {
                    error!(bin = %signal.bin, side = %signal.side, error = %e, "Signal execution failed");
                }
            }
            if shutdown.is_triggered() {
                info!("SignalExecutor stopping");
                return;
            }
        }
    }

    /// Place the entry for `signal` and, when configured, its protective stop.
    /// Returns the entry request the exchange now holds.
    pub async fn execute(&self, signal: &Signal, shutdown: &mut Shutdown) -> Result<OrderRequest> {
        let settings = self.settings.borrow().clone();
        let tf = settings.timeframe(signal.bin)?;
        let attempts = settings.order_retry_count.max(1);

        let entry = self
            .processor
            .prepare_order(&OrderIntent::entry(signal.side), tf)
            .await?;
        match self.submit_with_retry(&entry, attempts, shutdown).await {
            Ok(order) => info!(
                bin = %signal.bin,
                order_id = %order.order_id,
                side = %order.side,
                qty = order.quantity,
                "Entry placed"
            ),
            Err(Error::DuplicateOrder(_)) => info!(
                bin = %signal.bin,
                cl_ord_id = %entry.cl_ord_id,
                "Entry already accepted by an earlier attempt"
            ),
            Err(e) => return Err(e),
        }

        if tf.protective_stop && !shutdown.is_triggered() {
            let intent = OrderIntent::trailing_stop(signal.side.opposite(), entry.quantity);
            let placed = match self.processor.prepare_order(&intent, tf).await {
                Ok(stop) => self.submit_with_retry(&stop, attempts, shutdown).await,
                Err(e) => Err(e),
            };
            match placed {
                Ok(order) => info!(order_id = %order.order_id, side = %order.side, "Protective stop placed"),
                Err(Error::DuplicateOrder(_)) => info!("Protective stop already accepted by an earlier attempt"),
                Err(e) => error!(error = %e, "Protective stop failed"),
            }
        }
        Ok(entry)
    }

    /// Submit `request` until it is accepted, a non-transient error comes
    /// back, the attempts run out or shutdown fires during a backoff.
    async fn submit_with_retry(
        &self,
        request: &OrderRequest,
        attempts: u32,
        shutdown: &mut Shutdown,
    ) -> Result<ExchangeOrder> {
        let mut attempt = 1;
        loop {
            match self.processor.submit(request).await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        attempt,
                        attempts,
                        cl_ord_id = %request.cl_ord_id,
                        delay = ?delay,
                        error = %e,
                        "Order attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => {
                            info!(cl_ord_id = %request.cl_ord_id, "Retry abandoned on shutdown");
                            return Err(e);
                        }
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        BinSize, FilterKind, MacdParams, OrderKind, Position, Quote, Side, TimeframeConfig,
        TradingApi,
    };
    use std::time::Instant;
    use paper::PaperExchange;
    use tokio::sync::RwLock;
    use chrono::Utc;

    fn settings(protective_stop: bool, retries: u32) -> Arc<SentinelConfig> {
        Arc::new(SentinelConfig {
            pnl_window: 2,
            order_retry_count: retries,
            scheduler_bin: BinSize::OneHour,
            timeframes: vec![TimeframeConfig {
                bin: BinSize::OneHour,
                filter: FilterKind::Trend,
                buy_order_coef: 0.5,
                sell_order_coef: 0.5,
                limit_contracts_count: 10_000,
                close_position_min_btc: 0.001,
                price_trailing: 5.0,
                max_filter_trend_count: 3,
                max_candles_filter_count: 3,
                protective_stop,
                candles: 100,
                macd: MacdParams::default(),
            }],
        })
    }

    async fn harness(
        settings: Arc<SentinelConfig>,
    ) -> (Arc<PaperExchange>, SignalExecutor, mpsc::Sender<Signal>) {
        let exchange = Arc::new(PaperExchange::new("XBTUSD", 1_000_000));
        exchange
            .set_quote(Quote { bid: 9_999.5, ask: 10_000.0, mark: 9_999.7 })
            .await;
        let client: Arc<dyn TradingApi> = exchange.clone();
        let cache = Arc::new(RwLock::new(Some(Position::flat("XBTUSD"))));
        let processor = Arc::new(OrderProcessor::new("XBTUSD", client, cache));
        let (_settings_tx, settings_rx) = watch::channel(settings);
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let executor = SignalExecutor::new(signal_rx, processor, settings_rx)
            .with_retry_backoff(Duration::from_millis(20));
        (exchange, executor, signal_tx)
    }

    fn no_shutdown() -> Shutdown {
        let (trigger, shutdown) = common::shutdown_channel();
        std::mem::forget(trigger);
        shutdown
    }

    fn signal(side: Side) -> Signal {
        Signal {
            bin: BinSize::OneHour,
            side,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn entry_is_passive_and_auto_sized() {
        let (exchange, executor, _tx) = harness(settings(false, 3)).await;
        let order = executor.execute(&signal(Side::Buy), &mut no_shutdown()).await.unwrap();

        let submitted = exchange.submitted().await;
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].passive);
        assert_eq!(submitted[0].side, Side::Buy);
        // 0.01 BTC available * 0.5 coefficient, in contracts.
        assert_eq!(order.quantity, 500_000);
        assert_eq!(submitted[0].kind, OrderKind::Limit { price: 9_999.5 });
    }

    #[tokio::test]
    async fn protective_stop_follows_entry() {
        let (exchange, executor, _tx) = harness(settings(true, 3)).await;
        executor.execute(&signal(Side::Sell), &mut no_shutdown()).await.unwrap();

        let submitted = exchange.submitted().await;
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].side, Side::Buy);
        assert_eq!(submitted[1].quantity, submitted[0].quantity);
        assert!(matches!(submitted[1].kind, OrderKind::TrailingStop { .. }));
        assert!(!submitted[1].passive);
    }

    #[tokio::test]
    async fn upstream_failure_is_retried() {
        let (exchange, executor, _tx) = harness(settings(false, 3)).await;
        exchange.fail_next_order("timeout").await;
        exchange.fail_next_order("timeout").await;

        let started = Instant::now();
        executor.execute(&signal(Side::Buy), &mut no_shutdown()).await.unwrap();

        let submitted = exchange.submitted().await;
        assert_eq!(submitted.len(), 3);
        assert!(submitted.iter().all(|o| o.cl_ord_id == submitted[0].cl_ord_id));
        // 20ms then 40ms between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn accepted_entry_with_lost_response_is_not_duplicated() {
        let (exchange, executor, _tx) = harness(settings(false, 3)).await;
        exchange.lose_next_response("connection reset").await;

        let entry = executor
            .execute(&signal(Side::Buy), &mut no_shutdown())
            .await
            .unwrap();

        let submitted = exchange.submitted().await;
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].cl_ord_id, entry.cl_ord_id);
        assert_eq!(submitted[0].cl_ord_id, entry.cl_ord_id);
        let resting = exchange.open_orders("XBTUSD").await.unwrap();
        assert_eq!(resting.len(), 1);
        assert_eq!(resting[0].quantity, entry.quantity);
    }

    #[tokio::test]
    async fn protective_stop_follows_entry_accepted_on_lost_response() {
        let (exchange, executor, _tx) = harness(settings(true, 3)).await;
        exchange.lose_next_response("connection reset").await;

        executor
            .execute(&signal(Side::Sell), &mut no_shutdown())
            .await
            .unwrap();

        let submitted = exchange.submitted().await;
        assert_eq!(submitted.len(), 3);
        assert!(matches!(submitted[2].kind, OrderKind::TrailingStop { .. }));
        assert_eq!(submitted[2].quantity, submitted[0].quantity);
    }

    #[tokio::test]
    async fn shutdown_interrupts_retry_backoff() {
        let (exchange, executor, _tx) = harness(settings(false, 5)).await;
        let executor = executor.with_retry_backoff(Duration::from_secs(30));
        exchange.fail_next_order("down").await;

        let (trigger, mut shutdown) = common::shutdown_channel();
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            executor.execute(&signal(Side::Buy), &mut shutdown),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
        assert_eq!(exchange.submitted().await.len(), 1);
        stop.await.unwrap();
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (exchange, executor, _tx) = harness(settings(false, 2)).await;
        for _ in 0..3 {
            exchange.fail_next_order("down").await;
        }
        let err = executor.execute(&signal(Side::Buy), &mut no_shutdown()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
        assert_eq!(exchange.submitted().await.len(), 2);
    }

    #[tokio::test]
    async fn risk_rejection_is_not_retried() {
        let (exchange, executor, _tx) = harness(settings(false, 3)).await;
        exchange.set_available(5_000).await;

        let err = executor.execute(&signal(Side::Buy), &mut no_shutdown()).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert!(exchange.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn run_executes_signals_until_shutdown() {
        let (exchange, executor, tx) = harness(settings(false, 3)).await;
        let (trigger, shutdown) = common::shutdown_channel();
        let task = tokio::spawn(executor.run(shutdown));

        tx.send(signal(Side::Buy)).await.unwrap();
        for _ in 0..50 {
            if !exchange.submitted().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exchange.submitted().await.len(), 1);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
