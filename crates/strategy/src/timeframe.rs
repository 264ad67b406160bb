use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use common::{BinSize, CandleSource, Error, Result, SentinelConfig, Shutdown, Signal};

use crate::classify::MacdClassifier;
use crate::filters::{build_filter, limit_for, SignalFilter};

/// Drives one timeframe: fetch candles, classify the newest one, feed the
/// configured filter and forward confirmed sides as `Signal`s.
///
/// Owns its filter exclusively; timeframes share no state with each other.
pub struct TimeframeLoop {
    bin: BinSize,
    symbol: String,
    source: Arc<dyn CandleSource>,
    settings: watch::Receiver<Arc<SentinelConfig>>,
    filter: Option<Box<dyn SignalFilter>>,
    /// Timestamp of the last candle fed to the filter.
    last_seen: Option<DateTime<Utc>>,
}

impl TimeframeLoop {
    pub fn new(
        bin: BinSize,
        symbol: impl Into<String>,
        source: Arc<dyn CandleSource>,
        settings: watch::Receiver<Arc<SentinelConfig>>,
    ) -> Self {
        Self {
            bin,
            symbol: symbol.into(),
            source,
            settings,
            filter: None,
            last_seen: None,
        }
    }

    pub fn bin(&self) -> BinSize {
        self.bin
    }

    /// One decision cycle. Returns the confirmed signal, if any.
    ///
    /// A candle already fed to the filter is never fed twice, so polling faster
    /// than the bin period is harmless.
    pub async fn cycle(&mut self) -> Result<Option<Signal>> {
        let settings = self.settings.borrow().clone();
        let tf = settings.timeframe(self.bin)?;

        match self.filter.as_mut() {
            Some(filter) if filter.kind() == tf.filter => filter.set_limit(limit_for(tf)),
            _ => {
                info!(bin = %self.bin, kind = ?tf.filter, "Filter (re)built");
                self.filter = Some(build_filter(tf));
            }
        }

        let candles = self
            .source
            .recent_candles(&self.symbol, self.bin, tf.candles)
            .await?;
        let Some(latest) = candles.last() else {
            return Ok(None);
        };
        if self.last_seen == Some(latest.timestamp) {
            debug!(bin = %self.bin, "No new candle");
            return Ok(None);
        }
        let latest_ts = latest.timestamp;

        let Some(action) = MacdClassifier::new(tf.macd).classify(&candles) else {
            debug!(bin = %self.bin, have = candles.len(), "Not enough candles to classify");
            return Ok(None);
        };
        self.last_seen = Some(latest_ts);

        let Some(filter) = self.filter.as_mut() else {
            return Ok(None);
        };
        let confirmed = filter.apply(action, &candles);
        debug!(bin = %self.bin, action = ?action, confirmed = ?confirmed, "Candle classified");

        Ok(confirmed.side().map(|side| Signal {
            bin: self.bin,
            side,
            timestamp: latest_ts,
        }))
    }

    /// Run one cycle per bin period until shutdown. Call from `tokio::spawn`.
    pub async fn run(mut self, signal_tx: mpsc::Sender<Signal>, mut shutdown: Shutdown) {
        info!(bin = %self.bin, symbol = %self.symbol, "TimeframeLoop running");
        let mut ticker = tokio::time::interval(self.bin.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => {
                    info!(bin = %self.bin, "TimeframeLoop stopping");
                    return;
                }
            }

            match self.cycle().await {
                Ok(Some(signal)) => {
                    info!(bin = %signal.bin, side = %signal.side, "Signal confirmed");
                    if signal_tx.send(signal).await.is_err() {
                        warn!(bin = %self.bin, "Signal channel closed, stopping timeframe loop");
                        return;
                    }
                }
                Ok(None) => {}
                Err(e @ Error::InvalidConfiguration(_)) => {
                    warn!(bin = %self.bin, error = %e, "Skipping cycle");
                }
                Err(e) => warn!(bin = %self.bin, error = %e, "Cycle failed"),
            }
        }
    }
}
