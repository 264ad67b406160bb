use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{BinSize, Error, Result, Shutdown};

/// Risk and filter settings file (TOML).
///
/// Example `config/sentinel.toml`:
/// ```toml
/// pnl_window = 2
/// order_retry_count = 3
/// scheduler_bin = "5m"
///
/// [[timeframe]]
/// bin = "5m"
/// filter = "candles"
/// buy_order_coef = 0.15
/// sell_order_coef = 0.10
/// limit_contracts_count = 500000
/// close_position_min_btc = 0.0005
/// price_trailing = 5.0
/// max_filter_trend_count = 4
/// max_candles_filter_count = 3
/// ```
///
/// The camelCase option names (`buyOrderCoef`, `closePositionMinBTC`, ...) are
/// accepted as aliases.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SentinelConfig {
    /// Capacity of the PnL sample window.
    #[serde(default = "default_pnl_window", alias = "pnlWindow")]
    pub pnl_window: usize,
    /// Attempts per confirmed signal when the exchange is unavailable.
    #[serde(default = "default_retry_count", alias = "orderRetryCount")]
    pub order_retry_count: u32,
    /// Timeframe whose thresholds drive the position scheduler.
    #[serde(alias = "schedulerBin")]
    pub scheduler_bin: BinSize,
    #[serde(rename = "timeframe", default)]
    pub timeframes: Vec<TimeframeConfig>,
}

/// Which confirmation filter a timeframe runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Window filter over the last `max_filter_trend_count` classifications.
    Trend,
    /// Run-tracking filter completing after `max_candles_filter_count` candles.
    #[default]
    Candles,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimeframeConfig {
    pub bin: BinSize,
    #[serde(default)]
    pub filter: FilterKind,

    #[serde(alias = "buyOrderCoef")]
    pub buy_order_coef: f64,
    #[serde(alias = "sellOrderCoef")]
    pub sell_order_coef: f64,
    /// Per-side contract exposure limit.
    #[serde(alias = "limitContractsCount")]
    pub limit_contracts_count: i64,
    /// PnL (BTC) at which a sample counts as profit; a third of it as loss.
    #[serde(alias = "closePositionMinBTC")]
    pub close_position_min_btc: f64,
    /// Quote deviation (USD) that triggers an order amendment.
    #[serde(alias = "priceTrailing")]
    pub price_trailing: f64,
    #[serde(alias = "maxFilterTrendCount")]
    pub max_filter_trend_count: usize,
    #[serde(alias = "maxCandlesFilterCount")]
    pub max_candles_filter_count: usize,

    /// Follow every confirmed entry with an opposite-side trailing stop.
    #[serde(default)]
    pub protective_stop: bool,
    /// Candles fetched per cycle for classification.
    #[serde(default = "default_candles")]
    pub candles: usize,
    #[serde(default)]
    pub macd: MacdParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct MacdParams {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self { fast: 12, slow: 26, signal: 9 }
    }
}

fn default_pnl_window() -> usize {
    2
}

fn default_retry_count() -> u32 {
    3
}

fn default_candles() -> usize {
    100
}

impl SentinelConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::InvalidConfiguration(msg) => {
                Error::InvalidConfiguration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: SentinelConfig =
            toml::from_str(content).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pnl_window == 0 {
            return Err(invalid("pnl_window must be at least 1"));
        }
        if self.order_retry_count == 0 {
            return Err(invalid("order_retry_count must be at least 1"));
        }
        for tf in &self.timeframes {
            let bin = tf.bin;
            for (name, coef) in [("buy_order_coef", tf.buy_order_coef), ("sell_order_coef", tf.sell_order_coef)] {
                if !(coef > 0.0 && coef <= 1.0) {
                    return Err(invalid(format!("{bin}: {name} must be in (0, 1], got {coef}")));
                }
            }
            if tf.limit_contracts_count <= 0 {
                return Err(invalid(format!("{bin}: limit_contracts_count must be positive")));
            }
            if tf.close_position_min_btc < 0.0 || tf.price_trailing < 0.0 {
                return Err(invalid(format!("{bin}: thresholds must not be negative")));
            }
            if tf.max_filter_trend_count == 0 || tf.max_candles_filter_count == 0 {
                return Err(invalid(format!("{bin}: filter lengths must be at least 1")));
            }
            if tf.macd.fast == 0 || tf.macd.fast >= tf.macd.slow || tf.macd.signal == 0 {
                return Err(invalid(format!("{bin}: macd requires 0 < fast < slow and signal > 0")));
            }
        }
        self.timeframe(self.scheduler_bin)?;
        Ok(())
    }

    /// Settings for `bin`, or `InvalidConfiguration` when the bin is not configured.
    pub fn timeframe(&self, bin: BinSize) -> Result<&TimeframeConfig> {
        self.timeframes
            .iter()
            .find(|tf| tf.bin == bin)
            .ok_or_else(|| invalid(format!("no settings for timeframe {bin}")))
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfiguration(msg.into())
}

/// Periodically re-reads the settings file and publishes validated snapshots.
///
/// Readers hold an `Arc<SentinelConfig>` for the duration of a decision; a reload
/// swaps the whole snapshot and never mutates one in place.
pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
    tx: watch::Sender<Arc<SentinelConfig>>,
}

impl ConfigWatcher {
    /// Load the initial snapshot and return the watcher with its subscriber.
    pub fn new(
        path: impl Into<PathBuf>,
        interval: Duration,
    ) -> Result<(Self, watch::Receiver<Arc<SentinelConfig>>)> {
        let path = path.into();
        let initial = SentinelConfig::load(&path)?;
        let (tx, rx) = watch::channel(Arc::new(initial));
        Ok((Self { path, interval, tx }, rx))
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        info!(path = %self.path.display(), "ConfigWatcher running");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reload(),
                _ = shutdown.wait() => {
                    info!("ConfigWatcher stopping");
                    return;
                }
            }
        }
    }

    fn reload(&self) {
        match SentinelConfig::load(&self.path) {
            Ok(next) => {
                let changed = self.tx.send_if_modified(|current| {
                    if **current == next {
                        false
                    } else {
                        *current = Arc::new(next);
                        true
                    }
                });
                if changed {
                    info!(path = %self.path.display(), "Settings reloaded");
                } else {
                    debug!("Settings unchanged");
                }
            }
            Err(e) => warn!(error = %e, "Settings reload rejected, keeping previous snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        scheduler_bin = "5m"

        [[timeframe]]
        bin = "5m"
        buyOrderCoef = 0.15
        sellOrderCoef = 0.10
        limitContractsCount = 500000
        closePositionMinBTC = 0.0005
        priceTrailing = 5.0
        maxFilterTrendCount = 4
        maxCandlesFilterCount = 3

        [[timeframe]]
        bin = "1h"
        filter = "trend"
        buy_order_coef = 0.2
        sell_order_coef = 0.2
        limit_contracts_count = 1000
        close_position_min_btc = 0.001
        price_trailing = 10.0
        max_filter_trend_count = 3
        max_candles_filter_count = 2
        protective_stop = true
    "#;

    #[test]
    fn parses_aliases_and_defaults() {
        let cfg = SentinelConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.pnl_window, 2);
        assert_eq!(cfg.order_retry_count, 3);

        let five = cfg.timeframe(BinSize::FiveMinutes).unwrap();
        assert_eq!(five.buy_order_coef, 0.15);
        assert_eq!(five.filter, FilterKind::Candles);
        assert_eq!(five.macd, MacdParams::default());

        let hour = cfg.timeframe(BinSize::OneHour).unwrap();
        assert_eq!(hour.filter, FilterKind::Trend);
        assert!(hour.protective_stop);
    }

    #[test]
    fn missing_timeframe_is_invalid_configuration() {
        let cfg = SentinelConfig::from_toml_str(SAMPLE).unwrap();
        assert!(matches!(
            cfg.timeframe(BinSize::OneDay),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_coefficient() {
        let broken = SAMPLE.replace("buyOrderCoef = 0.15", "buyOrderCoef = 1.5");
        assert!(matches!(
            SentinelConfig::from_toml_str(&broken),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn malformed_toml_is_invalid_configuration() {
        assert!(matches!(
            SentinelConfig::from_toml_str("pnlWindow = [unterminated"),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_unconfigured_scheduler_bin() {
        let broken = SAMPLE.replace("scheduler_bin = \"5m\"", "scheduler_bin = \"1d\"");
        assert!(SentinelConfig::from_toml_str(&broken).is_err());
    }

    #[tokio::test]
    async fn watcher_publishes_new_snapshot_on_change() {
        let path = std::env::temp_dir().join(format!("sentinel-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, SAMPLE).unwrap();

        let (watcher, rx) = ConfigWatcher::new(&path, Duration::from_secs(60)).unwrap();
        let before = rx.borrow().clone();

        std::fs::write(&path, SAMPLE.replace("priceTrailing = 5.0", "priceTrailing = 7.5")).unwrap();
        watcher.reload();

        let after = rx.borrow().clone();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.timeframe(BinSize::FiveMinutes).unwrap().price_trailing, 7.5);
        assert_eq!(before.timeframe(BinSize::FiveMinutes).unwrap().price_trailing, 5.0);

        std::fs::write(&path, "not toml at all [").unwrap();
        watcher.reload();
        assert_eq!(rx.borrow().timeframe(BinSize::FiveMinutes).unwrap().price_trailing, 7.5);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn shipped_settings_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/sentinel.toml");
        let cfg = SentinelConfig::load(path).unwrap();
        assert!(cfg.timeframe(cfg.scheduler_bin).is_ok());
        assert_eq!(cfg.timeframes.len(), 2);
    }
}
