use common::{Candle, MacdParams, TrendAction};

const HISTOGRAM_EPSILON: f64 = 1e-9;

/// MACD histogram crossover classifier.
///
/// MACD line = EMA(fast) − EMA(slow), signal = EMA(MACD, signal). The latest
/// candle is `Up` when the histogram crosses above zero, `Down` when it crosses
/// below, and `NoTrend` otherwise.
#[derive(Debug, Clone, Copy)]
pub struct MacdClassifier {
    params: MacdParams,
}

impl MacdClassifier {
    pub fn new(params: MacdParams) -> Self {
        Self { params }
    }

    /// Candles needed before a classification is possible.
    pub fn min_candles(&self) -> usize {
        self.params.slow + self.params.signal
    }

    /// Classify the last candle of `candles` (oldest first).
    /// Returns `None` if there isn't enough history.
    pub fn classify(&self, candles: &[Candle]) -> Option<TrendAction> {
        if candles.len() < self.min_candles() {
            return None;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let MacdParams { fast, slow, signal } = self.params;

        let fast_ema = ema_series(&closes, fast);
        let slow_ema = ema_series(&closes, slow);
        // Both series end on the last close; align fast onto slow.
        let offset = slow - fast;
        let macd: Vec<f64> = slow_ema
            .iter()
            .enumerate()
            .map(|(i, s)| fast_ema[i + offset] - s)
            .collect();
        let signal_line = ema_series(&macd, signal);

        let n = signal_line.len();
        if n < 2 {
            return None;
        }
        let m = macd.len();
        let prev = snap(macd[m - 2] - signal_line[n - 2]);
        let curr = snap(macd[m - 1] - signal_line[n - 1]);

        Some(if prev <= 0.0 && curr > 0.0 {
            TrendAction::Up
        } else if prev >= 0.0 && curr < 0.0 {
            TrendAction::Down
        } else {
            TrendAction::NoTrend
        })
    }
}

/// Treat floating-point residue around zero as zero.
fn snap(histogram: f64) -> f64 {
    if histogram.abs() < HISTOGRAM_EPSILON {
        0.0
    } else {
        histogram
    }
}

/// EMA seeded with the SMA of the first `period` values.
/// Output has `values.len() - period + 1` points, the last aligned to the last input.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut current = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(current);
    for &v in &values[period..] {
        current = v * k + current * (1.0 - k);
        out.push(current);
    }
    out
}
