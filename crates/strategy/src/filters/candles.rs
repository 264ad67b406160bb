use common::{Candle, FilterKind, TradeSide, TrendAction};

use super::SignalFilter;

/// Run-tracking filter.
///
/// A directional classification opens (or restarts) a run; every following
/// `NoTrend` candle extends it. When the run length reaches the configured
/// maximum the side opposite to the run is emitted and all state resets.
#[derive(Debug, Clone)]
pub struct CandlesFilter {
    max_count: usize,
    is_up: bool,
    is_down: bool,
    extreme: f64,
    count: usize,
    pending: TradeSide,
}

impl CandlesFilter {
    pub fn new(max_count: usize) -> Self {
        Self {
            max_count: max_count.max(1),
            is_up: false,
            is_down: false,
            extreme: 0.0,
            count: 0,
            pending: TradeSide::Empty,
        }
    }

    pub fn run_length(&self) -> usize {
        self.count
    }

    /// Highest close of an up run, lowest close of a down run.
    pub fn extreme(&self) -> f64 {
        self.extreme
    }

    pub fn is_up(&self) -> bool {
        self.is_up
    }

    pub fn is_down(&self) -> bool {
        self.is_down
    }

    pub fn pending(&self) -> TradeSide {
        self.pending
    }

    fn start_run(&mut self, up: bool, close: Option<f64>) {
        self.is_up = up;
        self.is_down = !up;
        self.extreme = close.unwrap_or(self.extreme);
        self.count = 1;
        self.pending = if up { TradeSide::Sell } else { TradeSide::Buy };
    }
}

impl SignalFilter for CandlesFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Candles
    }

    fn set_limit(&mut self, limit: usize) {
        self.max_count = limit.max(1);
    }

    fn apply(&mut self, action: TrendAction, candles: &[Candle]) -> TradeSide {
        let close = candles.last().map(|c| c.close);
        match action {
            TrendAction::Up => self.start_run(true, close),
            TrendAction::Down => self.start_run(false, close),
            TrendAction::NoTrend if self.is_up || self.is_down => {
                self.count += 1;
                if let Some(close) = close {
                    self.extreme = if self.is_up {
                        self.extreme.max(close)
                    } else {
                        self.extreme.min(close)
                    };
                }
            }
            TrendAction::NoTrend => return TradeSide::Empty,
        }

        if self.count >= self.max_count {
            let side = self.pending;
            self.reset();
            return side;
        }
        TradeSide::Empty
    }

    fn reset(&mut self) {
        self.is_up = false;
        self.is_down = false;
        self.extreme = 0.0;
        self.count = 0;
        self.pending = TradeSide::Empty;
    }
}
