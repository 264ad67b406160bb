use std::collections::VecDeque;

use common::{Candle, FilterKind, TradeSide, TrendAction};

use super::SignalFilter;

/// Window filter: confirms the end of a run by looking at the last N actions.
///
/// Once the window is full, a run that opened the window (first entry) and did
/// not recur anywhere after it is considered finished, and the opposite side
/// is emitted.
#[derive(Debug, Clone)]
pub struct TrendFilter {
    capacity: usize,
    history: VecDeque<TrendAction>,
}

impl TrendFilter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            history: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn history(&self) -> Vec<TrendAction> {
        self.history.iter().copied().collect()
    }

    fn evict(&mut self) {
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }
}

impl SignalFilter for TrendFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Trend
    }

    fn set_limit(&mut self, limit: usize) {
        self.capacity = limit.max(1);
        self.evict();
    }

    fn apply(&mut self, action: TrendAction, _candles: &[Candle]) -> TradeSide {
        self.history.push_back(action);
        self.evict();
        if self.history.len() < self.capacity {
            return TradeSide::Empty;
        }

        let first = self.history[0];
        let recurs = self.history.iter().skip(1).any(|a| *a == first);
        let side = match first {
            TrendAction::Up if !recurs => TradeSide::Sell,
            TrendAction::Down if !recurs => TradeSide::Buy,
            _ => TradeSide::Empty,
        };
        if side != TradeSide::Empty {
            self.history.clear();
        }
        side
    }

    fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TrendAction::*;

    fn feed(filter: &mut TrendFilter, actions: &[TrendAction]) -> Vec<TradeSide> {
        actions.iter().map(|a| filter.apply(*a, &[])).collect()
    }

    #[test]
    fn accumulates_until_full() {
        let mut f = TrendFilter::new(3);
        assert_eq!(feed(&mut f, &[Up, NoTrend]), vec![TradeSide::Empty; 2]);
        assert_eq!(f.history(), vec![Up, NoTrend]);
    }

    #[test]
    fn finished_up_run_emits_sell_and_clears() {
        let mut f = TrendFilter::new(3);
        let out = feed(&mut f, &[Up, NoTrend, NoTrend]);
        assert_eq!(out[2], TradeSide::Sell);
        assert!(f.history().is_empty());
    }

    #[test]
    fn finished_down_run_emits_buy() {
        let mut f = TrendFilter::new(3);
        let out = feed(&mut f, &[Down, Up, NoTrend]);
        assert_eq!(out[2], TradeSide::Buy);
    }

    #[test]
    fn recurring_direction_suppresses_emission() {
        let mut f = TrendFilter::new(3);
        let out = feed(&mut f, &[Up, NoTrend, Up]);
        assert_eq!(out[2], TradeSide::Empty);
        assert_eq!(f.history().len(), 3);
    }

    #[test]
    fn sliding_window_emits_after_eviction() {
        let mut f = TrendFilter::new(3);
        // [Up, Up, NoTrend] -> Up recurs; slide to [Up, NoTrend, NoTrend] -> Sell.
        let out = feed(&mut f, &[Up, Up, NoTrend, NoTrend]);
        assert_eq!(out, vec![TradeSide::Empty, TradeSide::Empty, TradeSide::Empty, TradeSide::Sell]);
    }

    #[test]
    fn no_trend_at_front_never_emits() {
        let mut f = TrendFilter::new(2);
        assert_eq!(feed(&mut f, &[NoTrend, NoTrend, Down]), vec![TradeSide::Empty; 3]);
    }
}
