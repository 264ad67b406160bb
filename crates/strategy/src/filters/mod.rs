pub mod candles;
pub mod trend;

pub use candles::CandlesFilter;
pub use trend::TrendFilter;

use common::{Candle, FilterKind, TimeframeConfig, TradeSide, TrendAction};

/// A per-timeframe confirmation filter.
///
/// Instances are owned by exactly one timeframe loop and never shared.
pub trait SignalFilter: Send {
    fn kind(&self) -> FilterKind;

    /// Apply a reloaded window/run length without discarding state.
    fn set_limit(&mut self, limit: usize);

    /// Feed the latest classification. `candles` is the batch it was derived from,
    /// oldest first. Returns `TradeSide::Empty` until a side is confirmed.
    fn apply(&mut self, action: TrendAction, candles: &[Candle]) -> TradeSide;

    fn reset(&mut self);
}

/// Build the filter a timeframe is configured for.
pub fn build_filter(settings: &TimeframeConfig) -> Box<dyn SignalFilter> {
    match settings.filter {
        FilterKind::Trend => Box::new(TrendFilter::new(settings.max_filter_trend_count)),
        FilterKind::Candles => Box::new(CandlesFilter::new(settings.max_candles_filter_count)),
    }
}

/// Window or run length for the configured filter kind.
pub fn limit_for(settings: &TimeframeConfig) -> usize {
    match settings.filter {
        FilterKind::Trend => settings.max_filter_trend_count,
        FilterKind::Candles => settings.max_candles_filter_count,
    }
}
