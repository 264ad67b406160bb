pub mod classify;
pub mod filters;
pub mod timeframe;

pub use classify::MacdClassifier;
pub use filters::{build_filter, limit_for, CandlesFilter, SignalFilter, TrendFilter};
pub use timeframe::TimeframeLoop;
