pub mod config;
pub mod error;
pub mod exchange;
pub mod settings;
pub mod shutdown;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use exchange::{CandleSource, TradingApi};
pub use settings::{ConfigWatcher, FilterKind, MacdParams, SentinelConfig, TimeframeConfig};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use types::*;
