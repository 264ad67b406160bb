pub mod bitmex;
pub mod executor;

pub use bitmex::{BitmexClient, Credentials, PositionStream};
pub use executor::SignalExecutor;
