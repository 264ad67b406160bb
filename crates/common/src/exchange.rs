use async_trait::async_trait;

use crate::{Balance, BinSize, Candle, ExchangeOrder, OrderRequest, Position, Quote, Result};

/// Trading capability of the exchange connection.
///
/// `BitmexClient` implements this for live trading.
/// `PaperExchange` implements this for simulation and tests.
///
/// Transport failures surface as `Error::UpstreamUnavailable`; implementations
/// never retry on their own.
#[async_trait]
pub trait TradingApi: Send + Sync {
    /// Margin balance in XBt.
    async fn get_balance(&self) -> Result<Balance>;

    /// Best bid/ask and mark price for `symbol`.
    async fn get_quote(&self, symbol: &str) -> Result<Quote>;

    /// Current position for `symbol`. A flat position is returned, not an error.
    async fn get_position(&self, symbol: &str) -> Result<Position>;

    async fn place_order(&self, order: &OrderRequest) -> Result<ExchangeOrder>;

    /// Move a resting order to `price` without cancelling it.
    async fn amend_order(&self, order_id: &str, price: f64) -> Result<ExchangeOrder>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>>;
}

/// Source of closed candles for the per-timeframe signal loops.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// The last `count` closed candles, oldest first.
    async fn recent_candles(&self, symbol: &str, bin: BinSize, count: usize)
        -> Result<Vec<Candle>>;
}
