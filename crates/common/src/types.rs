use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Satoshis (XBt) per bitcoin. Balances and PnL arrive from the exchange in XBt.
pub const SATOSHIS_PER_BTC: f64 = 100_000_000.0;

/// Convert an XBt amount reported by the exchange into BTC.
pub fn xbt_to_btc(satoshis: i64) -> f64 {
    satoshis as f64 / SATOSHIS_PER_BTC
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

/// Candle aggregation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinSize {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl BinSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinSize::OneMinute => "1m",
            BinSize::FiveMinutes => "5m",
            BinSize::OneHour => "1h",
            BinSize::OneDay => "1d",
        }
    }

    pub fn period(&self) -> std::time::Duration {
        let secs = match self {
            BinSize::OneMinute => 60,
            BinSize::FiveMinutes => 300,
            BinSize::OneHour => 3_600,
            BinSize::OneDay => 86_400,
        };
        std::time::Duration::from_secs(secs)
    }
}

impl std::fmt::Display for BinSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A closed OHLCV bucket for one bin size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Top of book plus mark price for the traded instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub mark: f64,
}

impl Quote {
    /// Best price an order on `side` would rest at: ask for sells, bid for buys.
    pub fn best_for(&self, side: Side) -> f64 {
        match side {
            Side::Sell => self.ask,
            Side::Buy => self.bid,
        }
    }
}

/// Margin balance in XBt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub wallet: i64,
    pub available: i64,
}

impl Balance {
    pub fn available_btc(&self) -> f64 {
        xbt_to_btc(self.available)
    }
}

/// Exchange-side position for the single traded instrument.
///
/// Every update replaces the previous snapshot wholesale. Sources that receive
/// partial rows complete them before publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed contract count: positive = long, negative = short, zero = flat.
    pub current_qty: i64,
    /// Unrealised PnL in XBt.
    pub unrealised_pnl: i64,
    pub liquidation_price: f64,
    pub mark_price: f64,
    pub last_price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            current_qty: 0,
            unrealised_pnl: 0,
            liquidation_price: 0.0,
            mark_price: 0.0,
            last_price: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.current_qty == 0
    }

    /// Direction of the open position, `None` when flat.
    pub fn direction(&self) -> Option<Side> {
        match self.current_qty.signum() {
            1 => Some(Side::Buy),
            -1 => Some(Side::Sell),
            _ => None,
        }
    }

    /// True when adding an order on `side` would grow the open position.
    pub fn is_aligned_with(&self, side: Side) -> bool {
        self.direction() == Some(side)
    }

    /// Side that flattens the position: longs close with a sell, shorts with a buy.
    pub fn closing_side(&self) -> Option<Side> {
        self.direction().map(Side::opposite)
    }

    pub fn unrealised_pnl_btc(&self) -> f64 {
        xbt_to_btc(self.unrealised_pnl)
    }
}

/// Price instruction of an order request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Plain limit order resting at `price`.
    Limit { price: f64 },
    /// Stop order whose trigger trails the mark price by `peg_offset`.
    TrailingStop { peg_offset: f64 },
}

/// An order to be submitted to the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub cl_ord_id: String,
    pub symbol: String,
    pub side: Side,
    /// Contracts, always positive.
    pub quantity: i64,
    pub kind: OrderKind,
    /// Maker-only: adds the do-not-take-liquidity execution instruction.
    pub passive: bool,
}

impl OrderRequest {
    pub fn limit(symbol: impl Into<String>, side: Side, quantity: i64, price: f64) -> Self {
        Self {
            cl_ord_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            quantity,
            kind: OrderKind::Limit { price },
            passive: false,
        }
    }

    pub fn trailing_stop(
        symbol: impl Into<String>,
        side: Side,
        quantity: i64,
        peg_offset: f64,
    ) -> Self {
        Self {
            cl_ord_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            quantity,
            kind: OrderKind::TrailingStop { peg_offset },
            passive: false,
        }
    }

    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }
}

/// An order acknowledged by (or resting on) the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    /// `None` for pegged stop orders.
    pub price: Option<f64>,
    pub status: String,
}

/// Per-candle directional classification fed into the filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrendAction {
    #[default]
    NoTrend,
    Up,
    Down,
}

/// Filter output. `Empty` means "not confirmed yet, keep observing".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TradeSide {
    #[default]
    Empty,
    Buy,
    Sell,
}

impl TradeSide {
    pub fn side(self) -> Option<Side> {
        match self {
            TradeSide::Empty => None,
            TradeSide::Buy => Some(Side::Buy),
            TradeSide::Sell => Some(Side::Sell),
        }
    }
}

/// Classification of one unrealised-PnL observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PnlClass {
    Neutral,
    Profit,
    Loss,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PnlSample {
    /// Unrealised PnL in BTC.
    pub value: f64,
    pub class: PnlClass,
}

/// A confirmed trade action emitted by a timeframe's filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub bin: BinSize,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

/// Whether the bot is running against the real exchange or simulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}
