use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use common::{
    Balance, BinSize, Candle, CandleSource, Error, ExchangeOrder, OrderKind, OrderRequest,
    Position, Quote, Result, Side, TradingApi, SATOSHIS_PER_BTC,
};

/// Simulated exchange for paper trading and tests.
///
/// Limit orders rest until the quote crosses them, then fill in full and
/// update the simulated position. Trailing stops rest untriggered and are
/// cancelled once the position they protect goes flat.
/// Nothing is ever sent to a real exchange.
pub struct PaperExchange {
    symbol: String,
    state: Arc<RwLock<PaperState>>,
    position_tx: broadcast::Sender<Position>,
}

#[derive(Default)]
struct PaperState {
    balance: Option<Balance>,
    quote: Option<Quote>,
    position: Option<Position>,
    entry_price: f64,
    candles: HashMap<BinSize, Vec<Candle>>,
    resting: Vec<ExchangeOrder>,
    submitted: Vec<OrderRequest>,
    amendments: Vec<(String, f64)>,
    fail_next: Vec<String>,
    lose_next: Vec<String>,
    accepted: HashSet<String>,
    next_id: u64,
}

impl PaperExchange {
    pub fn new(symbol: impl Into<String>, balance_xbt: i64) -> Self {
        let symbol = symbol.into();
        info!(symbol = %symbol, balance_xbt, "PaperExchange initialized");
        let (position_tx, _) = broadcast::channel(256);
        let state = PaperState {
            balance: Some(Balance {
                wallet: balance_xbt,
                available: balance_xbt,
            }),
            position: Some(Position::flat(symbol.clone())),
            ..PaperState::default()
        };
        Self {
            symbol,
            state: Arc::new(RwLock::new(state)),
            position_tx,
        }
    }

    /// Subscribe to simulated position updates: fills, re-marks of an open
    /// position and `set_position` calls.
    pub fn subscribe_positions(&self) -> broadcast::Receiver<Position> {
        self.position_tx.subscribe()
    }

    pub async fn set_available(&self, available_xbt: i64) {
        let mut state = self.state.write().await;
        let wallet = state.balance.map(|b| b.wallet).unwrap_or(available_xbt);
        state.balance = Some(Balance {
            wallet: wallet.max(available_xbt),
            available: available_xbt,
        });
    }

    /// Update the quote, fill any resting limit order it crosses and publish the
    /// re-marked position while one is open.
    pub async fn set_quote(&self, quote: Quote) {
        let updated = {
            let mut state = self.state.write().await;
            state.quote = Some(quote);
            state.fill_crossed(quote)
        };
        if let Some(position) = updated {
            let _ = self.position_tx.send(position);
        }
    }

    pub async fn set_position(&self, position: Position) {
        {
            let mut state = self.state.write().await;
            let was_open = state.position.as_ref().is_some_and(|p| !p.is_flat());
            state.entry_price = position.last_price;
            state.position = Some(position.clone());
            if was_open && position.is_flat() {
                state.cancel_stops();
            }
        }
        let _ = self.position_tx.send(position);
    }

    pub async fn set_candles(&self, bin: BinSize, candles: Vec<Candle>) {
        self.state.write().await.candles.insert(bin, candles);
    }

    /// Make the next order submission fail with `UpstreamUnavailable`.
    pub async fn fail_next_order(&self, reason: impl Into<String>) {
        self.state.write().await.fail_next.push(reason.into());
    }

    /// Accept the next order but report it as failed, as when the response to a
    /// submission the exchange did take is lost in transit.
    pub async fn lose_next_response(&self, reason: impl Into<String>) {
        self.state.write().await.lose_next.push(reason.into());
    }

    /// Every order request accepted or rejected so far, oldest first.
    pub async fn submitted(&self) -> Vec<OrderRequest> {
        self.state.read().await.submitted.clone()
    }

    /// Every `(order_id, new_price)` amendment applied so far.
    pub async fn amendments(&self) -> Vec<(String, f64)> {
        self.state.read().await.amendments.clone()
    }

    pub async fn resting(&self) -> Vec<ExchangeOrder> {
        self.state.read().await.resting.clone()
    }
}

impl PaperState {
    fn fill_crossed(&mut self, quote: Quote) -> Option<Position> {
        let (crossed, resting): (Vec<_>, Vec<_>) =
            self.resting.drain(..).partition(|o| match (o.side, o.price) {
                (Side::Buy, Some(price)) => quote.ask <= price,
                (Side::Sell, Some(price)) => quote.bid >= price,
                _ => false,
            });
        self.resting = resting;

        let was_open = self.position.as_ref().is_some_and(|p| !p.is_flat());
        for order in &crossed {
            let price = order.price.unwrap_or(quote.mark);
            self.apply_fill(order.side, order.quantity, price);
            debug!(order_id = %order.order_id, side = %order.side, qty = order.quantity, price, "Paper fill");
        }
        let open = self.position.as_ref().is_some_and(|p| !p.is_flat());
        if was_open && !open {
            self.cancel_stops();
        }
        if crossed.is_empty() && !open {
            return None;
        }
        self.mark_to_market(quote.mark)
    }

    /// Drop resting stops; they have nothing left to protect.
    fn cancel_stops(&mut self) {
        let before = self.resting.len();
        self.resting.retain(|o| o.price.is_some());
        let cancelled = before - self.resting.len();
        if cancelled > 0 {
            debug!(cancelled, "Paper stops cancelled on flat position");
        }
    }

    fn apply_fill(&mut self, side: Side, quantity: i64, price: f64) {
        let Some(position) = self.position.as_mut() else {
            return;
        };
        let signed = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        let prev = position.current_qty;
        let next = prev + signed;

        self.entry_price = if next == 0 {
            0.0
        } else if prev == 0 || prev.signum() != next.signum() {
            price
        } else if prev.signum() == signed.signum() {
            (self.entry_price * prev.abs() as f64 + price * quantity as f64) / next.abs() as f64
        } else {
            self.entry_price
        };
        position.current_qty = next;
    }

    fn mark_to_market(&mut self, mark: f64) -> Option<Position> {
        let entry = self.entry_price;
        let position = self.position.as_mut()?;
        // Inverse contract: PnL in XBt = qty * (1/entry - 1/mark).
        position.unrealised_pnl = if position.current_qty == 0 || entry <= 0.0 || mark <= 0.0 {
            0
        } else {
            (position.current_qty as f64 * (1.0 / entry - 1.0 / mark) * SATOSHIS_PER_BTC).round()
                as i64
        };
        position.mark_price = mark;
        position.last_price = mark;
        position.timestamp = Utc::now();
        Some(position.clone())
    }
}

#[async_trait]
impl TradingApi for PaperExchange {
    async fn get_balance(&self) -> Result<Balance> {
        self.state
            .read()
            .await
            .balance
            .ok_or_else(|| Error::UpstreamUnavailable("paper balance not set".into()))
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        self.state
            .read()
            .await
            .quote
            .ok_or_else(|| Error::UpstreamUnavailable(format!("no quote available for {symbol}")))
    }

    async fn get_position(&self, symbol: &str) -> Result<Position> {
        Ok(self
            .state
            .read()
            .await
            .position
            .clone()
            .unwrap_or_else(|| Position::flat(symbol)))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<ExchangeOrder> {
        let mut state = self.state.write().await;
        state.submitted.push(order.clone());
        if state.accepted.contains(&order.cl_ord_id) {
            return Err(Error::DuplicateOrder(format!("clOrdID {} already accepted", order.cl_ord_id)));
        }
        if !state.fail_next.is_empty() {
            let reason = state.fail_next.remove(0);
            return Err(Error::UpstreamUnavailable(reason));
        }
        state.accepted.insert(order.cl_ord_id.clone());

        state.next_id += 1;
        let placed = ExchangeOrder {
            order_id: format!("paper-{}", state.next_id),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: match order.kind {
                OrderKind::Limit { price } => Some(price),
                OrderKind::TrailingStop { .. } => None,
            },
            status: "New".to_string(),
        };
        debug!(order_id = %placed.order_id, side = %order.side, qty = order.quantity, "Paper order resting");
        state.resting.push(placed.clone());
        if !state.lose_next.is_empty() {
            let reason = state.lose_next.remove(0);
            return Err(Error::UpstreamUnavailable(reason));
        }
        Ok(placed)
    }

    async fn amend_order(&self, order_id: &str, price: f64) -> Result<ExchangeOrder> {
        let mut state = self.state.write().await;
        let order = state
            .resting
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| Error::UpstreamUnavailable(format!("order {order_id} not found")))?;
        order.price = Some(price);
        let amended = order.clone();
        state.amendments.push((order_id.to_string(), price));
        Ok(amended)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>> {
        Ok(self
            .state
            .read()
            .await
            .resting
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CandleSource for PaperExchange {
    async fn recent_candles(&self, symbol: &str, bin: BinSize, count: usize) -> Result<Vec<Candle>> {
        if symbol != self.symbol {
            return Err(Error::UpstreamUnavailable(format!("unknown symbol {symbol}")));
        }
        let state = self.state.read().await;
        let candles = state.candles.get(&bin).cloned().unwrap_or_default();
        let start = candles.len().saturating_sub(count);
        Ok(candles[start..].to_vec())
    }
}
