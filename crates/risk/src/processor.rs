use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use common::{
    Error, ExchangeOrder, OrderRequest, Position, Result, Side, TimeframeConfig, TradingApi,
    SATOSHIS_PER_BTC,
};

/// Available balance (BTC) at or below which no order is placed.
pub const BALANCE_EXHAUSTED_BTC: f64 = 0.0001;

/// Smallest order the processor will size, in contracts.
pub const MIN_ORDER_QTY: i64 = 100;

/// Distance (USD) between liquidation and reference price under which
/// adding to an aligned position is refused.
pub const LIQUIDATION_SAFETY_BAND: f64 = 300.0;

/// Trailing-stop peg offset (USD) from mark price. Negative for sells.
pub const TRAILING_PEG_OFFSET: f64 = 10.0;

/// Last known position, written only by the scheduler.
pub type PositionCache = Arc<RwLock<Option<Position>>>;

/// What the caller wants placed. `amount == 0` requests auto-sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderIntent {
    pub side: Side,
    pub amount: i64,
    pub passive: bool,
    pub is_stop: bool,
}

impl OrderIntent {
    /// Auto-sized passive limit entry.
    pub fn entry(side: Side) -> Self {
        Self { side, amount: 0, passive: true, is_stop: false }
    }

    /// Passive limit order flattening `quantity` contracts.
    pub fn close(side: Side, quantity: i64) -> Self {
        Self { side, amount: quantity, passive: true, is_stop: false }
    }

    pub fn trailing_stop(side: Side, quantity: i64) -> Self {
        Self { side, amount: quantity, passive: false, is_stop: true }
    }
}

/// Validates risk for one order and submits it.
///
/// Holds no state beyond the shared position snapshot, which it only reads.
/// Submission errors are returned unmodified; retry policy belongs to the caller.
pub struct OrderProcessor {
    symbol: String,
    client: Arc<dyn TradingApi>,
    position: PositionCache,
}

impl OrderProcessor {
    pub fn new(symbol: impl Into<String>, client: Arc<dyn TradingApi>, position: PositionCache) -> Self {
        Self {
            symbol: symbol.into(),
            client,
            position,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Point-in-time copy of the cached position; flat when nothing has arrived yet.
    pub async fn position_snapshot(&self) -> Position {
        self.position
            .read()
            .await
            .clone()
            .unwrap_or_else(|| Position::flat(&self.symbol))
    }

    /// Run the risk gates and submit. Equivalent to `prepare_order` then `submit`.
    pub async fn place_order(
        &self,
        intent: &OrderIntent,
        settings: &TimeframeConfig,
    ) -> Result<ExchangeOrder> {
        let request = self.prepare_order(intent, settings).await?;
        self.submit(&request).await
    }

    /// Run the risk gates and build the exchange request without sending it.
    ///
    /// The returned request carries its `clOrdID`; resubmitting the same request
    /// lets the exchange refuse a duplicate of an attempt it already accepted.
    pub async fn prepare_order(
        &self,
        intent: &OrderIntent,
        settings: &TimeframeConfig,
    ) -> Result<OrderRequest> {
        let side = intent.side;

        let balance = self.client.get_balance().await?;
        let available_btc = balance.available_btc();
        if available_btc <= BALANCE_EXHAUSTED_BTC {
            warn!(side = %side, available_btc, "Order refused: balance exhausted");
            return Err(Error::InsufficientBalance { available_btc });
        }

        let position = self.position_snapshot().await;
        check_exposure(&position, side, settings.limit_contracts_count).map_err(|e| {
            warn!(side = %side, qty = position.current_qty, limit = settings.limit_contracts_count, "Order refused: exposure limit");
            e
        })?;

        let quote = self.client.get_quote(&self.symbol).await?;
        let reference_price = quote.best_for(side);

        let quantity = if intent.amount == 0 {
            check_liquidation(&position, side, reference_price).map_err(|e| {
                warn!(
                    side = %side,
                    price = reference_price,
                    liquidation = position.liquidation_price,
                    "Order refused: too close to liquidation"
                );
                e
            })?;
            auto_size(&position, available_btc, side, settings)
        } else {
            intent.amount
        };

        let request = if intent.is_stop {
            let peg_offset = match side {
                Side::Sell => -TRAILING_PEG_OFFSET,
                Side::Buy => TRAILING_PEG_OFFSET,
            };
            OrderRequest::trailing_stop(&self.symbol, side, quantity, peg_offset)
        } else {
            OrderRequest::limit(&self.symbol, side, quantity, reference_price)
        }
        .passive(intent.passive);

        info!(
            side = %side,
            qty = quantity,
            price = reference_price,
            stop = intent.is_stop,
            passive = intent.passive,
            cl_ord_id = %request.cl_ord_id,
            "Order prepared"
        );
        Ok(request)
    }

    pub async fn submit(&self, request: &OrderRequest) -> Result<ExchangeOrder> {
        debug!(cl_ord_id = %request.cl_ord_id, side = %request.side, qty = request.quantity, "Submitting order");
        self.client.place_order(request).await
    }
}

/// Refuse a side once the position already holds `limit` contracts in that direction.
pub fn check_exposure(position: &Position, side: Side, limit: i64) -> Result<()> {
    let exceeded = match side {
        Side::Sell => position.current_qty <= -limit,
        Side::Buy => position.current_qty >= limit,
    };
    if exceeded {
        return Err(Error::ExposureLimitExceeded {
            side,
            current_qty: position.current_qty,
            limit,
        });
    }
    Ok(())
}

/// Refuse to grow an aligned position whose liquidation price is within the safety band.
pub fn check_liquidation(position: &Position, side: Side, reference_price: f64) -> Result<()> {
    if position.is_aligned_with(side)
        && (position.liquidation_price - reference_price).abs() < LIQUIDATION_SAFETY_BAND
    {
        return Err(Error::LiquidationWarning {
            side,
            reference_price,
            liquidation_price: position.liquidation_price,
        });
    }
    Ok(())
}

/// Quantity for an auto-sized order.
///
/// In profit: the whole open quantity when aligned with `side`, otherwise the
/// minimum. Flat or losing: a side-specific share of the available balance.
pub fn auto_size(position: &Position, available_btc: f64, side: Side, settings: &TimeframeConfig) -> i64 {
    if position.unrealised_pnl_btc() > 0.0 {
        if position.is_aligned_with(side) {
            position.current_qty.abs()
        } else {
            MIN_ORDER_QTY
        }
    } else {
        let coef = match side {
            Side::Buy => settings.buy_order_coef,
            Side::Sell => settings.sell_order_coef,
        };
        size_from_balance(available_btc, coef)
    }
}

pub fn size_from_balance(available_btc: f64, coef: f64) -> i64 {
    (available_btc * coef * SATOSHIS_PER_BTC)
        .max(MIN_ORDER_QTY as f64)
        .round() as i64
}
