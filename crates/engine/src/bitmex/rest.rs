use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::form_urlencoded;

use common::{
    Balance, BinSize, Candle, CandleSource, Error, ExchangeOrder, OrderKind, OrderRequest,
    Position, Quote, Result, Side, TradingApi,
};

use super::{expires_at, Credentials};

const MAINNET_HOST: &str = "https://www.bitmex.com";
const TESTNET_HOST: &str = "https://testnet.bitmex.com";
const API_PREFIX: &str = "/api/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for BitMEX. Serves account queries, order placement and candles.
///
/// Without credentials only the public endpoints (quote, candles) succeed.
pub struct BitmexClient {
    host: &'static str,
    credentials: Option<Credentials>,
    http: Client,
}

impl BitmexClient {
    pub fn new(credentials: Option<Credentials>, testnet: bool) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;
        Ok(Self {
            host: if testnet { TESTNET_HOST } else { MAINNET_HOST },
            credentials,
            http,
        })
    }

    /// Client for public market data only.
    pub fn public(testnet: bool) -> Result<Self> {
        Self::new(None, testnet)
    }

    /// Send a request to `endpoint` (relative to `/api/v1`). Signs it when
    /// credentials are configured. Returns the raw body of a 2xx response.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<String>,
    ) -> Result<String> {
        let mut path = format!("{API_PREFIX}{endpoint}");
        if !query.is_empty() {
            let encoded = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())))
                .finish();
            path.push('?');
            path.push_str(&encoded);
        }
        let body = body.unwrap_or_default();

        let mut req = self
            .http
            .request(method.clone(), format!("{}{path}", self.host))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        if let Some(creds) = &self.credentials {
            let expires = expires_at();
            let signature = creds.sign(method.as_str(), &path, expires, &body);
            req = req
                .header("api-key", &creds.api_key)
                .header("api-expires", expires.to_string())
                .header("api-signature", signature);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        debug!(method = %method, path = %path, "BitMEX request");
        let resp = req
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        Ok(text)
    }
}

/// BitMEX answers a resubmitted `clOrdID` with 400 "Duplicate clOrdID".
fn status_error(status: reqwest::StatusCode, text: &str) -> Error {
    if status == reqwest::StatusCode::BAD_REQUEST && text.contains("Duplicate clOrdID") {
        return Error::DuplicateOrder(text.to_string());
    }
    Error::UpstreamUnavailable(format!("HTTP {status}: {text}"))
}

#[async_trait]
impl TradingApi for BitmexClient {
    async fn get_balance(&self) -> Result<Balance> {
        let body = self
            .request(Method::GET, "/user/margin", &[("currency", "XBt".into())], None)
            .await?;
        let margin: MarginResponse = serde_json::from_str(&body)?;
        Ok(margin.into())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        let body = self
            .request(Method::GET, "/instrument", &[("symbol", symbol.into())], None)
            .await?;
        parse_quote(symbol, &body)
    }

    async fn get_position(&self, symbol: &str) -> Result<Position> {
        let filter = serde_json::json!({ "symbol": symbol }).to_string();
        let body = self
            .request(Method::GET, "/position", &[("filter", filter)], None)
            .await?;
        let rows: Vec<PositionRow> = serde_json::from_str(&body)?;
        Ok(rows
            .into_iter()
            .find(|r| r.symbol == symbol)
            .and_then(PositionRow::into_position)
            .unwrap_or_else(|| Position::flat(symbol)))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder> {
        let payload = serde_json::to_string(&NewOrder::from(request))?;
        debug!(side = %request.side, qty = request.quantity, "Submitting order to BitMEX");
        let body = self
            .request(Method::POST, "/order", &[], Some(payload))
            .await?;
        let order: OrderRow = serde_json::from_str(&body)?;
        order.try_into()
    }

    async fn amend_order(&self, order_id: &str, price: f64) -> Result<ExchangeOrder> {
        let payload = serde_json::json!({ "orderID": order_id, "price": price }).to_string();
        let body = self
            .request(Method::PUT, "/order", &[], Some(payload))
            .await?;
        let order: OrderRow = serde_json::from_str(&body)?;
        order.try_into()
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>> {
        let filter = serde_json::json!({ "open": true }).to_string();
        let body = self
            .request(
                Method::GET,
                "/order",
                &[("symbol", symbol.into()), ("filter", filter)],
                None,
            )
            .await?;
        let rows: Vec<OrderRow> = serde_json::from_str(&body)?;
        rows.into_iter().map(ExchangeOrder::try_from).collect()
    }
}

#[async_trait]
impl CandleSource for BitmexClient {
    async fn recent_candles(&self, symbol: &str, bin: BinSize, count: usize) -> Result<Vec<Candle>> {
        let body = self
            .request(
                Method::GET,
                "/trade/bucketed",
                &[
                    ("binSize", bin.as_str().into()),
                    ("symbol", symbol.into()),
                    ("partial", "false".into()),
                    ("reverse", "true".into()),
                    ("count", count.to_string()),
                ],
                None,
            )
            .await?;
        parse_candles(&body)
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarginResponse {
    wallet_balance: i64,
    available_margin: i64,
}

impl From<MarginResponse> for Balance {
    fn from(m: MarginResponse) -> Self {
        Balance {
            wallet: m.wallet_balance,
            available: m.available_margin,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentRow {
    symbol: String,
    bid_price: Option<f64>,
    ask_price: Option<f64>,
    mark_price: Option<f64>,
}

fn parse_quote(symbol: &str, body: &str) -> Result<Quote> {
    let rows: Vec<InstrumentRow> = serde_json::from_str(body)?;
    let row = rows
        .into_iter()
        .find(|r| r.symbol == symbol)
        .ok_or_else(|| Error::UpstreamUnavailable(format!("no instrument row for {symbol}")))?;
    match (row.bid_price, row.ask_price) {
        (Some(bid), Some(ask)) => Ok(Quote {
            bid,
            ask,
            mark: row.mark_price.unwrap_or((bid + ask) / 2.0),
        }),
        _ => Err(Error::UpstreamUnavailable(format!("{symbol} has no quote"))),
    }
}

/// Position row as sent by both REST and the `position` WebSocket table.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PositionRow {
    pub symbol: String,
    pub current_qty: Option<i64>,
    pub unrealised_pnl: Option<i64>,
    pub liquidation_price: Option<f64>,
    pub mark_price: Option<f64>,
    pub last_price: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl PositionRow {
    /// The row as a complete snapshot. `None` when the row carries no
    /// `currentQty`.
    pub fn into_position(self) -> Option<Position> {
        Some(Position {
            current_qty: self.current_qty?,
            unrealised_pnl: self.unrealised_pnl.unwrap_or(0),
            liquidation_price: self.liquidation_price.unwrap_or(0.0),
            mark_price: self.mark_price.unwrap_or(0.0),
            last_price: self.last_price.unwrap_or(0.0),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            symbol: self.symbol,
        })
    }

    /// Apply the fields this row carries on top of `base`; absent fields keep
    /// their previous value.
    pub fn overlay(self, base: &Position) -> Position {
        Position {
            symbol: self.symbol,
            current_qty: self.current_qty.unwrap_or(base.current_qty),
            unrealised_pnl: self.unrealised_pnl.unwrap_or(base.unrealised_pnl),
            liquidation_price: self.liquidation_price.unwrap_or(base.liquidation_price),
            mark_price: self.mark_price.unwrap_or(base.mark_price),
            last_price: self.last_price.unwrap_or(base.last_price),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewOrder<'a> {
    symbol: &'a str,
    side: String,
    order_qty: i64,
    #[serde(rename = "clOrdID")]
    cl_ord_id: &'a str,
    ord_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peg_price_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peg_offset_value: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    exec_inst: String,
}

impl<'a> From<&'a OrderRequest> for NewOrder<'a> {
    fn from(r: &'a OrderRequest) -> Self {
        let mut exec_inst = Vec::new();
        if r.passive {
            exec_inst.push("ParticipateDoNotInitiate");
        }
        let (ord_type, price, peg_price_type, peg_offset_value) = match r.kind {
            OrderKind::Limit { price } => ("Limit", Some(price), None, None),
            OrderKind::TrailingStop { peg_offset } => {
                exec_inst.push("MarkPrice");
                ("Stop", None, Some("TrailingStopPeg"), Some(peg_offset))
            }
        };
        NewOrder {
            symbol: &r.symbol,
            side: r.side.to_string(),
            order_qty: r.quantity,
            cl_ord_id: &r.cl_ord_id,
            ord_type,
            price,
            peg_price_type,
            peg_offset_value,
            exec_inst: exec_inst.join(","),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRow {
    #[serde(rename = "orderID")]
    order_id: String,
    symbol: String,
    side: String,
    order_qty: Option<i64>,
    price: Option<f64>,
    ord_status: Option<String>,
}

impl TryFrom<OrderRow> for ExchangeOrder {
    type Error = Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        let side = match row.side.as_str() {
            "Buy" => Side::Buy,
            "Sell" => Side::Sell,
            other => {
                return Err(Error::UpstreamUnavailable(format!(
                    "order {} has unknown side '{other}'",
                    row.order_id
                )))
            }
        };
        Ok(ExchangeOrder {
            order_id: row.order_id,
            symbol: row.symbol,
            side,
            quantity: row.order_qty.unwrap_or(0),
            price: row.price,
            status: row.ord_status.unwrap_or_default(),
        })
    }
}

#[derive(Deserialize)]
struct BucketRow {
    timestamp: DateTime<Utc>,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
}

/// Buckets arrive newest first; candles are returned oldest first.
/// Empty buckets (no trades) carry null prices and are dropped.
fn parse_candles(body: &str) -> Result<Vec<Candle>> {
    let rows: Vec<BucketRow> = serde_json::from_str(body)?;
    let mut candles: Vec<Candle> = rows
        .into_iter()
        .filter_map(|r| {
            Some(Candle {
                timestamp: r.timestamp,
                open: r.open?,
                high: r.high?,
                low: r.low?,
                close: r.close?,
                volume: r.volume.unwrap_or(0.0),
            })
        })
        .collect();
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_cl_ord_id_is_not_retryable() {
        let body = r#"{"error":{"message":"Duplicate clOrdID","name":"HTTPError"}}"#;
        let err = status_error(reqwest::StatusCode::BAD_REQUEST, body);
        assert!(matches!(err, Error::DuplicateOrder(_)));
        assert!(!err.is_retryable());

        let err = status_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "overloaded");
        assert!(err.is_retryable());
    }

    #[test]
    fn quote_parses_instrument_row() {
        let body = r#"[{"symbol":"XBTUSD","bidPrice":9999.5,"askPrice":10000,"markPrice":10000.12}]"#;
        let quote = parse_quote("XBTUSD", body).unwrap();
        assert_eq!(quote.bid, 9999.5);
        assert_eq!(quote.ask, 10000.0);
        assert_eq!(quote.mark, 10000.12);
    }

    #[test]
    fn quote_without_book_is_unavailable() {
        let body = r#"[{"symbol":"XBTUSD","bidPrice":null,"askPrice":null,"markPrice":10000}]"#;
        assert!(matches!(
            parse_quote("XBTUSD", body),
            Err(Error::UpstreamUnavailable(_))
        ));
    }

    #[test]
    fn limit_order_payload_is_passive() {
        let request = OrderRequest::limit("XBTUSD", Side::Buy, 500, 9_999.5).passive(true);
        let json: serde_json::Value =
            serde_json::to_value(NewOrder::from(&request)).unwrap();
        assert_eq!(json["ordType"], "Limit");
        assert_eq!(json["side"], "Buy");
        assert_eq!(json["orderQty"], 500);
        assert_eq!(json["price"], 9_999.5);
        assert_eq!(json["execInst"], "ParticipateDoNotInitiate");
        assert_eq!(json["clOrdID"], request.cl_ord_id.as_str());
        assert!(json.get("pegPriceType").is_none());
    }

    #[test]
    fn trailing_stop_payload_pegs_to_mark() {
        let request = OrderRequest::trailing_stop("XBTUSD", Side::Sell, 500, -10.0);
        let json: serde_json::Value =
            serde_json::to_value(NewOrder::from(&request)).unwrap();
        assert_eq!(json["ordType"], "Stop");
        assert_eq!(json["pegPriceType"], "TrailingStopPeg");
        assert_eq!(json["pegOffsetValue"], -10.0);
        assert_eq!(json["execInst"], "MarkPrice");
        assert!(json.get("price").is_none());
    }

    #[test]
    fn order_row_maps_to_exchange_order() {
        let body = r#"{"orderID":"abc","symbol":"XBTUSD","side":"Sell","orderQty":100,"price":null,"ordStatus":"New"}"#;
        let row: OrderRow = serde_json::from_str(body).unwrap();
        let order = ExchangeOrder::try_from(row).unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.price, None);
        assert_eq!(order.status, "New");
    }

    #[test]
    fn candles_come_back_oldest_first_without_empty_buckets() {
        let body = r#"[
            {"timestamp":"2024-01-01T00:10:00.000Z","open":3,"high":3,"low":3,"close":3,"volume":5},
            {"timestamp":"2024-01-01T00:05:00.000Z","open":null,"high":null,"low":null,"close":null,"volume":0},
            {"timestamp":"2024-01-01T00:00:00.000Z","open":1,"high":2,"low":1,"close":2,"volume":7}
        ]"#;
        let candles = parse_candles(body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 2.0);
        assert_eq!(candles[1].close, 3.0);
    }

    #[test]
    fn position_row_without_qty_is_rejected() {
        let row: PositionRow =
            serde_json::from_str(r#"{"symbol":"XBTUSD","markPrice":10000}"#).unwrap();
        assert!(row.into_position().is_none());
    }

    #[test]
    fn position_row_replaces_whole_snapshot() {
        let row: PositionRow = serde_json::from_str(
            r#"{"symbol":"XBTUSD","currentQty":200,"unrealisedPnl":-1500}"#,
        )
        .unwrap();
        let position = row.into_position().unwrap();
        assert_eq!(position.current_qty, 200);
        assert_eq!(position.unrealised_pnl, -1500);
        assert_eq!(position.liquidation_price, 0.0);
        assert_eq!(position.mark_price, 0.0);
    }
}
