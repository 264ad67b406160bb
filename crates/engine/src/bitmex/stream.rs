use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use common::{Error, Position, Result, Shutdown};

use super::rest::PositionRow;
use super::{expires_at, Credentials};

const MAINNET_WS: &str = "wss://ws.bitmex.com/realtime";
const TESTNET_WS: &str = "wss://ws.testnet.bitmex.com/realtime";
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// BitMEX `position` table subscription for one symbol.
///
/// `partial` and `insert` rows replace the connection's last full row;
/// `update` rows carry only the changed fields and are laid over it, so every
/// `Position` sent on `position_tx` is complete. Reconnects with exponential
/// backoff until shutdown, starting each connection from an empty table.
pub struct PositionStream {
    symbol: String,
    url: &'static str,
    credentials: Credentials,
    position_tx: mpsc::Sender<Position>,
}

impl PositionStream {
    pub fn new(
        symbol: impl Into<String>,
        credentials: Credentials,
        testnet: bool,
        position_tx: mpsc::Sender<Position>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            url: if testnet { TESTNET_WS } else { MAINNET_WS },
            credentials,
            position_tx,
        }
    }

    /// Call this inside a `tokio::spawn`.
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut backoff = Duration::from_secs(1);

        loop {
            info!(symbol = %self.symbol, "Connecting to BitMEX position stream");
            let outcome = tokio::select! {
                res = self.connect_once() => res,
                _ = shutdown.wait() => {
                    info!(symbol = %self.symbol, "Position stream stopping");
                    return;
                }
            };

            let delay = match outcome {
                Ok(()) => {
                    info!(symbol = %self.symbol, "Position stream closed cleanly");
                    backoff = Duration::from_secs(1);
                    backoff
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, backoff = ?backoff, "Position stream error, reconnecting");
                    let delay = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => return,
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let url = Url::parse(self.url).map_err(|e| Error::WebSocket(e.to_string()))?;
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let expires = expires_at();
        let auth = serde_json::json!({
            "op": "authKeyExpires",
            "args": [
                self.credentials.api_key,
                expires,
                self.credentials.sign("GET", "/realtime", expires, ""),
            ],
        });
        let subscribe = serde_json::json!({
            "op": "subscribe",
            "args": [format!("position:{}", self.symbol)],
        });
        for op in [auth, subscribe] {
            write
                .send(Message::Text(op.to_string()))
                .await
                .map_err(|e| Error::WebSocket(e.to_string()))?;
        }

        let mut table = PositionTable::new(&self.symbol);
        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
            let Message::Text(text) = msg else {
                continue;
            };

            match table.apply(&text) {
                Ok(positions) => {
                    for position in positions {
                        if self.position_tx.send(position).await.is_err() {
                            return Err(Error::WebSocket("position receiver dropped".into()));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to parse position message"),
            }
        }

        Ok(())
    }
}

// ─── BitMEX table message parsing ────────────────────────────────────────────

#[derive(Deserialize)]
struct TableMessage {
    table: String,
    action: String,
    #[serde(default)]
    data: Vec<PositionRow>,
}

/// Last full position row seen on one connection.
struct PositionTable {
    symbol: String,
    last: Option<Position>,
}

impl PositionTable {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            last: None,
        }
    }

    /// Positions carried by one socket frame, in order. Non-table frames
    /// (welcome, auth and subscribe acks) yield nothing. An update arriving
    /// before any full row is usable only when it carries `currentQty`.
    fn apply(&mut self, text: &str) -> Result<Vec<Position>> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("table").and_then(|v| v.as_str()) != Some("position") {
            if let Some(err) = value.get("error").and_then(|v| v.as_str()) {
                return Err(Error::WebSocket(err.to_string()));
            }
            return Ok(Vec::new());
        }

        let message: TableMessage = serde_json::from_value(value)?;
        debug!(table = %message.table, action = %message.action, rows = message.data.len(), "Position frame");
        if message.action == "delete" {
            self.last = None;
            return Ok(Vec::new());
        }

        let mut positions = Vec::new();
        for row in message.data.into_iter().filter(|r| r.symbol == self.symbol) {
            let position = match (message.action.as_str(), &self.last) {
                ("update", Some(last)) => Some(row.overlay(last)),
                _ => row.into_position(),
            };
            if let Some(position) = position {
                self.last = Some(position.clone());
                positions.push(position);
            }
        }
        Ok(positions)
    }
}
