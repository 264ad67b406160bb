use crate::TradingMode;

/// Process configuration loaded from environment variables at startup.
/// Malformed values cause an immediate panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Exchange credentials (required in live mode only)
    pub bitmex_api_key: String,
    pub bitmex_secret: String,
    pub bitmex_testnet: bool,

    // Instrument
    pub symbol: String,

    // Trading
    pub trading_mode: TradingMode,
    /// Starting paper balance in XBt.
    pub paper_balance_xbt: i64,

    // Strategy/risk config file and its reload interval
    pub settings_path: String,
    pub settings_reload_secs: u64,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let trading_mode = match optional_env("TRADING_MODE")
            .unwrap_or_else(|| "paper".to_string())
            .to_lowercase()
            .as_str()
        {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            other => panic!("ERROR: TRADING_MODE must be 'paper' or 'live', got: '{other}'"),
        };

        let (bitmex_api_key, bitmex_secret) = match trading_mode {
            TradingMode::Live => (required_env("BITMEX_API_KEY"), required_env("BITMEX_SECRET")),
            TradingMode::Paper => (
                optional_env("BITMEX_API_KEY").unwrap_or_default(),
                optional_env("BITMEX_SECRET").unwrap_or_default(),
            ),
        };

        Config {
            bitmex_api_key,
            bitmex_secret,
            bitmex_testnet: optional_env("BITMEX_TESTNET")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            symbol: optional_env("SYMBOL").unwrap_or_else(|| "XBTUSD".to_string()),
            trading_mode,
            paper_balance_xbt: optional_env("PAPER_BALANCE_XBT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            settings_path: optional_env("SENTINEL_CONFIG_PATH")
                .unwrap_or_else(|| "config/sentinel.toml".to_string()),
            settings_reload_secs: optional_env("CONFIG_RELOAD_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
