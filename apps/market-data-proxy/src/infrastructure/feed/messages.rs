//! Upstream Feed Messages
//!
//! Frames exchanged with a streaming provider. Every server frame is an
//! object tagged by its `"T"` field and frames arrive batched in arrays.
//!
//! # Server Frames
//!
//! | `T`            | Meaning                                   |
//! |----------------|-------------------------------------------|
//! | `success`      | `msg` is `connected` or `authenticated`   |
//! | `error`        | `code` + `msg`                            |
//! | `subscription` | current subscription set, per mode        |
//! | `tick`         | market data for one provider symbol       |
//!
//! # Client Frames
//!
//! - `{"action":"auth","key":"...","secret":"..."}`
//! - `{"action":"subscribe","mode":"ltp","symbols":["..."]}`
//! - `{"action":"unsubscribe","mode":"ltp","symbols":["..."]}`

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market_data::{DepthLevel, Mode};

// =============================================================================
// Server Frames
// =============================================================================

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Handshake progress.
    Success(SuccessFrame),
    /// Provider-reported error.
    Error(ErrorFrame),
    /// Subscription confirmation.
    Subscription(SubscriptionFrame),
    /// Market data.
    Tick(TickFrame),
}

/// Which handshake step succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessKind {
    /// Socket accepted, credentials expected.
    Connected,
    /// Credentials accepted.
    Authenticated,
}

/// `{"T":"success","msg":...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessFrame {
    /// Handshake step.
    pub msg: SuccessKind,
}

/// `{"T":"error","code":...,"msg":...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Provider error code.
    pub code: i32,
    /// Human-readable message.
    #[serde(default)]
    pub msg: String,
}

/// `{"T":"subscription","ltp":[...],"quote":[...],"depth":[...]}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFrame {
    /// Symbols streaming last price.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ltp: Vec<String>,
    /// Symbols streaming quotes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quote: Vec<String>,
    /// Symbols streaming depth.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depth: Vec<String>,
}

/// One price level as the provider sends it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelFrame {
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: u64,
    /// Order count.
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub orders: Option<u32>,
}

impl From<LevelFrame> for DepthLevel {
    fn from(level: LevelFrame) -> Self {
        Self {
            price: level.price,
            quantity: level.quantity,
            orders: level.orders,
        }
    }
}

/// `{"T":"tick","S":...}`
///
/// Fields are optional because providers send only what changed or what
/// the subscribed mode carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickFrame {
    /// Provider symbol.
    #[serde(rename = "S")]
    pub symbol: String,

    /// Mode the frame was produced for, when the provider says.
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,

    /// Last traded price.
    #[serde(rename = "lp", default, skip_serializing_if = "Option::is_none")]
    pub last_price: Option<Decimal>,

    /// Session open.
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub open: Option<Decimal>,

    /// Session high.
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,

    /// Session low.
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,

    /// Previous close.
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub close: Option<Decimal>,

    /// Volume.
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,

    /// Bid ladder.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bids: Vec<LevelFrame>,

    /// Ask ladder.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asks: Vec<LevelFrame>,

    /// Provider timestamp.
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TickFrame {
    /// A frame carrying only a last price.
    #[must_use]
    pub fn last_price(symbol: impl Into<String>, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            mode: None,
            last_price: Some(price),
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: None,
        }
    }

    /// Whether the frame has enough data for `mode`.
    #[must_use]
    pub fn satisfies(&self, mode: Mode) -> bool {
        if self.last_price.is_none() {
            return false;
        }
        match mode {
            Mode::Ltp => true,
            Mode::Quote => {
                self.open.is_some()
                    && self.high.is_some()
                    && self.low.is_some()
                    && self.close.is_some()
            }
            Mode::Depth => !self.bids.is_empty() || !self.asks.is_empty(),
        }
    }
}

// =============================================================================
// Client Frames
// =============================================================================

/// `{"action":"auth","key":...,"secret":...}`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Always `auth`.
    pub action: String,
    /// API key.
    pub key: String,
    /// API secret.
    pub secret: String,
}

impl AuthRequest {
    /// Build an auth frame.
    #[must_use]
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            action: "auth".to_string(),
            key: key.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Subscribe or unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    /// Start streaming.
    Subscribe,
    /// Stop streaming.
    Unsubscribe,
}

/// `{"action":...,"mode":...,"symbols":[...]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Subscribe or unsubscribe.
    pub action: SubscriptionAction,
    /// Lowercase mode name.
    pub mode: String,
    /// Provider symbols.
    pub symbols: Vec<String>,
}

impl SubscriptionRequest {
    /// Subscribe `symbols` at `mode`.
    #[must_use]
    pub fn subscribe(mode: Mode, symbols: Vec<String>) -> Self {
        Self {
            action: SubscriptionAction::Subscribe,
            mode: mode.wire_name().to_string(),
            symbols,
        }
    }

    /// Unsubscribe `symbols` at `mode`.
    #[must_use]
    pub fn unsubscribe(mode: Mode, symbols: Vec<String>) -> Self {
        Self {
            action: SubscriptionAction::Unsubscribe,
            mode: mode.wire_name().to_string(),
            symbols,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn tick_frame_parses_full_payload() {
        let json = r#"{"S":"INFY-EQ","m":"depth","lp":1505.5,"o":"1490","h":1510,"l":1488.25,"c":1495,
            "v":120000,"bids":[{"p":1505.4,"q":10,"o":2}],"asks":[{"p":1505.6,"q":7}],
            "t":"2024-01-15T10:00:00Z"}"#;
        let frame: TickFrame = serde_json::from_str(json).unwrap();

        assert_eq!(frame.symbol, "INFY-EQ");
        assert_eq!(frame.mode, Some(Mode::Depth));
        assert_eq!(frame.last_price, Some(Decimal::new(15055, 1)));
        assert_eq!(frame.open, Some(Decimal::new(1490, 0)));
        assert_eq!(frame.bids.len(), 1);
        assert_eq!(frame.bids[0].orders, Some(2));
        assert_eq!(frame.asks[0].orders, None);
        assert!(frame.timestamp.is_some());
    }

    #[test_case(Mode::Ltp, true ; "ltp needs only last price")]
    #[test_case(Mode::Quote, false ; "quote needs ohlc")]
    #[test_case(Mode::Depth, false ; "depth needs a ladder")]
    fn last_price_frame_satisfies(mode: Mode, expected: bool) {
        let frame = TickFrame::last_price("X", Decimal::ONE);
        assert_eq!(frame.satisfies(mode), expected);
    }

    #[test]
    fn frame_without_price_satisfies_nothing() {
        let mut frame = TickFrame::last_price("X", Decimal::ONE);
        frame.last_price = None;
        assert!(Mode::all().iter().all(|m| !frame.satisfies(*m)));
    }

    #[test]
    fn subscription_request_shape() {
        let request = SubscriptionRequest::subscribe(Mode::Quote, vec!["A".into(), "B".into()]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action":"subscribe","mode":"quote","symbols":["A","B"]})
        );
    }

    #[test]
    fn auth_request_debug_redacts_secret() {
        let request = AuthRequest::new("key", "hunter2");
        let debug = format!("{request:?}");
        assert!(!debug.contains("hunter2"));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"action":"auth","key":"key","secret":"hunter2"})
        );
    }
}
