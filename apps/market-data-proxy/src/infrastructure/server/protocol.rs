//! Client Wire Protocol
//!
//! One JSON object per WebSocket text frame. Requests are tagged by
//! `action`, server frames by `type`.
//!
//! ```text
//! -> {"action":"authenticate","token":"..."}
//! <- {"type":"auth","status":"success","client_id":"...","user_id":"..."}
//! -> {"action":"subscribe","symbols":[{"symbol":"INFY","venue":"NSE"}],"mode":"QUOTE"}
//! <- {"type":"subscribe","status":"success","mode":"QUOTE","accepted":[...],"rejected":[]}
//! <- {"type":"market_data","symbol":"INFY","venue":"NSE","mode":"QUOTE","data":{...}}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::application::ports::{Outbound, RejectedItem, Reply, SubscriptionItem};
use crate::domain::market_data::{DepthLevel, Mode, Tick};

// =============================================================================
// Requests
// =============================================================================

/// A `(symbol, venue)` pair on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    /// Client-facing symbol.
    pub symbol: String,
    /// Venue code.
    pub venue: String,
}

impl From<SymbolEntry> for SubscriptionItem {
    fn from(entry: SymbolEntry) -> Self {
        Self::new(entry.symbol, entry.venue)
    }
}

impl From<&SubscriptionItem> for SymbolEntry {
    fn from(item: &SubscriptionItem) -> Self {
        Self {
            symbol: item.symbol.clone(),
            venue: item.venue.clone(),
        }
    }
}

/// Client request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Open a session.
    Authenticate {
        /// Identity token.
        #[serde(alias = "api_key")]
        token: String,
    },
    /// Subscribe to symbols at one mode.
    Subscribe {
        /// Pairs to subscribe.
        symbols: Vec<SymbolEntry>,
        /// Requested granularity.
        mode: Mode,
    },
    /// Unsubscribe from symbols at one mode, or all modes when absent.
    Unsubscribe {
        /// Pairs to unsubscribe.
        symbols: Vec<SymbolEntry>,
        /// Mode to drop.
        #[serde(default)]
        mode: Option<Mode>,
    },
    /// Destroy the session and close.
    Logout,
    /// Application-level keepalive.
    Ping,
}

impl ClientRequest {
    /// Parse one text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Decode` for malformed JSON, unknown actions
    /// or invalid fields.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

// =============================================================================
// Server Frames
// =============================================================================

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Fully applied.
    Success,
    /// Some entries refused.
    Partial,
    /// Nothing applied.
    Error,
}

/// Error codes carried by `error` and failed `auth` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Token rejected.
    AuthError,
    /// Request sent before authenticating.
    NotAuthenticated,
    /// Frame could not be decoded.
    InvalidMessage,
}

/// A refused subscribe entry on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedEntry {
    /// Client-facing symbol.
    pub symbol: String,
    /// Venue code.
    pub venue: String,
    /// Rejection code.
    pub reason: &'static str,
}

impl From<&RejectedItem> for RejectedEntry {
    fn from(rejected: &RejectedItem) -> Self {
        Self {
            symbol: rejected.item.symbol.clone(),
            venue: rejected.item.venue.clone(),
            reason: rejected.reason.code(),
        }
    }
}

/// Order book ladders.
#[derive(Debug, Serialize)]
pub struct DepthData<'a> {
    /// Bids, best first.
    pub buy: &'a [DepthLevel],
    /// Asks, best first.
    pub sell: &'a [DepthLevel],
}

/// Market data payload; fields present depend on the mode.
#[derive(Debug, Serialize)]
pub struct TickData<'a> {
    /// Last traded price.
    pub ltp: Decimal,
    /// Session open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open: Option<Decimal>,
    /// Session high.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,
    /// Session low.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,
    /// Previous close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close: Option<Decimal>,
    /// Traded volume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    /// Ladders (DEPTH only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<DepthData<'a>>,
    /// Exchange or provider timestamp.
    pub timestamp: DateTime<Utc>,
}

impl<'a> From<&'a Tick> for TickData<'a> {
    fn from(tick: &'a Tick) -> Self {
        let mode = tick.key.mode();
        let quote = matches!(mode, Mode::Quote | Mode::Depth);
        Self {
            ltp: tick.last_price,
            open: tick.open.filter(|_| quote),
            high: tick.high.filter(|_| quote),
            low: tick.low.filter(|_| quote),
            close: tick.close.filter(|_| quote),
            volume: tick.volume.filter(|_| quote),
            depth: (mode == Mode::Depth).then(|| DepthData {
                buy: &tick.bids,
                sell: &tick.asks,
            }),
            timestamp: tick.timestamp,
        }
    }
}

/// Frame sent to a client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame<'a> {
    /// Authentication result.
    Auth {
        /// Outcome.
        status: Status,
        /// Session id on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        /// Identity on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        /// Error code on failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Error detail on failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Subscribe result.
    Subscribe {
        /// Outcome.
        status: Status,
        /// Requested mode.
        mode: Mode,
        /// Entries now subscribed.
        accepted: Vec<SymbolEntry>,
        /// Entries refused.
        rejected: Vec<RejectedEntry>,
    },
    /// Unsubscribe acknowledgement.
    Unsubscribe {
        /// Always success.
        status: Status,
        /// Routing keys removed.
        removed: usize,
    },
    /// Logout acknowledgement.
    Logout {
        /// Always success.
        status: Status,
    },
    /// Keepalive answer.
    Pong,
    /// Request-level error.
    Error {
        /// Error code.
        code: ErrorCode,
        /// Detail.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Market data push.
    MarketData {
        /// Client-facing symbol.
        symbol: &'a str,
        /// Venue code.
        venue: &'a str,
        /// Stream mode.
        mode: Mode,
        /// Payload.
        data: TickData<'a>,
    },
}

impl<'a> ServerFrame<'a> {
    /// Frame for a core reply.
    #[must_use]
    pub fn reply(reply: &Reply) -> Self {
        match reply {
            Reply::Authenticated { client_id, user_id } => Self::Auth {
                status: Status::Success,
                client_id: Some(client_id.to_string()),
                user_id: Some(user_id.clone()),
                code: None,
                message: None,
            },
            Reply::Subscribed {
                mode,
                accepted,
                rejected,
            } => Self::Subscribe {
                status: subscribe_status(accepted.len(), rejected.len()),
                mode: *mode,
                accepted: accepted.iter().map(SymbolEntry::from).collect(),
                rejected: rejected.iter().map(RejectedEntry::from).collect(),
            },
            Reply::Unsubscribed { removed } => Self::Unsubscribe {
                status: Status::Success,
                removed: *removed,
            },
            Reply::LoggedOut => Self::Logout {
                status: Status::Success,
            },
            Reply::Pong => Self::Pong,
        }
    }

    /// Frame for a market data push.
    #[must_use]
    pub fn tick(tick: &'a Tick) -> Self {
        Self::MarketData {
            symbol: tick.key.symbol(),
            venue: tick.key.venue(),
            mode: tick.key.mode(),
            data: TickData::from(tick),
        }
    }

    /// Failed authentication.
    #[must_use]
    pub fn auth_error(message: impl Into<String>) -> Self {
        Self::Auth {
            status: Status::Error,
            client_id: None,
            user_id: None,
            code: Some(ErrorCode::AuthError),
            message: Some(message.into()),
        }
    }

    /// Request-level error.
    #[must_use]
    pub fn error(code: ErrorCode, message: Option<String>) -> Self {
        Self::Error { code, message }
    }

    /// Serialize to JSON text.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Serialize anything the core queued for a client.
///
/// # Errors
///
/// Returns `ProtocolError::Encode` if serialization fails.
pub fn encode_outbound(message: &Outbound) -> Result<String, ProtocolError> {
    match message {
        Outbound::Tick(tick) => ServerFrame::tick(tick).to_json(),
        Outbound::Reply(reply) => ServerFrame::reply(reply).to_json(),
    }
}

const fn subscribe_status(accepted: usize, rejected: usize) -> Status {
    match (accepted, rejected) {
        (_, 0) => Status::Success,
        (0, _) => Status::Error,
        _ => Status::Partial,
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Request could not be decoded.
    #[error("invalid request: {0}")]
    Decode(#[source] serde_json::Error),

    /// Frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};
    use test_case::test_case;

    use super::*;
    use crate::application::ports::SubscribeRejection;
    use crate::domain::market_data::RoutingKey;
    use crate::domain::subscription::ClientId;

    fn to_value(frame: &ServerFrame<'_>) -> Value {
        serde_json::from_str(&frame.to_json().unwrap()).unwrap()
    }

    #[test]
    fn parses_authenticate_with_alias() {
        assert_eq!(
            ClientRequest::parse(r#"{"action":"authenticate","token":"t1"}"#).unwrap(),
            ClientRequest::Authenticate {
                token: "t1".to_string()
            }
        );
        assert_eq!(
            ClientRequest::parse(r#"{"action":"authenticate","api_key":"t2"}"#).unwrap(),
            ClientRequest::Authenticate {
                token: "t2".to_string()
            }
        );
    }

    #[test_case(r#""LTP""#, Mode::Ltp ; "upper name")]
    #[test_case(r#""quote""#, Mode::Quote ; "lower name")]
    #[test_case("3", Mode::Depth ; "numeric")]
    fn parses_subscribe_modes(mode: &str, expected: Mode) {
        let text = format!(
            r#"{{"action":"subscribe","symbols":[{{"symbol":"INFY","venue":"NSE"}}],"mode":{mode}}}"#
        );
        let request = ClientRequest::parse(&text).unwrap();
        assert_eq!(
            request,
            ClientRequest::Subscribe {
                symbols: vec![SymbolEntry {
                    symbol: "INFY".to_string(),
                    venue: "NSE".to_string(),
                }],
                mode: expected,
            }
        );
    }

    #[test]
    fn unsubscribe_mode_is_optional() {
        let request =
            ClientRequest::parse(r#"{"action":"unsubscribe","symbols":[{"symbol":"A","venue":"B"}]}"#)
                .unwrap();
        assert!(matches!(request, ClientRequest::Unsubscribe { mode: None, .. }));
    }

    #[test_case(r#"{"action":"subscribe","symbols":[],"mode":"FULL"}"# ; "bad mode")]
    #[test_case(r#"{"action":"dance"}"# ; "unknown action")]
    #[test_case("not json" ; "garbage")]
    #[test_case(r#"{"action":"subscribe","mode":"LTP"}"# ; "missing symbols")]
    fn rejects_malformed_requests(text: &str) {
        assert!(matches!(
            ClientRequest::parse(text),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn auth_frames() {
        let client_id = ClientId::from_u128(7);
        let ok = ServerFrame::reply(&Reply::Authenticated {
            client_id,
            user_id: "alice".to_string(),
        });
        assert_eq!(
            to_value(&ok),
            json!({
                "type": "auth",
                "status": "success",
                "client_id": client_id.to_string(),
                "user_id": "alice",
            })
        );

        assert_eq!(
            to_value(&ServerFrame::auth_error("invalid token")),
            json!({
                "type": "auth",
                "status": "error",
                "code": "AUTH_ERROR",
                "message": "invalid token",
            })
        );
    }

    #[test]
    fn subscribe_status_reflects_rejections() {
        let accepted = vec![SubscriptionItem::new("INFY", "NSE")];
        let rejected = vec![RejectedItem {
            item: SubscriptionItem::new("NOPE", "NSE"),
            reason: SubscribeRejection::UnknownSymbol,
        }];

        let partial = ServerFrame::reply(&Reply::Subscribed {
            mode: Mode::Ltp,
            accepted: accepted.clone(),
            rejected: rejected.clone(),
        });
        assert_eq!(
            to_value(&partial),
            json!({
                "type": "subscribe",
                "status": "partial",
                "mode": "LTP",
                "accepted": [{"symbol": "INFY", "venue": "NSE"}],
                "rejected": [{"symbol": "NOPE", "venue": "NSE", "reason": "UnknownSymbol"}],
            })
        );

        let failed = ServerFrame::reply(&Reply::Subscribed {
            mode: Mode::Ltp,
            accepted: vec![],
            rejected,
        });
        assert_eq!(to_value(&failed)["status"], "error");

        let ok = ServerFrame::reply(&Reply::Subscribed {
            mode: Mode::Ltp,
            accepted,
            rejected: vec![],
        });
        assert_eq!(to_value(&ok)["status"], "success");
    }

    #[test]
    fn simple_replies() {
        assert_eq!(
            to_value(&ServerFrame::reply(&Reply::Unsubscribed { removed: 2 })),
            json!({"type": "unsubscribe", "status": "success", "removed": 2})
        );
        assert_eq!(
            to_value(&ServerFrame::reply(&Reply::LoggedOut)),
            json!({"type": "logout", "status": "success"})
        );
        assert_eq!(to_value(&ServerFrame::reply(&Reply::Pong)), json!({"type": "pong"}));
        assert_eq!(
            to_value(&ServerFrame::error(ErrorCode::NotAuthenticated, None)),
            json!({"type": "error", "code": "NOT_AUTHENTICATED"})
        );
    }

    fn full_tick(mode: Mode) -> Tick {
        let mut tick = Tick::ltp(
            RoutingKey::new("infy", "nse", mode),
            Decimal::new(15005, 1),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        );
        tick.open = Some(Decimal::new(1490, 0));
        tick.high = Some(Decimal::new(1510, 0));
        tick.low = Some(Decimal::new(1480, 0));
        tick.close = Some(Decimal::new(1495, 0));
        tick.volume = Some(12_000);
        tick.bids = vec![DepthLevel {
            price: Decimal::new(1500, 0),
            quantity: 10,
            orders: Some(2),
        }];
        tick.asks = vec![DepthLevel {
            price: Decimal::new(1501, 0),
            quantity: 5,
            orders: None,
        }];
        tick
    }

    #[test]
    fn ltp_push_carries_only_price() {
        let tick = full_tick(Mode::Ltp);
        let value = to_value(&ServerFrame::tick(&tick));

        assert_eq!(value["type"], "market_data");
        assert_eq!(value["symbol"], "INFY");
        assert_eq!(value["venue"], "NSE");
        assert_eq!(value["mode"], "LTP");
        assert_eq!(value["data"]["ltp"], "1500.5");
        assert!(value["data"].get("open").is_none());
        assert!(value["data"].get("depth").is_none());
        assert!(value["data"]["timestamp"].is_string());
    }

    #[test]
    fn depth_push_carries_ladders_and_ohlc() {
        let tick = Arc::new(full_tick(Mode::Depth));
        let text = encode_outbound(&Outbound::Tick(Arc::clone(&tick))).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["data"]["volume"], 12_000);
        assert_eq!(value["data"]["high"], "1510");
        assert_eq!(value["data"]["depth"]["buy"][0]["price"], "1500");
        assert_eq!(value["data"]["depth"]["buy"][0]["orders"], 2);
        assert_eq!(value["data"]["depth"]["sell"][0]["quantity"], 5);
        assert!(value["data"]["depth"]["sell"][0].get("orders").is_none());
    }

    #[test]
    fn quote_push_omits_depth() {
        let tick = full_tick(Mode::Quote);
        let value = to_value(&ServerFrame::tick(&tick));
        assert_eq!(value["data"]["open"], "1490");
        assert!(value["data"].get("depth").is_none());
    }
}
