//! Feed Codec
//!
//! Encodes client frames and decodes server frames for either wire format a
//! provider may speak.
//!
//! - **JSON**: text WebSocket frames
//! - **`MessagePack`**: binary WebSocket frames, maps with string keys
//!
//! Server frames are dispatched on their `"T"` field. A frame may be a
//! single object or an array of objects; unknown types are skipped so a
//! provider adding frame types does not break the connection.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::Message;

use super::messages::{ErrorFrame, FeedMessage, SubscriptionFrame, SuccessFrame, TickFrame};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// `MessagePack` encoding failed.
    #[error("`MessagePack` encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// `MessagePack` bytes could not be read.
    #[error("`MessagePack` decode error: {0}")]
    MsgPackDecode(#[from] rmpv::decode::Error),

    /// A `MessagePack` value did not match the expected frame.
    #[error("`MessagePack` frame error: {0}")]
    MsgPackValue(#[from] rmpv::ext::Error),

    /// Frame is neither an object nor an array of objects.
    #[error("invalid frame: {0}")]
    InvalidFormat(String),

    /// Frame kind does not match the negotiated wire format.
    #[error("expected {expected} frame")]
    WrongFrameKind {
        /// Frame kind the codec expects.
        expected: &'static str,
    },
}

/// Wire format spoken by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// `MessagePack` binary frames.
    MsgPack,
}

impl WireFormat {
    /// Parse a configuration value (`json` or `msgpack`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "msgpack" | "messagepack" => Some(Self::MsgPack),
            _ => None,
        }
    }

    /// Configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
        }
    }
}

/// Codec for one wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedCodec {
    format: WireFormat,
}

impl FeedCodec {
    /// Create a codec.
    #[must_use]
    pub const fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// The codec's wire format.
    #[must_use]
    pub const fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a client frame as a WebSocket message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode<T: Serialize>(&self, frame: &T) -> Result<Message, CodecError> {
        match self.format {
            WireFormat::Json => Ok(Message::Text(serde_json::to_string(frame)?.into())),
            WireFormat::MsgPack => Ok(Message::Binary(rmp_serde::to_vec_named(frame)?.into())),
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec is not JSON or the text is malformed.
    pub fn decode_text(&self, text: &str) -> Result<Vec<FeedMessage>, CodecError> {
        if self.format != WireFormat::Json {
            return Err(CodecError::WrongFrameKind {
                expected: "binary",
            });
        }

        let value: serde_json::Value = serde_json::from_str(text.trim())?;
        match value {
            serde_json::Value::Array(items) => {
                let mut messages = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(message) = decode_json_frame(item)? {
                        messages.push(message);
                    }
                }
                Ok(messages)
            }
            serde_json::Value::Object(_) => Ok(decode_json_frame(value)?.into_iter().collect()),
            other => Err(CodecError::InvalidFormat(format!(
                "expected array or object, got {other}"
            ))),
        }
    }

    /// Decode a binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec is not `MessagePack` or the bytes are
    /// malformed.
    pub fn decode_binary(&self, data: &[u8]) -> Result<Vec<FeedMessage>, CodecError> {
        if self.format != WireFormat::MsgPack {
            return Err(CodecError::WrongFrameKind { expected: "text" });
        }

        let mut cursor = std::io::Cursor::new(data);
        let value = rmpv::decode::read_value(&mut cursor)?;
        match value {
            rmpv::Value::Array(items) => {
                let mut messages = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(message) = decode_msgpack_frame(item)? {
                        messages.push(message);
                    }
                }
                Ok(messages)
            }
            rmpv::Value::Map(_) => Ok(decode_msgpack_frame(value)?.into_iter().collect()),
            other => Err(CodecError::InvalidFormat(format!(
                "expected array or map, got {other}"
            ))),
        }
    }

    /// Decode whatever frame arrived. Control frames yield nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be decoded.
    pub fn decode(&self, message: &Message) -> Result<Vec<FeedMessage>, CodecError> {
        match message {
            Message::Text(text) => self.decode_text(text.as_str()),
            Message::Binary(data) => self.decode_binary(data),
            _ => Ok(Vec::new()),
        }
    }
}

fn decode_json_frame(value: serde_json::Value) -> Result<Option<FeedMessage>, CodecError> {
    let kind = value.get("T").and_then(serde_json::Value::as_str);
    let message = match kind {
        Some("success") => FeedMessage::Success(serde_json::from_value(value)?),
        Some("error") => FeedMessage::Error(serde_json::from_value(value)?),
        Some("subscription") => FeedMessage::Subscription(serde_json::from_value(value)?),
        Some("tick") => FeedMessage::Tick(serde_json::from_value(value)?),
        other => {
            tracing::trace!(kind = ?other, "Skipping unknown feed frame");
            return Ok(None);
        }
    };
    Ok(Some(message))
}

fn decode_msgpack_frame(value: rmpv::Value) -> Result<Option<FeedMessage>, CodecError> {
    let kind = value.as_map().and_then(|entries| {
        entries
            .iter()
            .find(|(key, _)| key.as_str() == Some("T"))
            .and_then(|(_, kind)| kind.as_str())
            .map(str::to_string)
    });

    let message = match kind.as_deref() {
        Some("success") => FeedMessage::Success(from_msgpack::<SuccessFrame>(value)?),
        Some("error") => FeedMessage::Error(from_msgpack::<ErrorFrame>(value)?),
        Some("subscription") => FeedMessage::Subscription(from_msgpack::<SubscriptionFrame>(value)?),
        Some("tick") => FeedMessage::Tick(from_msgpack::<TickFrame>(value)?),
        other => {
            tracing::trace!(kind = ?other, "Skipping unknown feed frame");
            return Ok(None);
        }
    };
    Ok(Some(message))
}

fn from_msgpack<T: DeserializeOwned>(value: rmpv::Value) -> Result<T, CodecError> {
    Ok(rmpv::ext::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::feed::messages::{SubscriptionRequest, SuccessKind};
    use crate::domain::market_data::Mode;

    #[test]
    fn json_decodes_batched_frames() {
        let codec = FeedCodec::new(WireFormat::Json);
        let text = r#"[
            {"T":"success","msg":"connected"},
            {"T":"tick","S":"INFY-EQ","lp":"1500.5"},
            {"T":"news","headline":"ignored"},
            {"T":"error","code":402,"msg":"auth failed"}
        ]"#;

        let messages = codec.decode_text(text).unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0],
            FeedMessage::Success(SuccessFrame {
                msg: SuccessKind::Connected
            })
        );
        assert!(matches!(&messages[1], FeedMessage::Tick(t) if t.symbol == "INFY-EQ"));
        assert!(matches!(&messages[2], FeedMessage::Error(e) if e.code == 402));
    }

    #[test]
    fn json_decodes_single_object() {
        let codec = FeedCodec::new(WireFormat::Json);
        let messages = codec
            .decode_text(r#"{"T":"subscription","ltp":["A","B"]}"#)
            .unwrap();
        assert!(matches!(&messages[..], [FeedMessage::Subscription(s)] if s.ltp.len() == 2));
    }

    #[test_case("42" ; "number")]
    #[test_case("not json" ; "garbage")]
    fn json_rejects_non_frames(text: &str) {
        let codec = FeedCodec::new(WireFormat::Json);
        assert!(codec.decode_text(text).is_err());
    }

    #[test]
    fn msgpack_decodes_tick_array() {
        let codec = FeedCodec::new(WireFormat::MsgPack);
        let mut tick = TickFrame::last_price("INFY-EQ", Decimal::new(1501, 0));
        tick.volume = Some(42);

        #[derive(serde::Serialize)]
        struct Tagged<'a> {
            #[serde(rename = "T")]
            kind: &'static str,
            #[serde(flatten)]
            tick: &'a TickFrame,
        }

        let bytes = rmp_serde::to_vec_named(&vec![Tagged {
            kind: "tick",
            tick: &tick,
        }])
        .unwrap();

        let messages = codec.decode_binary(&bytes).unwrap();
        assert_eq!(messages, vec![FeedMessage::Tick(tick)]);
    }

    #[test]
    fn wrong_frame_kind_is_an_error() {
        let json = FeedCodec::new(WireFormat::Json);
        let msgpack = FeedCodec::new(WireFormat::MsgPack);

        assert!(matches!(
            json.decode_binary(&[0x90]),
            Err(CodecError::WrongFrameKind { .. })
        ));
        assert!(matches!(
            msgpack.decode_text("[]"),
            Err(CodecError::WrongFrameKind { .. })
        ));
    }

    #[test]
    fn encode_matches_wire_format() {
        let request = SubscriptionRequest::subscribe(Mode::Ltp, vec!["A".into()]);

        let text = FeedCodec::new(WireFormat::Json).encode(&request).unwrap();
        assert!(text.is_text());

        let binary = FeedCodec::new(WireFormat::MsgPack).encode(&request).unwrap();
        assert!(binary.is_binary());
        let decoded: SubscriptionRequest = rmp_serde::from_slice(&binary.into_data()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test_case("json", Some(WireFormat::Json))]
    #[test_case("MsgPack", Some(WireFormat::MsgPack))]
    #[test_case("xml", None)]
    fn wire_format_parse(input: &str, expected: Option<WireFormat>) {
        assert_eq!(WireFormat::parse(input), expected);
    }
}
