//! Market Data Types
//!
//! Core domain types for routing and normalized ticks. These types are
//! codec-agnostic and represent the canonical internal representation of
//! market data, regardless of which provider produced it.
//!
//! # Routing
//!
//! A [`RoutingKey`] identifies one subscribable stream: a symbol on a venue
//! at a granularity [`Mode`]. Symbol and venue are upper-cased on
//! construction so that `("infy", "nse")` and `("INFY", "NSE")` route to the
//! same subscribers.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Mode
// =============================================================================

/// Granularity of a market data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Last traded price only.
    Ltp,
    /// Last price plus OHLC and volume.
    Quote,
    /// Quote plus bid/ask ladders.
    Depth,
}

impl Mode {
    /// All modes, in increasing granularity.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ltp, Self::Quote, Self::Depth]
    }

    /// Client-facing name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ltp => "LTP",
            Self::Quote => "QUOTE",
            Self::Depth => "DEPTH",
        }
    }

    /// Name used on provider wire protocols.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Depth => "depth",
        }
    }

    /// Numeric code (1 = LTP, 2 = QUOTE, 3 = DEPTH).
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Ltp => 1,
            Self::Quote => 2,
            Self::Depth => 3,
        }
    }

    /// Parse a numeric mode code.
    #[must_use]
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Ltp),
            2 => Some(Self::Quote),
            3 => Some(Self::Depth),
            _ => None,
        }
    }

    /// Parse a mode name, ignoring case.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "LTP" | "1" => Some(Self::Ltp),
            "QUOTE" | "2" => Some(Self::Quote),
            "DEPTH" | "3" => Some(Self::Depth),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawMode {
            Code(u64),
            Name(String),
        }

        match RawMode::deserialize(deserializer)? {
            RawMode::Code(code) => Self::from_code(code)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown mode code: {code}"))),
            RawMode::Name(name) => Self::parse(&name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown mode: {name}"))),
        }
    }
}

// =============================================================================
// Routing Key
// =============================================================================

/// Identifies one logical subscribable stream.
///
/// Immutable once built; symbol and venue are stored upper-cased so equality
/// and hashing are case-insensitive with respect to the caller's input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey {
    symbol: String,
    venue: String,
    mode: Mode,
}

impl RoutingKey {
    /// Create a routing key, normalizing symbol and venue.
    #[must_use]
    pub fn new(symbol: &str, venue: &str, mode: Mode) -> Self {
        Self {
            symbol: normalize(symbol),
            venue: normalize(venue),
            mode,
        }
    }

    /// Client-facing symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Venue (exchange) code.
    #[must_use]
    pub fn venue(&self) -> &str {
        &self.venue
    }

    /// Stream granularity.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Same symbol and venue at a different mode.
    #[must_use]
    pub fn with_mode(&self, mode: Mode) -> Self {
        Self {
            symbol: self.symbol.clone(),
            venue: self.venue.clone(),
            mode,
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.symbol, self.venue, self.mode)
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_uppercase()
}

// =============================================================================
// Instrument
// =============================================================================

/// A client-facing (symbol, venue) pair bound to its provider-native symbol.
///
/// Adapters keep these so that provider ticks, which only carry the
/// provider symbol, can be normalized back into routing keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instrument {
    /// Client-facing symbol (normalized).
    pub symbol: String,
    /// Venue code (normalized).
    pub venue: String,
    /// Symbol as the provider knows it.
    pub provider_symbol: String,
}

impl Instrument {
    /// Create an instrument binding.
    #[must_use]
    pub fn new(symbol: &str, venue: &str, provider_symbol: impl Into<String>) -> Self {
        Self {
            symbol: normalize(symbol),
            venue: normalize(venue),
            provider_symbol: provider_symbol.into(),
        }
    }

    /// Routing key for this instrument at the given mode.
    #[must_use]
    pub fn routing_key(&self, mode: Mode) -> RoutingKey {
        RoutingKey {
            symbol: self.symbol.clone(),
            venue: self.venue.clone(),
            mode,
        }
    }
}

// =============================================================================
// Tick
// =============================================================================

/// One level of an order book ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Price at this level.
    pub price: Decimal,
    /// Aggregate quantity at this level.
    pub quantity: u64,
    /// Number of orders at this level, when the provider reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders: Option<u32>,
}

/// A normalized market event.
///
/// Published once per upstream event and never mutated afterwards. The
/// fields populated depend on the routing key's mode: LTP ticks carry only
/// `last_price`, QUOTE ticks add OHLC and volume, DEPTH ticks add ladders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    /// Stream this tick belongs to.
    pub key: RoutingKey,
    /// Last traded price.
    pub last_price: Decimal,
    /// Session open.
    pub open: Option<Decimal>,
    /// Session high.
    pub high: Option<Decimal>,
    /// Session low.
    pub low: Option<Decimal>,
    /// Previous close.
    pub close: Option<Decimal>,
    /// Traded volume.
    pub volume: Option<u64>,
    /// Bid ladder, best first.
    pub bids: Vec<DepthLevel>,
    /// Ask ladder, best first.
    pub asks: Vec<DepthLevel>,
    /// Exchange or provider timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Create an LTP-only tick.
    #[must_use]
    pub const fn ltp(key: RoutingKey, last_price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            last_price,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp,
        }
    }

    /// Whether OHLC fields are all present.
    #[must_use]
    pub const fn has_ohlc(&self) -> bool {
        self.open.is_some() && self.high.is_some() && self.low.is_some() && self.close.is_some()
    }

    /// Whether either side of the book is present.
    #[must_use]
    pub fn has_depth(&self) -> bool {
        !self.bids.is_empty() || !self.asks.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
