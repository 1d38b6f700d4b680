//! Channel identification, usage types and the keys they are stored under.
//!
//! Every payment channel owns three independent counters, one per
//! [`UsageType`]. Each counter lives under its own [`UsageKey`], rendered as
//! `"{channel_id}/{USAGE_TYPE}"` (for example `"12345/USED"`).

use alloy_primitives::{I256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A non-negative, exact-precision monetary amount.
pub type Amount = U256;

/// A signed change applied to an [`Amount`].
pub type AmountDelta = I256;

/// Error returned when a usage type name is not one of `USED`, `PLANNED`, `REFUND`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown usage type {0}")]
pub struct ParseUsageTypeError(pub String);

/// Error returned when a stored key cannot be parsed back into a [`UsageKey`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseUsageKeyError {
    /// The key has no `/` separating channel id and usage type.
    #[error("key {0} has no channel/usage-type separator")]
    MissingSeparator(String),

    /// The channel id segment is not a decimal unsigned integer.
    #[error("invalid channel id {0}")]
    InvalidChannelId(String),

    /// The usage type segment is not a known usage type.
    #[error(transparent)]
    UsageType(#[from] ParseUsageTypeError),
}

/// Identifier of a payment channel.
///
/// Channel ids are unsigned 256-bit integers on chain and are always
/// rendered in decimal.
///
/// # Examples
///
/// ```
/// use prepaid_usage_core::channel::ChannelId;
///
/// let id = ChannelId::from(42u64);
/// assert_eq!(id.to_string(), "42");
/// assert_eq!("42".parse::<ChannelId>().unwrap(), id);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(U256);

impl ChannelId {
    /// Create a channel id from its on-chain value.
    #[must_use]
    pub const fn new(id: U256) -> Self {
        Self(id)
    }

    /// The on-chain value of this id.
    #[must_use]
    pub const fn value(self) -> U256 {
        self.0
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self(U256::from(id))
    }
}

impl From<U256> for ChannelId {
    fn from(id: U256) -> Self {
        Self(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = ParseUsageKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseUsageKeyError::InvalidChannelId(s.to_string()));
        }
        U256::from_str_radix(s, 10)
            .map(Self)
            .map_err(|_| ParseUsageKeyError::InvalidChannelId(s.to_string()))
    }
}

/// Which of a channel's three counters an update targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageType {
    /// Amount actually consumed by served requests.
    Used,
    /// Amount the client has signed for (authorized ahead of use).
    Planned,
    /// Amount refunded for failed requests.
    Refund,
}

impl UsageType {
    /// All usage types, in key order.
    pub const ALL: [Self; 3] = [Self::Used, Self::Planned, Self::Refund];

    /// Canonical upper-case name used in keys and requests.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Used => "USED",
            Self::Planned => "PLANNED",
            Self::Refund => "REFUND",
        }
    }

    /// Position of this type in [`UsageType::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Used => 0,
            Self::Planned => 1,
            Self::Refund => 2,
        }
    }
}

impl fmt::Display for UsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageType {
    type Err = ParseUsageTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USED" => Ok(Self::Used),
            "PLANNED" => Ok(Self::Planned),
            "REFUND" => Ok(Self::Refund),
            other => Err(ParseUsageTypeError(other.to_string())),
        }
    }
}

/// Store key of a single channel counter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    /// Channel the counter belongs to.
    pub channel_id: ChannelId,
    /// Counter kind.
    pub usage_type: UsageType,
}

impl UsageKey {
    /// Create a key for the given channel counter.
    #[must_use]
    pub const fn new(channel_id: ChannelId, usage_type: UsageType) -> Self {
        Self {
            channel_id,
            usage_type,
        }
    }

    /// The three keys of a channel, one per usage type.
    #[must_use]
    pub fn all_for(channel_id: ChannelId) -> [Self; 3] {
        UsageType::ALL.map(|usage_type| Self::new(channel_id, usage_type))
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.usage_type)
    }
}

impl FromStr for UsageKey {
    type Err = ParseUsageKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel, usage_type) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseUsageKeyError::MissingSeparator(s.to_string()))?;
        Ok(Self {
            channel_id: channel.parse()?,
            usage_type: usage_type.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_renders_decimal_channel_and_type_name() {
        let key = UsageKey::new(ChannelId::from(12345), UsageType::Used);
        assert_eq!(key.to_string(), "12345/USED");
    }

    #[test]
    fn key_parses_back() {
        let key: UsageKey = "42/PLANNED".parse().unwrap();
        assert_eq!(key, UsageKey::new(ChannelId::from(42), UsageType::Planned));
    }

    #[test]
    fn large_channel_ids_round_trip_in_decimal() {
        let id = ChannelId::new(U256::MAX);
        let key = UsageKey::new(id, UsageType::Refund);
        let parsed: UsageKey = key.to_string().parse().unwrap();
        assert_eq!(parsed.channel_id, id);
    }

    #[test]
    fn unknown_usage_type_is_rejected() {
        let err = "42/BOGUS".parse::<UsageKey>().unwrap_err();
        assert_eq!(
            err,
            ParseUsageKeyError::UsageType(ParseUsageTypeError("BOGUS".to_string()))
        );
        assert_eq!(err.to_string(), "unknown usage type BOGUS");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(matches!(
            "42USED".parse::<UsageKey>(),
            Err(ParseUsageKeyError::MissingSeparator(_))
        ));
        assert!(matches!(
            "0x2a/USED".parse::<UsageKey>(),
            Err(ParseUsageKeyError::InvalidChannelId(_))
        ));
        assert!(matches!(
            "/USED".parse::<UsageKey>(),
            Err(ParseUsageKeyError::InvalidChannelId(_))
        ));
    }

    #[test]
    fn all_for_covers_every_usage_type_once() {
        let keys = UsageKey::all_for(ChannelId::from(7));
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["7/USED", "7/PLANNED", "7/REFUND"]);
    }

    #[test]
    fn usage_type_index_matches_all_order() {
        for (position, usage_type) in UsageType::ALL.iter().enumerate() {
            assert_eq!(usage_type.index(), position);
        }
    }
}
