//! Typed boundary over the shared key-value store.
//!
//! The storage backend (an etcd-style cluster in production) only knows
//! strings. [`TypedStore`] is the single place where those strings are
//! decoded into [`UsageKey`]s and [`StoredValue`]s, so everything above it
//! works with closed, strongly typed data.
//!
//! # Conditional swaps
//!
//! A [`TypedEntry`] remembers the exact bytes it was decoded from. Swaps are
//! conditioned on those bytes rather than on a re-encoding of the decoded
//! value, so a value written by a different encoder still compares equal to
//! itself.

use crate::channel::{Amount, ChannelId, ParseUsageKeyError, UsageKey, UsageType};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by [`KeyValueStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors surfaced by the store boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or rejected the request.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The backend did not answer in time.
    #[error("storage request timed out after {0:?}")]
    Timeout(Duration),

    /// A stored key names a usage type outside `USED`, `PLANNED`, `REFUND`.
    #[error("unknown usage type {usage_type} in stored key {key}")]
    UnknownUsageType {
        /// The raw key.
        key: String,
        /// The unrecognised usage type segment.
        usage_type: String,
    },

    /// A stored key does not have the `{channel}/{TYPE}` shape.
    #[error("malformed stored key {key}: {reason}")]
    MalformedKey {
        /// The raw key.
        key: String,
        /// Why it could not be parsed.
        reason: String,
    },

    /// A stored value could not be decoded.
    #[error("failed to decode value stored at {key}: {reason}")]
    Decode {
        /// Key the value was read from.
        key: String,
        /// Decoder message.
        reason: String,
    },

    /// A value could not be encoded for writing.
    #[error("failed to encode value for {key}: {reason}")]
    Encode {
        /// Key the value was destined for.
        key: String,
        /// Encoder message.
        reason: String,
    },
}

impl StoreError {
    /// Whether the store answered but holds data this layer cannot decode.
    #[must_use]
    pub const fn is_corrupt_data(&self) -> bool {
        matches!(
            self,
            Self::UnknownUsageType { .. } | Self::MalformedKey { .. } | Self::Decode { .. }
        )
    }
}

/// A condition of a conditional swap: `key` must currently hold `expected`.
///
/// `expected = None` means the key must be absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyCondition {
    /// Key to compare.
    pub key: String,
    /// Value the key must still hold.
    pub expected: Option<String>,
}

/// A write performed when every condition of a swap holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyWrite {
    /// Key to write.
    pub key: String,
    /// New value.
    pub value: String,
}

/// The shared key-value store the accounting data lives in.
///
/// Implementations must be `Send + Sync`; they are shared by every caller
/// and never locked exclusively by this crate.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be held as
/// `Arc<dyn KeyValueStore>`.
pub trait KeyValueStore: Send + Sync {
    /// Read a single key. A missing key is `Ok(None)`, not an error.
    fn get(&self, key: String) -> StoreFuture<'_, Option<String>>;

    /// Read every key/value pair currently stored.
    ///
    /// Each pair is read at some point during the call; the result is not a
    /// consistent snapshot across keys.
    fn get_all(&self) -> StoreFuture<'_, Vec<(String, String)>>;

    /// Atomically apply `writes` if, and only if, every condition holds.
    ///
    /// Returns `Ok(false)` when at least one condition failed; nothing is
    /// written in that case.
    fn compare_and_swap(
        &self,
        conditions: Vec<KeyCondition>,
        writes: Vec<KeyWrite>,
    ) -> StoreFuture<'_, bool>;
}

/// Persisted amount of one channel counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Channel the counter belongs to.
    pub channel_id: ChannelId,
    /// Counter kind.
    pub usage_type: UsageType,
    /// Current amount.
    pub amount: Amount,
}

impl UsageRecord {
    /// The key this record is stored under.
    #[must_use]
    pub const fn key(&self) -> UsageKey {
        UsageKey::new(self.channel_id, self.usage_type)
    }
}

/// Every kind of value the accounting layer stores, tagged by `kind`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredValue {
    /// A channel counter.
    Usage(UsageRecord),
}

impl StoredValue {
    /// The usage record carried by this value.
    #[must_use]
    pub const fn as_usage(&self) -> &UsageRecord {
        match self {
            Self::Usage(record) => record,
        }
    }

    /// Consume the value, returning the usage record it carries.
    #[must_use]
    pub fn into_usage(self) -> UsageRecord {
        match self {
            Self::Usage(record) => record,
        }
    }
}

impl From<UsageRecord> for StoredValue {
    fn from(record: UsageRecord) -> Self {
        Self::Usage(record)
    }
}

/// A key as read from the store, with its decoded value if present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypedEntry {
    /// The key that was read.
    pub key: UsageKey,
    /// Decoded value, `None` when the key does not exist yet.
    pub value: Option<StoredValue>,
    raw: Option<String>,
}

impl TypedEntry {
    /// An entry for a key that does not exist.
    #[must_use]
    pub const fn absent(key: UsageKey) -> Self {
        Self {
            key,
            value: None,
            raw: None,
        }
    }

    /// An entry holding `value`, as if it had just been read.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Encode`] if the value cannot be encoded.
    pub fn present(key: UsageKey, value: StoredValue) -> Result<Self, StoreError> {
        let raw = encode_value(&key, &value)?;
        Ok(Self {
            key,
            value: Some(value),
            raw: Some(raw),
        })
    }

    fn condition(&self) -> KeyCondition {
        KeyCondition {
            key: self.key.to_string(),
            expected: self.raw.clone(),
        }
    }
}

/// A proposed change of one key: swap `old` (as read) for `new`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CasUpdate {
    /// Key being written.
    pub key: UsageKey,
    /// Value the update was computed from.
    pub old: Option<StoredValue>,
    /// Value to write.
    pub new: StoredValue,
}

/// Typed view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct TypedStore {
    inner: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for TypedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedStore").finish_non_exhaustive()
    }
}

impl TypedStore {
    /// Wrap a raw store.
    #[must_use]
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    /// Read one key.
    ///
    /// # Errors
    ///
    /// Propagates backend failures. Returns [`StoreError::UnknownUsageType`]
    /// if the stored record names an unknown usage type, and
    /// [`StoreError::Decode`] if the value is otherwise not a valid
    /// [`StoredValue`].
    pub async fn get(&self, key: UsageKey) -> Result<TypedEntry, StoreError> {
        let rendered = key.to_string();
        let raw = self.inner.get(rendered.clone()).await?;
        let value = raw
            .as_deref()
            .map(|raw| decode_value(&rendered, raw))
            .transpose()?;
        Ok(TypedEntry { key, value, raw })
    }

    /// Read several keys, in order.
    ///
    /// # Errors
    ///
    /// Fails on the first key that cannot be read or decoded.
    pub async fn get_many(&self, keys: &[UsageKey]) -> Result<Vec<TypedEntry>, StoreError> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            entries.push(self.get(*key).await?);
        }
        Ok(entries)
    }

    /// Read and decode every stored pair, sorted by key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownUsageType`] for keys or records naming an
    /// unknown usage type, [`StoreError::MalformedKey`] for other keys that do
    /// not decode, and [`StoreError::Decode`] for other values.
    pub async fn get_all(&self) -> Result<Vec<(UsageKey, StoredValue)>, StoreError> {
        let mut decoded = Vec::new();
        for (raw_key, raw_value) in self.inner.get_all().await? {
            let key = decode_key(&raw_key)?;
            let value = decode_value(&raw_key, &raw_value)?;
            decoded.push((key, value));
        }
        decoded.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(decoded)
    }

    /// Apply `updates` only if every entry of `snapshot` is still current.
    ///
    /// The condition covers all of `snapshot`, including keys that are not
    /// written, so a concurrent change to any of them fails the swap.
    ///
    /// # Errors
    ///
    /// Propagates backend failures and encoding errors. A lost race is
    /// `Ok(false)`, not an error.
    pub async fn compare_and_swap(
        &self,
        snapshot: &[TypedEntry],
        updates: &[CasUpdate],
    ) -> Result<bool, StoreError> {
        let conditions = snapshot.iter().map(TypedEntry::condition).collect();
        let writes = updates
            .iter()
            .map(|update| {
                Ok(KeyWrite {
                    key: update.key.to_string(),
                    value: encode_value(&update.key, &update.new)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.inner.compare_and_swap(conditions, writes).await
    }
}

fn decode_key(raw: &str) -> Result<UsageKey, StoreError> {
    raw.parse().map_err(|err| match err {
        ParseUsageKeyError::UsageType(unknown) => StoreError::UnknownUsageType {
            key: raw.to_string(),
            usage_type: unknown.0,
        },
        other => StoreError::MalformedKey {
            key: raw.to_string(),
            reason: other.to_string(),
        },
    })
}

fn decode_value(key: &str, raw: &str) -> Result<StoredValue, StoreError> {
    serde_json::from_str(raw).map_err(|err| match unknown_usage_type_tag(raw) {
        Some(usage_type) => StoreError::UnknownUsageType {
            key: key.to_string(),
            usage_type,
        },
        None => StoreError::Decode {
            key: key.to_string(),
            reason: err.to_string(),
        },
    })
}

/// The `usage_type` tag of an undecodable value, if it is a string that is
/// not a known usage type.
fn unknown_usage_type_tag(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let tag = value.get("usage_type")?.as_str()?;
    tag.parse::<UsageType>().is_err().then(|| tag.to_string())
}

fn encode_value(key: &UsageKey, value: &StoredValue) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Encode {
        key: key.to_string(),
        reason: err.to_string(),
    })
}
