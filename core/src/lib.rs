//! # Prepaid Usage Core
//!
//! Core types and rules for metering prepaid payment-channel usage.
//!
//! Every payment channel carries three running counters that meter a paid
//! service against the funds locked in the channel:
//!
//! - **Planned**: amount the client has signed for
//! - **Used**: amount actually consumed
//! - **Refund**: amount refunded for failed requests
//!
//! Counters are stored under independent keys of a shared key-value store and
//! updated with optimistic concurrency (compare-and-swap), never with locks.
//!
//! ## Core Concepts
//!
//! - [`channel`]: channel ids, usage types and their store keys
//! - [`typed_store`]: the key-value store collaborator and the typed boundary over it
//! - [`usage`]: reconstruction of a channel's aggregated view
//! - [`rules`]: the accounting rules and the registry dispatching to them
//! - [`metadata`]: organization metadata naming the group a daemon accounts for
//!
//! ## Example
//!
//! ```
//! use prepaid_usage_core::channel::{ChannelId, UsageType};
//! use prepaid_usage_core::rules::RuleRegistry;
//! use prepaid_usage_core::usage::AggregatedUsage;
//!
//! let registry = RuleRegistry::standard();
//! let current = AggregatedUsage::empty(ChannelId::from(42));
//!
//! // Nothing planned yet, so any usage exceeds the allowance.
//! let result = registry
//!     .rule(UsageType::Used)
//!     .apply(&current, "1".parse().unwrap());
//! assert!(result.is_err());
//! ```

pub mod channel;
pub mod metadata;
pub mod rules;
pub mod typed_store;
pub mod usage;

pub use channel::{Amount, AmountDelta, ChannelId, UsageKey, UsageType};
pub use typed_store::{KeyValueStore, StoreError, StoredValue, TypedStore, UsageRecord};
pub use usage::{AggregatedUsage, UsageError};
