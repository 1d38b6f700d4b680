//! # Prepaid Usage Testing
//!
//! Testing utilities for prepaid usage accounting.
//!
//! This crate provides:
//! - In-memory stores, including ones that lose races or fail on purpose
//! - Fixtures for channels, amounts and organization metadata
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use prepaid_usage_testing::{amount, channel, delta, service_over};
//! use prepaid_usage_testing::mocks::InMemoryKeyValueStore;
//!
//! #[tokio::test]
//! async fn planned_then_used() {
//!     let store = Arc::new(InMemoryKeyValueStore::new());
//!     let service = service_over(store, RetryPolicy::immediate());
//!
//!     service.update_usage(channel(42), delta(1000), "PLANNED").await.unwrap();
//!     service.update_usage(channel(42), delta(400), "USED").await.unwrap();
//!
//!     let usage = service.usage(channel(42)).await.unwrap();
//!     assert_eq!(usage.used_amount, amount(400));
//! }
//! ```

pub mod mocks;

pub use mocks::{
    ConflictInjectingStore, FailingStore, FixedBlockNumber, FixedGroupId, InMemoryKeyValueStore,
};

/// Fixtures for channels, amounts and services.
pub mod helpers {
    use crate::mocks::FixedGroupId;
    use alloy_primitives::B256;
    use prepaid_usage_core::channel::{Amount, AmountDelta, ChannelId, UsageType};
    use prepaid_usage_core::rules::RuleRegistry;
    use prepaid_usage_core::typed_store::{KeyValueStore, TypedStore, UsageRecord};
    use prepaid_usage_runtime::retry::RetryPolicy;
    use prepaid_usage_runtime::service::PrepaidService;
    use std::sync::Arc;

    /// Organization metadata with two groups, `default_group` and
    /// `default_group2`.
    pub const ORGANIZATION_METADATA: &str = r#"{
        "org_name": "organization_name",
        "org_id": "org_id1",
        "groups": [
            {
                "group_name": "default_group2",
                "group_id": "99ybRIg2wAx55mqVsA6sB4S7WxPQHNKqa4BPu/bhj+U=",
                "payment": {
                    "payment_address": "0x671276c61943A35D5F230d076bDFd91B0c47bF09",
                    "payment_expiration_threshold": 40320,
                    "payment_channel_storage_type": "etcd",
                    "payment_channel_storage_client": {
                        "connection_timeout": "5s",
                        "request_timeout": "3s",
                        "endpoints": ["http://127.0.0.1:2379"]
                    }
                }
            },
            {
                "group_name": "default_group",
                "group_id": "88ybRIg2wAx55mqVsA6sB4S7WxPQHNKqa4BPu/bhj+U=",
                "payment": {
                    "payment_address": "0x671276c61943A35D5F230d076bDFd91B0c47bF09",
                    "payment_expiration_threshold": 40320,
                    "payment_channel_storage_type": "etcd",
                    "payment_channel_storage_client": {
                        "connection_timeout": "5s",
                        "request_timeout": "3s",
                        "endpoints": ["http://127.0.0.1:2379"]
                    }
                }
            }
        ]
    }"#;

    /// Group id used by [`service_over`].
    #[must_use]
    pub fn test_group_id() -> B256 {
        B256::repeat_byte(0x42)
    }

    /// Channel id from a small number.
    #[must_use]
    pub fn channel(id: u64) -> ChannelId {
        ChannelId::from(id)
    }

    /// Unsigned amount from a small number.
    #[must_use]
    pub fn amount(value: u64) -> Amount {
        Amount::from(value)
    }

    /// Signed amount from a small number.
    ///
    /// # Panics
    ///
    /// Never: every `i64` fits in 256 bits.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn delta(value: i64) -> AmountDelta {
        value
            .to_string()
            .parse()
            .expect("every i64 is a valid 256-bit signed amount")
    }

    /// Counter record.
    #[must_use]
    pub fn record(channel_id: u64, usage_type: UsageType, value: u64) -> UsageRecord {
        UsageRecord {
            channel_id: channel(channel_id),
            usage_type,
            amount: amount(value),
        }
    }

    /// Service with the standard rules over `store`.
    ///
    /// # Panics
    ///
    /// Never: the fixed group id cannot fail to resolve.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn service_over(store: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> PrepaidService {
        PrepaidService::new(
            TypedStore::new(store),
            RuleRegistry::standard(),
            policy,
            &FixedGroupId(test_group_id()),
        )
        .expect("fixed group id always resolves")
    }
}

/// Property-based testing strategies using proptest.
pub mod properties {
    use prepaid_usage_core::channel::{ChannelId, UsageType};
    use proptest::prelude::*;

    /// Any of the three usage types.
    pub fn usage_types() -> impl Strategy<Value = UsageType> {
        prop_oneof![
            Just(UsageType::Used),
            Just(UsageType::Planned),
            Just(UsageType::Refund),
        ]
    }

    /// Channel ids from a small range, so operations collide.
    pub fn channel_ids() -> impl Strategy<Value = ChannelId> {
        (0u64..4).prop_map(ChannelId::from)
    }

    /// A sequence of `(usage type, signed amount)` updates.
    ///
    /// Amounts are mostly positive with occasional negative planned
    /// revisions, so both accepted and rejected updates show up.
    pub fn usage_updates(max_len: usize) -> impl Strategy<Value = Vec<(UsageType, i64)>> {
        prop::collection::vec((usage_types(), -20i64..200), 1..=max_len)
    }
}

/// Install a tracing subscriber writing to the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub use helpers::{amount, channel, delta, record, service_over, test_group_id};
