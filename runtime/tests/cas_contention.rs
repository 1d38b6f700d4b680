//! Integration tests for the compare-and-swap engine under contention.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::future::join_all;
use prepaid_usage_core::channel::{UsageKey, UsageType};
use prepaid_usage_core::typed_store::{
    CasUpdate, KeyValueStore, StoreError, StoredValue, TypedEntry, TypedStore,
};
use prepaid_usage_core::usage::UsageError;
use prepaid_usage_runtime::retry::RetryPolicy;
use prepaid_usage_runtime::service::{ErrorKind, UsageServiceError};
use prepaid_usage_runtime::transaction::{CasEngine, CasRequest, TransactionError};
use prepaid_usage_testing::mocks::{ConflictInjectingStore, FailingStore, InMemoryKeyValueStore};
use prepaid_usage_testing::{amount, channel, delta, init_test_tracing, record, service_over};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

// ============================================================================
// Test Fixtures
// ============================================================================

/// A competing writer that keeps consuming usage on channel 42.
fn competing_usage(store: &InMemoryKeyValueStore, n: usize) {
    store.put_record(&record(42, UsageType::Used, 1 + n as u64));
}

fn planned_channel_42(planned: u64) -> Arc<InMemoryKeyValueStore> {
    let store = Arc::new(InMemoryKeyValueStore::new());
    store.put_record(&record(42, UsageType::Planned, planned));
    store
}

fn engine_over(store: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> CasEngine {
    CasEngine::new(TypedStore::new(store), policy)
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_used_increments_lose_no_update() {
    init_test_tracing();
    let store = planned_channel_42(10_000);
    let service = Arc::new(service_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::unbounded(),
    ));

    let handles = (0..20).map(|i| {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .update_usage(channel(42), delta(10 + i), "USED")
                .await
        })
    });
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    let expected: u64 = (0..20).map(|i| 10 + i).sum();
    let usage = service.usage(channel(42)).await.unwrap();
    assert_eq!(usage.used_amount, amount(expected));
    assert_eq!(usage.planned_amount, amount(10_000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_of_different_counters_compose() {
    let store = planned_channel_42(1_000);
    let service = Arc::new(service_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::unbounded(),
    ));

    let updates = [("USED", 300), ("PLANNED", 500), ("REFUND", 40), ("USED", 200)];
    let handles = updates.into_iter().map(|(usage_type, value)| {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .update_usage(channel(42), delta(value), usage_type)
                .await
        })
    });
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    let usage = service.usage(channel(42)).await.unwrap();
    assert_eq!(usage.used_amount, amount(500));
    assert_eq!(usage.planned_amount, amount(1_500));
    assert_eq!(usage.failed_amount, amount(40));
}

// ============================================================================
// Retry Behavior
// ============================================================================

#[tokio::test]
async fn test_lost_race_is_retried_against_fresh_state() {
    let inner = planned_channel_42(1_000);
    let store = Arc::new(ConflictInjectingStore::new(
        Arc::clone(&inner),
        2,
        competing_usage,
    ));
    let service = service_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    );

    service
        .update_usage(channel(42), delta(100), "USED")
        .await
        .unwrap();

    assert_eq!(store.injected(), 2);
    // The last competing write left used at 2; the retry built on it.
    let usage = service.usage(channel(42)).await.unwrap();
    assert_eq!(usage.used_amount, amount(102));
}

#[tokio::test]
async fn test_retry_rechecks_the_rule_against_fresh_state() {
    let inner = planned_channel_42(100);
    let store = Arc::new(ConflictInjectingStore::new(Arc::clone(&inner), 1, |store, _| {
        store.put_record(&record(42, UsageType::Used, 90));
    }));
    let service = service_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    );

    let err = service
        .update_usage(channel(42), delta(20), "USED")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UsageServiceError::Usage(UsageError::UsageExceeded { .. })
    ));
    let usage = service.usage(channel(42)).await.unwrap();
    assert_eq!(usage.used_amount, amount(90));
}

#[tokio::test]
async fn test_change_to_an_unwritten_key_still_fails_the_swap() {
    let inner = planned_channel_42(1_000);
    let store = Arc::new(ConflictInjectingStore::new(Arc::clone(&inner), 1, |store, _| {
        store.put_record(&record(42, UsageType::Refund, 5));
    }));
    let engine = engine_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    );
    let key = UsageKey::new(channel(42), UsageType::Used);
    let request = CasRequest::new(
        UsageKey::all_for(channel(42)).to_vec(),
        |snapshot: &[TypedEntry]| -> Result<Vec<CasUpdate>, Infallible> {
            let read = snapshot.iter().find(|entry| entry.key == key).unwrap();
            Ok(vec![CasUpdate {
                key,
                old: read.value.clone(),
                new: StoredValue::Usage(record(42, UsageType::Used, 1)),
            }])
        },
    );

    let outcome = engine.execute(request).await.unwrap();

    assert!(!outcome.applied);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(inner.raw("42/USED"), None);
}

#[tokio::test]
async fn test_exhausted_policy_reports_not_applied() {
    let inner = planned_channel_42(1_000);
    let store = Arc::new(ConflictInjectingStore::always(
        Arc::clone(&inner),
        competing_usage,
    ));
    let service = service_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate().with_max_attempts(3),
    );

    let err = service
        .update_usage(channel(42), delta(10), "USED")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UsageServiceError::NotApplied {
            usage_type: UsageType::Used,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(store.injected(), 3);
}

#[tokio::test]
async fn test_without_retry_a_lost_race_is_reported() {
    let inner = planned_channel_42(1_000);
    let store = Arc::new(ConflictInjectingStore::new(
        Arc::clone(&inner),
        1,
        competing_usage,
    ));
    let engine = engine_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    );
    let calls = AtomicU32::new(0);
    let key = UsageKey::new(channel(42), UsageType::Used);
    let request = CasRequest::new(
        vec![key],
        |snapshot: &[TypedEntry]| -> Result<Vec<CasUpdate>, Infallible> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![CasUpdate {
                key,
                old: snapshot[0].value.clone(),
                new: StoredValue::Usage(record(42, UsageType::Used, 50)),
            }])
        },
    );

    let outcome = engine.execute(request).await.unwrap();

    assert!(!outcome.applied);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rule_failure_is_never_retried() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let engine = engine_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    );
    let calls = AtomicU32::new(0);
    let request = CasRequest::new(
        UsageKey::all_for(channel(1)).to_vec(),
        |_: &[TypedEntry]| -> Result<Vec<CasUpdate>, &'static str> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("refused")
        },
    )
    .retry_until_success_or_error(true);

    let err = engine.execute(request).await.unwrap_err();

    assert!(matches!(err, TransactionError::Update("refused")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.swaps(), 0);
}

#[tokio::test]
async fn test_store_failure_is_propagated_without_retry() {
    let store = Arc::new(FailingStore::new("connection refused"));
    let service = service_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    );

    let err = service
        .update_usage(channel(42), delta(10), "PLANNED")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UsageServiceError::Store {
            usage_type: UsageType::Planned,
            source: StoreError::Backend(ref reason),
            ..
        } if reason == "connection refused"
    ));
    assert_eq!(err.kind(), ErrorKind::Backend);
    assert_eq!(store.calls(), 1);
}

#[tokio::test]
async fn test_empty_update_applies_without_swapping() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let engine = engine_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    );
    let request = CasRequest::new(
        UsageKey::all_for(channel(1)).to_vec(),
        |_: &[TypedEntry]| -> Result<Vec<CasUpdate>, Infallible> { Ok(Vec::new()) },
    );

    let outcome = engine.execute(request).await.unwrap();

    assert!(outcome.applied);
    assert_eq!(store.swaps(), 0);
}

// ============================================================================
// Inconsistent Updates
// ============================================================================

#[tokio::test]
async fn test_update_of_an_unread_key_is_refused() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let engine = engine_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    );
    let planned = UsageKey::new(channel(1), UsageType::Planned);
    let request = CasRequest::new(
        vec![UsageKey::new(channel(1), UsageType::Used)],
        |_: &[TypedEntry]| -> Result<Vec<CasUpdate>, Infallible> {
            Ok(vec![CasUpdate {
                key: planned,
                old: None,
                new: StoredValue::Usage(record(1, UsageType::Planned, 1)),
            }])
        },
    );

    let err = engine.execute(request).await.unwrap_err();

    assert!(matches!(err, TransactionError::UndeclaredKey { key } if key == planned));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_update_from_a_value_other_than_the_one_read_is_refused() {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let engine = engine_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    );
    let used = UsageKey::new(channel(1), UsageType::Used);
    let request = CasRequest::new(
        vec![used],
        |_: &[TypedEntry]| -> Result<Vec<CasUpdate>, Infallible> {
            Ok(vec![CasUpdate {
                key: used,
                old: Some(StoredValue::Usage(record(1, UsageType::Used, 7))),
                new: StoredValue::Usage(record(1, UsageType::Used, 8)),
            }])
        },
    );

    let err = engine.execute(request).await.unwrap_err();

    assert!(matches!(err, TransactionError::StaleOldValue { key } if key == used));
    assert!(store.is_empty());
}
