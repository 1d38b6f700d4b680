//! In-memory collaborators.
//!
//! - [`InMemoryKeyValueStore`]: a conditional-swap store backed by a map
//! - [`ConflictInjectingStore`]: loses races on purpose
//! - [`FailingStore`]: a store whose backend is down
//! - [`FixedGroupId`] / [`FixedBlockNumber`]: deterministic chain data

use alloy_primitives::B256;
use prepaid_usage_core::metadata::{GroupIdSource, MetadataError};
use prepaid_usage_core::typed_store::{
    KeyCondition, KeyValueStore, KeyWrite, StoreError, StoreFuture, StoredValue, UsageRecord,
};
use prepaid_usage_runtime::admin::{AuthError, BlockNumberSource};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Key-value store held in memory.
///
/// Conditional swaps are atomic under a single mutex, which gives the same
/// all-or-nothing semantics a clustered store provides. Every call is
/// counted so tests can assert which operations touched the store.
///
/// # Example
///
/// ```
/// use prepaid_usage_testing::mocks::InMemoryKeyValueStore;
///
/// let store = InMemoryKeyValueStore::new();
/// store.insert_raw("42/USED", "{}");
/// assert_eq!(store.raw("42/USED").as_deref(), Some("{}"));
/// assert_eq!(store.calls(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, String>>,
    reads: AtomicUsize,
    swaps: AtomicUsize,
}

impl InMemoryKeyValueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` under `key`, bypassing conditions and counters.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries().insert(key.into(), value.into());
    }

    /// Write `record` under its own key, encoded the way the typed store
    /// encodes it, bypassing conditions and counters.
    ///
    /// # Panics
    ///
    /// Panics if the record cannot be serialized, which cannot happen for
    /// the plain data it holds.
    #[allow(clippy::expect_used)]
    pub fn put_record(&self, record: &UsageRecord) {
        let value = serde_json::to_string(&StoredValue::Usage(record.clone()))
            .expect("usage records always serialize");
        self.insert_raw(record.key().to_string(), value);
    }

    /// Raw value under `key`.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    /// Number of keys stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the store holds no key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Number of `get` and `get_all` calls served.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `compare_and_swap` calls served.
    #[must_use]
    pub fn swaps(&self) -> usize {
        self.swaps.load(Ordering::SeqCst)
    }

    /// Number of calls of any kind served.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.reads() + self.swaps()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: String) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries().get(&key).cloned())
        })
    }

    fn get_all(&self) -> StoreFuture<'_, Vec<(String, String)>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .entries()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect())
        })
    }

    fn compare_and_swap(
        &self,
        conditions: Vec<KeyCondition>,
        writes: Vec<KeyWrite>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.swaps.fetch_add(1, Ordering::SeqCst);
            let mut entries = self.entries();
            let holds = conditions
                .iter()
                .all(|condition| entries.get(&condition.key) == condition.expected.as_ref());
            if !holds {
                return Ok(false);
            }
            for write in writes {
                entries.insert(write.key, write.value);
            }
            Ok(true)
        })
    }
}

type Interference = Box<dyn Fn(&InMemoryKeyValueStore, usize) + Send + Sync>;

/// Store that lets a competing writer in just before a conditional swap.
///
/// Before each of the first `conflicts` swaps, `interfere` runs against the
/// inner store with the injection number (starting at 0). An interference
/// that changes one of the transaction's keys makes that swap fail.
pub struct ConflictInjectingStore {
    inner: Arc<InMemoryKeyValueStore>,
    remaining: AtomicUsize,
    injected: AtomicUsize,
    interfere: Interference,
}

impl ConflictInjectingStore {
    /// Inject `conflicts` interferences.
    pub fn new<F>(inner: Arc<InMemoryKeyValueStore>, conflicts: usize, interfere: F) -> Self
    where
        F: Fn(&InMemoryKeyValueStore, usize) + Send + Sync + 'static,
    {
        Self {
            inner,
            remaining: AtomicUsize::new(conflicts),
            injected: AtomicUsize::new(0),
            interfere: Box::new(interfere),
        }
    }

    /// Interfere before every swap.
    pub fn always<F>(inner: Arc<InMemoryKeyValueStore>, interfere: F) -> Self
    where
        F: Fn(&InMemoryKeyValueStore, usize) + Send + Sync + 'static,
    {
        Self::new(inner, usize::MAX, interfere)
    }

    /// Number of interferences run so far.
    #[must_use]
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    /// The store interferences write to.
    #[must_use]
    pub fn inner(&self) -> &Arc<InMemoryKeyValueStore> {
        &self.inner
    }
}

impl std::fmt::Debug for ConflictInjectingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictInjectingStore")
            .field("remaining", &self.remaining)
            .field("injected", &self.injected)
            .finish_non_exhaustive()
    }
}

impl KeyValueStore for ConflictInjectingStore {
    fn get(&self, key: String) -> StoreFuture<'_, Option<String>> {
        self.inner.get(key)
    }

    fn get_all(&self) -> StoreFuture<'_, Vec<(String, String)>> {
        self.inner.get_all()
    }

    fn compare_and_swap(
        &self,
        conditions: Vec<KeyCondition>,
        writes: Vec<KeyWrite>,
    ) -> StoreFuture<'_, bool> {
        let inject = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if inject {
            let number = self.injected.fetch_add(1, Ordering::SeqCst);
            (self.interfere)(&self.inner, number);
        }
        self.inner.compare_and_swap(conditions, writes)
    }
}

/// Store whose every call fails with a backend error.
#[derive(Debug)]
pub struct FailingStore {
    reason: String,
    calls: AtomicUsize,
}

impl FailingStore {
    /// Fail every call with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of calls attempted.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T: Send + 'static>(&self) -> StoreFuture<'_, T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let err = StoreError::Backend(self.reason.clone());
        Box::pin(async move { Err(err) })
    }
}

impl KeyValueStore for FailingStore {
    fn get(&self, _key: String) -> StoreFuture<'_, Option<String>> {
        self.fail()
    }

    fn get_all(&self) -> StoreFuture<'_, Vec<(String, String)>> {
        self.fail()
    }

    fn compare_and_swap(
        &self,
        _conditions: Vec<KeyCondition>,
        _writes: Vec<KeyWrite>,
    ) -> StoreFuture<'_, bool> {
        self.fail()
    }
}

/// Group id known up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedGroupId(pub B256);

impl GroupIdSource for FixedGroupId {
    fn group_id(&self) -> Result<B256, MetadataError> {
        Ok(self.0)
    }
}

/// Chain head that only moves when a test moves it.
#[derive(Debug, Default)]
pub struct FixedBlockNumber(AtomicU64);

impl FixedBlockNumber {
    /// Chain head at `block`.
    #[must_use]
    pub const fn new(block: u64) -> Self {
        Self(AtomicU64::new(block))
    }

    /// Move the chain head to `block`.
    pub fn set(&self, block: u64) {
        self.0.store(block, Ordering::SeqCst);
    }
}

impl BlockNumberSource for FixedBlockNumber {
    fn current_block(&self) -> Pin<Box<dyn Future<Output = Result<u64, AuthError>> + Send + '_>> {
        let block = self.0.load(Ordering::SeqCst);
        Box::pin(async move { Ok(block) })
    }
}
