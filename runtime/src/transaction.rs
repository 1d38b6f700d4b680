//! Compare-and-swap transaction engine.
//!
//! A transaction reads a fixed set of keys, asks an update function for the
//! new values, and writes them only if none of the keys changed since the
//! read. No lock is ever taken; the conditional swap of the store is the only
//! synchronisation.
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌────────────────────┐
//! │ read all │──▶│ update(..) │──▶│ swap if unchanged  │──▶ applied
//! └──────────┘   └────────────┘   └────────────────────┘
//!      ▲               │ Err                │ lost race
//!      │               ▼                    ▼
//!      │            aborted         retry allowed? ──no──▶ not applied
//!      └──────────── backoff ◀──────────yes─┘
//! ```

use crate::metrics::TransactionMetrics;
use crate::retry::RetryPolicy;
use prepaid_usage_core::channel::UsageKey;
use prepaid_usage_core::typed_store::{CasUpdate, StoreError, TypedEntry, TypedStore};
use std::time::Instant;
use thiserror::Error;

/// Errors that end a transaction.
///
/// A lost race is not an error: it is retried or reported through
/// [`TransactionOutcome::applied`].
#[derive(Error, Debug)]
pub enum TransactionError<E> {
    /// The update function refused the current state.
    #[error(transparent)]
    Update(E),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The update function wrote a key the transaction never read.
    #[error("update writes {key}, which is not one of the transaction's keys")]
    UndeclaredKey {
        /// The offending key.
        key: UsageKey,
    },

    /// The update function's old value is not the one that was read.
    #[error("update of {key} was computed from a value other than the one read")]
    StaleOldValue {
        /// The offending key.
        key: UsageKey,
    },
}

/// A transaction over a fixed set of keys.
pub struct CasRequest<F> {
    keys: Vec<UsageKey>,
    update: F,
    retry_until_success_or_error: bool,
}

impl<F> CasRequest<F> {
    /// Create a request reading `keys` and computing updates with `update`.
    ///
    /// `update` receives one entry per key, in the order of `keys`, and
    /// returns the `(old, new)` pairs to write. By default a lost race is
    /// reported, not retried.
    pub fn new<E>(keys: Vec<UsageKey>, update: F) -> Self
    where
        F: FnMut(&[TypedEntry]) -> Result<Vec<CasUpdate>, E>,
    {
        Self {
            keys,
            update,
            retry_until_success_or_error: false,
        }
    }

    /// Retry lost races until the update applies, fails, or the engine's
    /// retry policy runs out of attempts.
    #[must_use]
    pub const fn retry_until_success_or_error(mut self, retry: bool) -> Self {
        self.retry_until_success_or_error = retry;
        self
    }
}

/// Result of a transaction that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOutcome {
    /// Whether the writes were applied.
    pub applied: bool,
    /// Number of read-update-swap attempts made.
    pub attempts: u32,
}

/// Executes [`CasRequest`]s against a [`TypedStore`].
#[derive(Debug, Clone)]
pub struct CasEngine {
    store: TypedStore,
    policy: RetryPolicy,
}

impl CasEngine {
    /// Create an engine retrying lost races according to `policy`.
    #[must_use]
    pub const fn new(store: TypedStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// The store transactions run against.
    #[must_use]
    pub const fn store(&self) -> &TypedStore {
        &self.store
    }

    /// The policy applied to lost races.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `request` to completion.
    ///
    /// All writes of one attempt are applied together or not at all, and
    /// only if every key still holds the value read in that attempt.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::Update`] when the update function fails (never retried)
    /// - [`TransactionError::Store`] when the store fails (never retried)
    /// - [`TransactionError::UndeclaredKey`] / [`TransactionError::StaleOldValue`]
    ///   when the update function returns writes inconsistent with its input
    pub async fn execute<F, E>(
        &self,
        request: CasRequest<F>,
    ) -> Result<TransactionOutcome, TransactionError<E>>
    where
        F: FnMut(&[TypedEntry]) -> Result<Vec<CasUpdate>, E>,
    {
        let CasRequest {
            keys,
            mut update,
            retry_until_success_or_error,
        } = request;
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts = attempts.saturating_add(1);
            TransactionMetrics::record_attempt();

            let snapshot = self.store.get_many(&keys).await?;
            let updates = match update(&snapshot) {
                Ok(updates) => updates,
                Err(err) => {
                    TransactionMetrics::record_aborted();
                    return Err(TransactionError::Update(err));
                }
            };
            check_updates(&snapshot, &updates)?;

            if updates.is_empty() {
                tracing::debug!(attempts, "Transaction has nothing to write");
                return Ok(TransactionOutcome {
                    applied: true,
                    attempts,
                });
            }

            if self.store.compare_and_swap(&snapshot, &updates).await? {
                TransactionMetrics::record_applied(attempts, started.elapsed());
                if attempts > 1 {
                    tracing::debug!(attempts, "Transaction applied after retry");
                }
                return Ok(TransactionOutcome {
                    applied: true,
                    attempts,
                });
            }

            TransactionMetrics::record_conflict();
            if !retry_until_success_or_error {
                tracing::debug!(attempts, "Transaction lost a race, not retrying");
                return Ok(TransactionOutcome {
                    applied: false,
                    attempts,
                });
            }
            if !self.policy.should_retry(attempts) {
                TransactionMetrics::record_exhausted();
                tracing::warn!(attempts, "Transaction ran out of attempts");
                return Ok(TransactionOutcome {
                    applied: false,
                    attempts,
                });
            }

            let delay = self.policy.delay_for_attempt(attempts - 1);
            tracing::debug!(
                attempts,
                delay_us = delay.as_micros(),
                "Transaction lost a race, retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn check_updates<E>(snapshot: &[TypedEntry], updates: &[CasUpdate]) -> Result<(), TransactionError<E>> {
    for update in updates {
        let entry = snapshot
            .iter()
            .find(|entry| entry.key == update.key)
            .ok_or(TransactionError::UndeclaredKey { key: update.key })?;
        if entry.value != update.old {
            return Err(TransactionError::StaleOldValue { key: update.key });
        }
    }
    Ok(())
}
