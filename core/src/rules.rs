//! Usage accounting rules.
//!
//! Each rule owns one counter of a channel. It reads the aggregated view of
//! all three counters to check cross-counter invariants, then proposes a new
//! value for its own counter only:
//!
//! | Rule | Counter | Invariant |
//! |------|---------|-----------|
//! | [`IncrementUsed`] | `USED` | `used <= planned + refunded` |
//! | [`IncrementPlanned`] | `PLANNED` | planned never decreases |
//! | [`IncrementRefund`] | `REFUND` | non-negative |
//!
//! Rules are pure. [`plan_update`] turns a rule's verdict into the single
//! [`CasUpdate`] handed to the transaction engine; every rule receives its
//! input through that one function.

use crate::channel::{AmountDelta, ChannelId, UsageKey, UsageType};
use crate::typed_store::{CasUpdate, StoredValue, TypedEntry};
use crate::usage::{AggregatedUsage, UsageError};
use std::fmt;
use std::sync::Arc;

/// A strategy computing the next state of one channel counter.
pub trait UsageRule: Send + Sync + fmt::Debug {
    /// The counter this rule is authoritative over.
    fn usage_type(&self) -> UsageType;

    /// Compute the view after applying `delta`.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] when the new state would break the rule's
    /// invariant.
    fn apply(
        &self,
        current: &AggregatedUsage,
        delta: AmountDelta,
    ) -> Result<AggregatedUsage, UsageError>;
}

/// Adds to the used amount, refusing to exceed planned + refunded.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementUsed;

impl UsageRule for IncrementUsed {
    fn usage_type(&self) -> UsageType {
        UsageType::Used
    }

    fn apply(
        &self,
        current: &AggregatedUsage,
        delta: AmountDelta,
    ) -> Result<AggregatedUsage, UsageError> {
        let next = current.adjusted(UsageType::Used, delta)?;
        let exceeded = current
            .planned_amount
            .checked_add(current.failed_amount)
            .is_some_and(|allowance| next.used_amount > allowance);
        if exceeded {
            return Err(UsageError::UsageExceeded {
                channel_id: current.channel_id,
                used: next.used_amount,
                planned: current.planned_amount,
                failed: current.failed_amount,
            });
        }
        Ok(next)
    }
}

/// Raises the planned amount; a revision may never lower it.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementPlanned;

impl UsageRule for IncrementPlanned {
    fn usage_type(&self) -> UsageType {
        UsageType::Planned
    }

    fn apply(
        &self,
        current: &AggregatedUsage,
        delta: AmountDelta,
    ) -> Result<AggregatedUsage, UsageError> {
        let decrease = UsageError::PlannedAmountDecrease {
            channel_id: current.channel_id,
            current: current.planned_amount,
            delta,
        };
        if delta.is_negative() {
            return Err(decrease);
        }
        let next = current.adjusted(UsageType::Planned, delta)?;
        if next.planned_amount < current.planned_amount {
            return Err(decrease);
        }
        Ok(next)
    }
}

/// Adds to the refunded (failed) amount.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementRefund;

impl UsageRule for IncrementRefund {
    fn usage_type(&self) -> UsageType {
        UsageType::Refund
    }

    fn apply(
        &self,
        current: &AggregatedUsage,
        delta: AmountDelta,
    ) -> Result<AggregatedUsage, UsageError> {
        current.adjusted(UsageType::Refund, delta)
    }
}

/// Evaluate `rule` against the entries read for `channel_id`.
///
/// Returns exactly one update: the old and new record of the rule's own
/// counter.
///
/// # Errors
///
/// Propagates reconstruction and rule failures.
pub fn plan_update(
    rule: &dyn UsageRule,
    channel_id: ChannelId,
    snapshot: &[TypedEntry],
    delta: AmountDelta,
) -> Result<Vec<CasUpdate>, UsageError> {
    let current = AggregatedUsage::reconstruct(channel_id, snapshot)?;
    let next = rule.apply(&current, delta)?;

    let usage_type = rule.usage_type();
    let key = UsageKey::new(channel_id, usage_type);
    let old = snapshot
        .iter()
        .find(|entry| entry.key == key)
        .and_then(|entry| entry.value.clone());

    Ok(vec![CasUpdate {
        key,
        old,
        new: StoredValue::Usage(next.record(usage_type)),
    }])
}

/// Immutable table mapping each usage type to its rule.
///
/// Built once and handed to the service that uses it.
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    rules: [Arc<dyn UsageRule>; 3],
}

impl RuleRegistry {
    /// The standard USED / PLANNED / REFUND rules.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            rules: [
                Arc::new(IncrementUsed),
                Arc::new(IncrementPlanned),
                Arc::new(IncrementRefund),
            ],
        }
    }

    /// Replace the rule for the usage type `rule` is authoritative over.
    #[must_use]
    pub fn with_rule(mut self, rule: Arc<dyn UsageRule>) -> Self {
        let index = rule.usage_type().index();
        self.rules[index] = rule;
        self
    }

    /// The rule responsible for `usage_type`.
    #[must_use]
    pub fn rule(&self, usage_type: UsageType) -> &dyn UsageRule {
        self.rules[usage_type.index()].as_ref()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
