//! Aggregated per-channel usage view.
//!
//! The three counters of a channel are stored under independent keys.
//! [`AggregatedUsage::reconstruct`] folds whatever records currently exist
//! back into one in-memory view on which the accounting rules are evaluated.

use crate::channel::{Amount, AmountDelta, ChannelId, UsageKey, UsageType};
use crate::typed_store::{TypedEntry, UsageRecord};
use thiserror::Error;

/// Business-rule and reconstruction failures.
///
/// None of these are retried: re-reading the store cannot change a logical
/// outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// Incrementing the used amount would exceed planned + refunded.
    #[error(
        "usage exceeded on channel {channel_id}: used amount {used} is more than planned {planned} plus refunded {failed}"
    )]
    UsageExceeded {
        /// Channel being updated.
        channel_id: ChannelId,
        /// Used amount the update would have produced.
        used: Amount,
        /// Planned amount at the time of the update.
        planned: Amount,
        /// Refunded amount at the time of the update.
        failed: Amount,
    },

    /// A planned-amount revision would lower the recorded planned amount.
    #[error(
        "a revised higher planned amount has been signed already for {current} on channel {channel_id}, revision by {delta} rejected"
    )]
    PlannedAmountDecrease {
        /// Channel being updated.
        channel_id: ChannelId,
        /// Planned amount already recorded.
        current: Amount,
        /// Requested change.
        delta: AmountDelta,
    },

    /// The update would take a counter below zero.
    #[error("{usage_type} amount {current} on channel {channel_id} cannot change by {delta}: amounts must stay non-negative")]
    NegativeAmount {
        /// Channel being updated.
        channel_id: ChannelId,
        /// Counter being updated.
        usage_type: UsageType,
        /// Current amount.
        current: Amount,
        /// Requested change.
        delta: AmountDelta,
    },

    /// The update would overflow a 256-bit counter.
    #[error("{usage_type} amount on channel {channel_id} overflows")]
    AmountOverflow {
        /// Channel being updated.
        channel_id: ChannelId,
        /// Counter being updated.
        usage_type: UsageType,
    },

    /// A record read for one channel belongs to another.
    #[error("record stored under channel {expected} belongs to channel {found}")]
    ChannelMismatch {
        /// Channel being reconstructed.
        expected: ChannelId,
        /// Channel named by the record.
        found: ChannelId,
    },

    /// A record's usage type disagrees with the key it is stored under.
    #[error("record stored under {key} carries usage type {found}")]
    RecordKeyMismatch {
        /// Key the record was read from.
        key: UsageKey,
        /// Usage type named by the record.
        found: UsageType,
    },

    /// More than one record was supplied for the same counter.
    #[error("more than one {usage_type} record for channel {channel_id}")]
    DuplicateUsageType {
        /// Channel being reconstructed.
        channel_id: ChannelId,
        /// Counter that appeared twice.
        usage_type: UsageType,
    },
}

impl UsageError {
    /// Whether the error comes from stored records that contradict each
    /// other or their keys, rather than from the requested update.
    #[must_use]
    pub const fn is_corrupt_state(&self) -> bool {
        matches!(
            self,
            Self::ChannelMismatch { .. }
                | Self::RecordKeyMismatch { .. }
                | Self::DuplicateUsageType { .. }
        )
    }
}

/// In-memory view of one channel's three counters.
///
/// Never persisted as a whole; only its per-type projections are stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatedUsage {
    /// Channel the view describes.
    pub channel_id: ChannelId,
    /// Amount the client has signed for.
    pub planned_amount: Amount,
    /// Amount consumed.
    pub used_amount: Amount,
    /// Amount refunded for failed requests.
    pub failed_amount: Amount,
    /// Counter changed by the operation that produced this view, if any.
    pub update_usage_type: Option<UsageType>,
}

impl AggregatedUsage {
    /// A channel with no records: every amount is zero.
    #[must_use]
    pub const fn empty(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            planned_amount: Amount::ZERO,
            used_amount: Amount::ZERO,
            failed_amount: Amount::ZERO,
            update_usage_type: None,
        }
    }

    /// Rebuild the view of `channel_id` from the entries read for it.
    ///
    /// Absent entries count as zero.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ChannelMismatch`], [`UsageError::RecordKeyMismatch`]
    /// or [`UsageError::DuplicateUsageType`] when the entries are not a
    /// consistent set of records for this channel.
    pub fn reconstruct(channel_id: ChannelId, entries: &[TypedEntry]) -> Result<Self, UsageError> {
        let mut view = Self::empty(channel_id);
        let mut seen = [false; 3];
        for entry in entries {
            if entry.key.channel_id != channel_id {
                return Err(UsageError::ChannelMismatch {
                    expected: channel_id,
                    found: entry.key.channel_id,
                });
            }
            let slot = &mut seen[entry.key.usage_type.index()];
            if *slot {
                return Err(UsageError::DuplicateUsageType {
                    channel_id,
                    usage_type: entry.key.usage_type,
                });
            }
            *slot = true;

            if let Some(value) = &entry.value {
                view.fold(entry.key, value.as_usage())?;
            }
        }
        Ok(view)
    }

    fn fold(&mut self, key: UsageKey, record: &UsageRecord) -> Result<(), UsageError> {
        if record.channel_id != self.channel_id {
            return Err(UsageError::ChannelMismatch {
                expected: self.channel_id,
                found: record.channel_id,
            });
        }
        if record.usage_type != key.usage_type {
            return Err(UsageError::RecordKeyMismatch {
                key,
                found: record.usage_type,
            });
        }
        *self.amount_mut(record.usage_type) = record.amount;
        Ok(())
    }

    /// The amount of one counter.
    #[must_use]
    pub const fn amount_for(&self, usage_type: UsageType) -> Amount {
        match usage_type {
            UsageType::Used => self.used_amount,
            UsageType::Planned => self.planned_amount,
            UsageType::Refund => self.failed_amount,
        }
    }

    fn amount_mut(&mut self, usage_type: UsageType) -> &mut Amount {
        match usage_type {
            UsageType::Used => &mut self.used_amount,
            UsageType::Planned => &mut self.planned_amount,
            UsageType::Refund => &mut self.failed_amount,
        }
    }

    /// Copy of this view with `delta` applied to one counter.
    ///
    /// The returned view records `usage_type` as its update type.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::NegativeAmount`] if the counter would drop below
    /// zero and [`UsageError::AmountOverflow`] if it would overflow.
    pub fn adjusted(&self, usage_type: UsageType, delta: AmountDelta) -> Result<Self, UsageError> {
        let current = self.amount_for(usage_type);
        let magnitude = delta.unsigned_abs();
        let next = if delta.is_negative() {
            current
                .checked_sub(magnitude)
                .ok_or(UsageError::NegativeAmount {
                    channel_id: self.channel_id,
                    usage_type,
                    current,
                    delta,
                })?
        } else {
            current
                .checked_add(magnitude)
                .ok_or(UsageError::AmountOverflow {
                    channel_id: self.channel_id,
                    usage_type,
                })?
        };

        let mut view = self.clone();
        *view.amount_mut(usage_type) = next;
        view.update_usage_type = Some(usage_type);
        Ok(view)
    }

    /// The record persisted for one counter of this view.
    #[must_use]
    pub const fn record(&self, usage_type: UsageType) -> UsageRecord {
        UsageRecord {
            channel_id: self.channel_id,
            usage_type,
            amount: self.amount_for(usage_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed_store::StoredValue;

    fn entry(channel: u64, usage_type: UsageType, amount: u64) -> TypedEntry {
        let channel_id = ChannelId::from(channel);
        TypedEntry::present(
            UsageKey::new(channel_id, usage_type),
            StoredValue::Usage(UsageRecord {
                channel_id,
                usage_type,
                amount: Amount::from(amount),
            }),
        )
        .unwrap()
    }

    fn delta(value: i64) -> AmountDelta {
        value.to_string().parse().unwrap()
    }

    #[test]
    fn no_records_reconstruct_to_zero() {
        let channel = ChannelId::from(9);
        let view = AggregatedUsage::reconstruct(channel, &[]).unwrap();
        assert_eq!(view, AggregatedUsage::empty(channel));
    }

    #[test]
    fn absent_entries_count_as_zero() {
        let channel = ChannelId::from(9);
        let entries = [
            TypedEntry::absent(UsageKey::new(channel, UsageType::Used)),
            entry(9, UsageType::Planned, 100),
            TypedEntry::absent(UsageKey::new(channel, UsageType::Refund)),
        ];
        let view = AggregatedUsage::reconstruct(channel, &entries).unwrap();
        assert_eq!(view.planned_amount, Amount::from(100u64));
        assert_eq!(view.used_amount, Amount::ZERO);
        assert_eq!(view.failed_amount, Amount::ZERO);
        assert_eq!(view.update_usage_type, None);
    }

    #[test]
    fn records_fold_into_matching_fields_in_any_order() {
        let entries = [
            entry(3, UsageType::Refund, 7),
            entry(3, UsageType::Used, 5),
            entry(3, UsageType::Planned, 20),
        ];
        let view = AggregatedUsage::reconstruct(ChannelId::from(3), &entries).unwrap();
        assert_eq!(view.used_amount, Amount::from(5u64));
        assert_eq!(view.planned_amount, Amount::from(20u64));
        assert_eq!(view.failed_amount, Amount::from(7u64));
    }

    #[test]
    fn records_from_another_channel_are_rejected() {
        let err = AggregatedUsage::reconstruct(ChannelId::from(1), &[entry(2, UsageType::Used, 1)])
            .unwrap_err();
        assert_eq!(
            err,
            UsageError::ChannelMismatch {
                expected: ChannelId::from(1),
                found: ChannelId::from(2),
            }
        );
    }

    #[test]
    fn record_with_wrong_usage_type_for_its_key_is_rejected() {
        let channel = ChannelId::from(1);
        let key = UsageKey::new(channel, UsageType::Used);
        let misplaced = TypedEntry::present(
            key,
            StoredValue::Usage(UsageRecord {
                channel_id: channel,
                usage_type: UsageType::Planned,
                amount: Amount::from(1u64),
            }),
        )
        .unwrap();
        assert_eq!(
            AggregatedUsage::reconstruct(channel, &[misplaced]).unwrap_err(),
            UsageError::RecordKeyMismatch {
                key,
                found: UsageType::Planned,
            }
        );
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let entries = [entry(1, UsageType::Used, 1), entry(1, UsageType::Used, 2)];
        assert!(matches!(
            AggregatedUsage::reconstruct(ChannelId::from(1), &entries),
            Err(UsageError::DuplicateUsageType {
                usage_type: UsageType::Used,
                ..
            })
        ));
    }

    #[test]
    fn only_reconstruction_failures_are_corrupt_state() {
        let channel = ChannelId::from(1);
        let corrupt = AggregatedUsage::reconstruct(channel, &[entry(2, UsageType::Used, 1)])
            .unwrap_err();
        assert!(corrupt.is_corrupt_state());

        let rejected = AggregatedUsage::empty(channel)
            .adjusted(UsageType::Used, delta(-1))
            .unwrap_err();
        assert!(!rejected.is_corrupt_state());
    }

    #[test]
    fn adjusted_marks_the_update_type() {
        let view = AggregatedUsage::empty(ChannelId::from(1));
        let next = view.adjusted(UsageType::Refund, delta(15)).unwrap();
        assert_eq!(next.failed_amount, Amount::from(15u64));
        assert_eq!(next.update_usage_type, Some(UsageType::Refund));
        assert_eq!(view.failed_amount, Amount::ZERO);
    }

    #[test]
    fn adjusted_refuses_to_go_negative() {
        let view = AggregatedUsage::empty(ChannelId::from(1));
        assert!(matches!(
            view.adjusted(UsageType::Used, delta(-1)),
            Err(UsageError::NegativeAmount { .. })
        ));
    }

    #[test]
    fn adjusted_refuses_to_overflow() {
        let mut view = AggregatedUsage::empty(ChannelId::from(1));
        view.planned_amount = Amount::MAX;
        assert_eq!(
            view.adjusted(UsageType::Planned, delta(1)).unwrap_err(),
            UsageError::AmountOverflow {
                channel_id: ChannelId::from(1),
                usage_type: UsageType::Planned,
            }
        );
    }
}
