//! Usage update service.
//!
//! [`PrepaidService`] resolves the accounting rule for an update, runs it as
//! one compare-and-swap transaction over the channel's three counters, and
//! reports the outcome.

use crate::metrics::UsageMetrics;
use crate::retry::RetryPolicy;
use crate::transaction::{CasEngine, CasRequest, TransactionError};
use alloy_primitives::B256;
use prepaid_usage_core::channel::{AmountDelta, ChannelId, UsageKey, UsageType};
use prepaid_usage_core::metadata::{GroupIdSource, MetadataError};
use prepaid_usage_core::rules::{RuleRegistry, plan_update};
use prepaid_usage_core::typed_store::{StoreError, TypedEntry, TypedStore, UsageRecord};
use prepaid_usage_core::usage::{AggregatedUsage, UsageError};
use thiserror::Error;

/// Broad classes of [`UsageServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is invalid; retrying it cannot succeed.
    Input,
    /// The request breaks an accounting invariant against the current state.
    InvariantViolation,
    /// The update could not win the race against concurrent writers.
    Conflict,
    /// The store failed.
    Backend,
    /// Stored records are undecodable or contradict each other.
    CorruptState,
    /// The service produced an inconsistent transaction.
    Internal,
}

/// Errors returned by [`PrepaidService`].
#[derive(Error, Debug)]
pub enum UsageServiceError {
    /// The update type is not `USED`, `PLANNED` or `REFUND`.
    #[error("unknown update type {usage_type} on channel {channel_id}")]
    UnknownUsageType {
        /// Channel of the request.
        channel_id: ChannelId,
        /// The unrecognised type name.
        usage_type: String,
    },

    /// The amount is not acceptable for the update type.
    #[error("invalid amount {amount} for usage type {usage_type} on channel {channel_id}: {reason}")]
    InvalidAmount {
        /// Channel of the request.
        channel_id: ChannelId,
        /// Requested usage type.
        usage_type: UsageType,
        /// Requested amount.
        amount: AmountDelta,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// An accounting rule rejected the update.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The store failed while applying an update.
    #[error("{usage_type} update on channel {channel_id} failed: {source}")]
    Store {
        /// Channel of the request.
        channel_id: ChannelId,
        /// Requested usage type.
        usage_type: UsageType,
        /// The store's error, unchanged.
        #[source]
        source: StoreError,
    },

    /// The store failed during a read outside any update.
    #[error(transparent)]
    Read(#[from] StoreError),

    /// The update never won the race against concurrent writers.
    #[error(
        "transaction for usage type {usage_type} on channel {channel_id} was not applied after {attempts} attempts"
    )]
    NotApplied {
        /// Channel of the request.
        channel_id: ChannelId,
        /// Requested usage type.
        usage_type: UsageType,
        /// Attempts made.
        attempts: u32,
    },

    /// The transaction built for the update was inconsistent.
    #[error("inconsistent transaction: {0}")]
    Inconsistent(String),
}

impl UsageServiceError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownUsageType { .. } | Self::InvalidAmount { .. } => ErrorKind::Input,
            Self::Usage(err) if err.is_corrupt_state() => ErrorKind::CorruptState,
            Self::Usage(_) => ErrorKind::InvariantViolation,
            Self::Store { source: err, .. } | Self::Read(err) if err.is_corrupt_data() => {
                ErrorKind::CorruptState
            }
            Self::Store { .. } | Self::Read(_) => ErrorKind::Backend,
            Self::NotApplied { .. } => ErrorKind::Conflict,
            Self::Inconsistent(_) => ErrorKind::Internal,
        }
    }

    fn from_transaction(
        err: TransactionError<UsageError>,
        channel_id: ChannelId,
        usage_type: UsageType,
    ) -> Self {
        match err {
            TransactionError::Update(err) => Self::Usage(err),
            TransactionError::Store(source) => Self::Store {
                channel_id,
                usage_type,
                source,
            },
            other @ (TransactionError::UndeclaredKey { .. }
            | TransactionError::StaleOldValue { .. }) => Self::Inconsistent(other.to_string()),
        }
    }
}

/// Applies usage updates to payment channels.
///
/// Holds no channel state of its own: every call reads the store, and
/// concurrent calls (from this or other processes) are serialised per
/// channel by the store's conditional swap.
#[derive(Debug, Clone)]
pub struct PrepaidService {
    engine: CasEngine,
    rules: RuleRegistry,
    group_id: B256,
}

impl PrepaidService {
    /// Create a service for the group named by `group`.
    ///
    /// # Errors
    ///
    /// Returns the [`MetadataError`] of `group` if the group id cannot be
    /// read; this is a startup failure.
    pub fn new(
        store: TypedStore,
        rules: RuleRegistry,
        policy: RetryPolicy,
        group: &dyn GroupIdSource,
    ) -> Result<Self, MetadataError> {
        let group_id = group.group_id()?;
        tracing::info!(%group_id, max_attempts = ?policy.max_attempts(), "Prepaid usage service ready");
        Ok(Self {
            engine: CasEngine::new(store, policy),
            rules,
            group_id,
        })
    }

    /// Group this service accounts for.
    #[must_use]
    pub const fn group_id(&self) -> B256 {
        self.group_id
    }

    /// Apply `amount` to the `update_usage_type` counter of `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns [`UsageServiceError::UnknownUsageType`] without touching the
    /// store if `update_usage_type` is not a known usage type, and otherwise
    /// the errors of [`PrepaidService::update`].
    pub async fn update_usage(
        &self,
        channel_id: ChannelId,
        amount: AmountDelta,
        update_usage_type: &str,
    ) -> Result<(), UsageServiceError> {
        let usage_type = update_usage_type
            .parse::<UsageType>()
            .map_err(|err| UsageServiceError::UnknownUsageType {
                channel_id,
                usage_type: err.0,
            })?;
        self.update(channel_id, amount, usage_type).await
    }

    /// Apply `amount` to the `usage_type` counter of `channel_id`.
    ///
    /// Negative amounts are only meaningful as planned-amount revisions and
    /// are rejected up front for the other counters.
    ///
    /// # Errors
    ///
    /// - [`UsageServiceError::InvalidAmount`]: negative used/refund amount
    /// - [`UsageServiceError::Usage`]: the accounting rule rejected the update
    /// - [`UsageServiceError::Store`]: the store failed or holds undecodable data
    /// - [`UsageServiceError::NotApplied`]: retries ran out under contention
    pub async fn update(
        &self,
        channel_id: ChannelId,
        amount: AmountDelta,
        usage_type: UsageType,
    ) -> Result<(), UsageServiceError> {
        if amount.is_negative() && usage_type != UsageType::Planned {
            return Err(UsageServiceError::InvalidAmount {
                channel_id,
                usage_type,
                amount,
                reason: "only planned amounts may be revised",
            });
        }

        let rule = self.rules.rule(usage_type);
        let request = CasRequest::new(
            UsageKey::all_for(channel_id).to_vec(),
            |snapshot: &[TypedEntry]| plan_update(rule, channel_id, snapshot, amount),
        )
        .retry_until_success_or_error(true);

        let outcome = match self.engine.execute(request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let err = UsageServiceError::from_transaction(err, channel_id, usage_type);
                if err.kind() == ErrorKind::InvariantViolation {
                    UsageMetrics::record_rejection(usage_type);
                }
                tracing::debug!(%channel_id, %usage_type, %amount, error = %err, "Usage update failed");
                return Err(err);
            }
        };

        if !outcome.applied {
            return Err(UsageServiceError::NotApplied {
                channel_id,
                usage_type,
                attempts: outcome.attempts,
            });
        }

        UsageMetrics::record_update(usage_type);
        tracing::info!(
            %channel_id,
            %usage_type,
            %amount,
            attempts = outcome.attempts,
            "Usage updated"
        );
        Ok(())
    }

    /// Current aggregated view of `channel_id`.
    ///
    /// A point-in-time read; counters may change as soon as it returns.
    ///
    /// # Errors
    ///
    /// Propagates store and reconstruction failures.
    pub async fn usage(&self, channel_id: ChannelId) -> Result<AggregatedUsage, UsageServiceError> {
        let entries = self
            .engine
            .store()
            .get_many(&UsageKey::all_for(channel_id))
            .await?;
        Ok(AggregatedUsage::reconstruct(channel_id, &entries)?)
    }

    /// Every counter record in the store.
    ///
    /// Each record is read at some point during the call; the list is not a
    /// consistent snapshot across channels or counters.
    ///
    /// # Errors
    ///
    /// Propagates store and decoding failures.
    pub async fn list_all_users(&self) -> Result<Vec<UsageRecord>, UsageServiceError> {
        let records = self
            .engine
            .store()
            .get_all()
            .await?
            .into_iter()
            .map(|(_, value)| value.into_usage())
            .collect();
        Ok(records)
    }
}
