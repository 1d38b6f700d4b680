//! Authenticated administrative access to usage data.
//!
//! Operators inspect and correct channel usage remotely. Every call must be
//! signed by the single address configured as `authentication_address`, over
//! a recent block number so that captured signatures expire.
//!
//! The signed message is
//! `method_name ‖ caller_address (20 bytes) ‖ block_number (32 bytes, big-endian)`,
//! hashed with the EIP-191 personal-message prefix.

use crate::metrics::UsageMetrics;
use crate::service::{PrepaidService, UsageServiceError};
use alloy_primitives::{Address, Signature, U256};
use prepaid_usage_core::channel::{AmountDelta, ChannelId};
use prepaid_usage_core::typed_store::UsageRecord;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Method name signed by callers of [`AdminService::list_all_users`].
pub const LIST_ALL_USERS_METHOD: &str = "list_all_users";

/// Method name signed by callers of [`AdminService::update_usage`].
pub const UPDATE_USAGE_METHOD: &str = "update_usage";

/// Authentication failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No valid authentication address is configured.
    #[error(
        "invalid hex address specified/missing for configuration 'authentication_address' ,this is a mandatory configuration required to be set up manually for remote updates"
    )]
    MissingAuthenticationAddress,

    /// The caller's address is not a hex address.
    #[error("{0} is an invalid hex Address")]
    InvalidAddress(String),

    /// The caller is not the configured address.
    #[error("unauthorized access, {0} is not authorized")]
    Unauthorized(String),

    /// The signed block is too far from the current block.
    #[error("authentication failed as the signature passed has expired")]
    Expired,

    /// The signature bytes are malformed or unrecoverable.
    #[error("authentication failed, invalid signature: {0}")]
    InvalidSignature(String),

    /// The message was signed by someone other than the caller.
    #[error("authentication failed, message signed by {recovered} and not by {expected}")]
    SignerMismatch {
        /// Address recovered from the signature.
        recovered: Address,
        /// Address the caller claimed.
        expected: Address,
    },

    /// The current block number could not be read.
    #[error("unable to read the current block number: {0}")]
    BlockNumber(String),
}

/// Errors returned by [`AdminService`].
#[derive(Error, Debug)]
pub enum AdminError {
    /// The caller was not authenticated.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The underlying usage operation failed.
    #[error(transparent)]
    Usage(#[from] UsageServiceError),
}

/// Credentials accompanying an administrative call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerAuthentication {
    /// Hex address of the caller.
    pub user_address: String,
    /// Block number the caller signed over.
    pub current_block: u64,
    /// 65-byte `r ‖ s ‖ v` signature of [`signed_message`].
    pub signature: Vec<u8>,
}

/// Source of the chain's current block number.
pub trait BlockNumberSource: Send + Sync {
    /// The latest block number.
    fn current_block(&self) -> Pin<Box<dyn Future<Output = Result<u64, AuthError>> + Send + '_>>;
}

/// The message a caller signs to invoke `method`.
#[must_use]
pub fn signed_message(method: &str, caller: Address, block: u64) -> Vec<u8> {
    let mut message = Vec::with_capacity(method.len() + 20 + 32);
    message.extend_from_slice(method.as_bytes());
    message.extend_from_slice(caller.as_slice());
    message.extend_from_slice(&U256::from(block).to_be_bytes::<32>());
    message
}

/// Gatekeeper in front of [`PrepaidService`] for remote operators.
pub struct AdminService {
    service: Arc<PrepaidService>,
    authentication_address: Option<Address>,
    blocks: Arc<dyn BlockNumberSource>,
    allowed_block_difference: u64,
}

impl AdminService {
    /// Create the gate.
    ///
    /// An `authentication_address` that is not a hex address leaves the gate
    /// closed: every call fails with
    /// [`AuthError::MissingAuthenticationAddress`].
    #[must_use]
    pub fn new(
        service: Arc<PrepaidService>,
        authentication_address: &str,
        blocks: Arc<dyn BlockNumberSource>,
        allowed_block_difference: u64,
    ) -> Self {
        let authentication_address = authentication_address.trim().parse::<Address>().ok();
        if authentication_address.is_none() {
            tracing::warn!("No valid authentication address configured, administrative calls are disabled");
        }
        Self {
            service,
            authentication_address,
            blocks,
            allowed_block_difference,
        }
    }

    /// The configured authentication address, checksummed.
    #[must_use]
    pub fn authentication_address(&self) -> Option<String> {
        self.authentication_address
            .map(|address| address.to_checksum(None))
    }

    /// Check that `caller` is the configured authentication address.
    ///
    /// # Errors
    ///
    /// See [`AuthError::MissingAuthenticationAddress`],
    /// [`AuthError::InvalidAddress`] and [`AuthError::Unauthorized`].
    pub fn check_authentication_address(&self, caller: &str) -> Result<Address, AuthError> {
        let configured = self
            .authentication_address
            .ok_or(AuthError::MissingAuthenticationAddress)?;
        let caller_address = caller
            .parse::<Address>()
            .map_err(|_| AuthError::InvalidAddress(caller.to_string()))?;
        if caller_address != configured {
            return Err(AuthError::Unauthorized(caller.to_string()));
        }
        Ok(caller_address)
    }

    /// Authenticate a call to `method`.
    ///
    /// # Errors
    ///
    /// Returns the first [`AuthError`] among: address check, block freshness,
    /// signature recovery.
    pub async fn authenticate(
        &self,
        method: &str,
        auth: &CallerAuthentication,
    ) -> Result<(), AuthError> {
        let result = self.verify(method, auth).await;
        if let Err(err) = &result {
            UsageMetrics::record_auth_failure();
            tracing::warn!(method, caller = %auth.user_address, error = %err, "Administrative call refused");
        }
        result
    }

    async fn verify(&self, method: &str, auth: &CallerAuthentication) -> Result<(), AuthError> {
        let caller = self.check_authentication_address(&auth.user_address)?;

        let current = self.blocks.current_block().await?;
        if current.abs_diff(auth.current_block) > self.allowed_block_difference {
            return Err(AuthError::Expired);
        }

        let signature = Signature::try_from(auth.signature.as_slice())
            .map_err(|err| AuthError::InvalidSignature(err.to_string()))?;
        let recovered = signature
            .recover_address_from_msg(signed_message(method, caller, auth.current_block))
            .map_err(|err| AuthError::InvalidSignature(err.to_string()))?;
        if recovered != caller {
            return Err(AuthError::SignerMismatch {
                recovered,
                expected: caller,
            });
        }
        Ok(())
    }

    /// Every counter record, for an authenticated caller.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Auth`] if authentication fails, otherwise the
    /// errors of [`PrepaidService::list_all_users`].
    pub async fn list_all_users(
        &self,
        auth: &CallerAuthentication,
    ) -> Result<Vec<UsageRecord>, AdminError> {
        self.authenticate(LIST_ALL_USERS_METHOD, auth).await?;
        Ok(self.service.list_all_users().await?)
    }

    /// Apply a usage update on behalf of an authenticated caller.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Auth`] if authentication fails, otherwise the
    /// errors of [`PrepaidService::update_usage`].
    pub async fn update_usage(
        &self,
        auth: &CallerAuthentication,
        channel_id: ChannelId,
        amount: AmountDelta,
        update_usage_type: &str,
    ) -> Result<(), AdminError> {
        self.authenticate(UPDATE_USAGE_METHOD, auth).await?;
        tracing::info!(caller = %auth.user_address, %channel_id, update_usage_type, "Administrative usage update");
        Ok(self
            .service
            .update_usage(channel_id, amount, update_usage_type)
            .await?)
    }
}
