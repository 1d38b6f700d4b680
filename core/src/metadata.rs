//! Organization metadata: which payment group this daemon accounts for.
//!
//! Organizations publish a JSON document listing their groups. Each group has
//! a base64 encoded 32-byte id, a payment address and the storage cluster
//! channel state lives in. A daemon serves exactly one group, chosen by
//! name in its configuration.
//!
//! Any failure here is a startup failure.

use alloy_primitives::{Address, B256, U256};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading organization metadata.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// The document is not valid metadata JSON.
    #[error("invalid organization metadata: {0}")]
    InvalidJson(String),

    /// No group carries the configured name.
    #[error(
        "group name {0} in config is invalid, there was no group found with this name in the metadata"
    )]
    UnknownGroup(String),

    /// The group id is not base64 or does not decode to 32 bytes.
    #[error("invalid group id {group_id}: {reason}")]
    InvalidGroupId {
        /// The encoded id.
        group_id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The payment address is not a hex address.
    #[error("invalid payment address {0}")]
    InvalidPaymentAddress(String),
}

/// The organization metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationMetadata {
    /// Display name of the organization.
    pub org_name: String,
    /// Registry id of the organization.
    pub org_id: String,
    /// Payment groups.
    pub groups: Vec<GroupMetadata>,
}

/// One payment group as published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    /// Name daemons select the group by.
    pub group_name: String,
    /// Base64 encoded 32-byte group id.
    pub group_id: String,
    /// Payment settings.
    pub payment: PaymentMetadata,
}

/// Payment settings of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    /// Address channels of this group pay to.
    pub payment_address: String,
    /// Blocks before channel expiry after which payments are refused.
    pub payment_expiration_threshold: u64,
    /// Kind of storage holding channel state (e.g. `etcd`).
    pub payment_channel_storage_type: String,
    /// How to reach that storage.
    pub payment_channel_storage_client: StorageClientMetadata,
}

/// Connection settings for the channel storage cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClientMetadata {
    /// Connection timeout, e.g. `"5s"`.
    pub connection_timeout: String,
    /// Request timeout, e.g. `"3s"`.
    pub request_timeout: String,
    /// Cluster endpoints.
    pub endpoints: Vec<String>,
}

/// Source of the group id this daemon accounts for.
pub trait GroupIdSource: Send + Sync {
    /// The configured group id.
    ///
    /// # Errors
    ///
    /// Returns a [`MetadataError`] when the id cannot be determined.
    fn group_id(&self) -> Result<B256, MetadataError>;
}

/// The validated group selected from organization metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    org_name: String,
    group_name: String,
    group_id: B256,
    group_id_encoded: String,
    payment_address: Address,
    expiration_threshold: u64,
    storage_endpoints: Vec<String>,
}

impl ChannelGroup {
    /// Parse `json` and select the group named `group_name`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::InvalidJson`] for malformed documents,
    /// [`MetadataError::UnknownGroup`] when no group matches, and the
    /// validation errors of [`ChannelGroup::from_metadata`].
    pub fn from_json(json: &str, group_name: &str) -> Result<Self, MetadataError> {
        let metadata: OrganizationMetadata =
            serde_json::from_str(json).map_err(|err| MetadataError::InvalidJson(err.to_string()))?;
        Self::from_metadata(&metadata, group_name)
    }

    /// Select and validate the group named `group_name`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::UnknownGroup`],
    /// [`MetadataError::InvalidGroupId`] or
    /// [`MetadataError::InvalidPaymentAddress`].
    pub fn from_metadata(
        metadata: &OrganizationMetadata,
        group_name: &str,
    ) -> Result<Self, MetadataError> {
        let group = metadata
            .groups
            .iter()
            .find(|group| group.group_name == group_name)
            .ok_or_else(|| MetadataError::UnknownGroup(group_name.to_string()))?;

        let group_id = decode_group_id(&group.group_id)?;
        let payment_address = group
            .payment
            .payment_address
            .parse::<Address>()
            .map_err(|_| MetadataError::InvalidPaymentAddress(group.payment.payment_address.clone()))?;

        Ok(Self {
            org_name: metadata.org_name.clone(),
            group_name: group.group_name.clone(),
            group_id,
            group_id_encoded: group.group_id.clone(),
            payment_address,
            expiration_threshold: group.payment.payment_expiration_threshold,
            storage_endpoints: group
                .payment
                .payment_channel_storage_client
                .endpoints
                .clone(),
        })
    }

    /// Name of the organization.
    #[must_use]
    pub fn org_name(&self) -> &str {
        &self.org_name
    }

    /// Name of the selected group.
    #[must_use]
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Decoded group id.
    #[must_use]
    pub const fn group_id_bytes(&self) -> B256 {
        self.group_id
    }

    /// Group id as published (base64).
    #[must_use]
    pub fn group_id_string(&self) -> &str {
        &self.group_id_encoded
    }

    /// Address channels of this group pay to, EIP-55 checksummed.
    #[must_use]
    pub fn payment_address(&self) -> String {
        self.payment_address.to_checksum(None)
    }

    /// Expiration threshold in blocks.
    #[must_use]
    pub fn payment_expiration_threshold(&self) -> U256 {
        U256::from(self.expiration_threshold)
    }

    /// Storage cluster endpoints.
    #[must_use]
    pub fn payment_storage_endpoints(&self) -> &[String] {
        &self.storage_endpoints
    }
}

impl GroupIdSource for ChannelGroup {
    fn group_id(&self) -> Result<B256, MetadataError> {
        Ok(self.group_id)
    }
}

/// Decode a base64 group id into its 32 bytes.
///
/// # Errors
///
/// Returns [`MetadataError::InvalidGroupId`] if `encoded` is not base64 or
/// does not decode to exactly 32 bytes.
pub fn decode_group_id(encoded: &str) -> Result<B256, MetadataError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|err| MetadataError::InvalidGroupId {
            group_id: encoded.to_string(),
            reason: err.to_string(),
        })?;
    if bytes.len() != 32 {
        return Err(MetadataError::InvalidGroupId {
            group_id: encoded.to_string(),
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        });
    }
    Ok(B256::from_slice(&bytes))
}
