//! # Prepaid Usage Runtime
//!
//! Executes usage updates against the shared store.
//!
//! ## Core Components
//!
//! - **[`transaction::CasEngine`]**: read, compute, conditionally swap, retry on lost races
//! - **[`service::PrepaidService`]**: picks the accounting rule and runs it as one transaction
//! - **[`admin::AdminService`]**: authenticated operator access to the service
//!
//! ## Example
//!
//! ```ignore
//! use prepaid_usage_core::rules::RuleRegistry;
//! use prepaid_usage_core::typed_store::TypedStore;
//! use prepaid_usage_runtime::{retry::RetryPolicy, service::PrepaidService};
//!
//! let service = PrepaidService::new(
//!     TypedStore::new(store),
//!     RuleRegistry::standard(),
//!     RetryPolicy::default(),
//!     &group,
//! )?;
//!
//! service.update_usage(channel_id, "400".parse()?, "USED").await?;
//! ```

/// Authenticated administrative access
pub mod admin;

/// Configuration from environment variables
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry policy with exponential backoff
pub mod retry;

/// Usage update service
pub mod service;

/// Compare-and-swap transaction engine
pub mod transaction;

pub use retry::RetryPolicy;
pub use service::{ErrorKind, PrepaidService, UsageServiceError};
pub use transaction::{CasEngine, CasRequest, TransactionError, TransactionOutcome};
