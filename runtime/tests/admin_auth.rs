//! Integration tests for authenticated administrative access.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use alloy_primitives::Address;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use prepaid_usage_core::channel::UsageType;
use prepaid_usage_core::typed_store::KeyValueStore;
use prepaid_usage_runtime::admin::{
    AdminError, AdminService, AuthError, BlockNumberSource, CallerAuthentication,
    LIST_ALL_USERS_METHOD, UPDATE_USAGE_METHOD, signed_message,
};
use prepaid_usage_runtime::retry::RetryPolicy;
use prepaid_usage_runtime::service::UsageServiceError;
use prepaid_usage_testing::mocks::{FixedBlockNumber, InMemoryKeyValueStore};
use prepaid_usage_testing::{channel, delta, record, service_over};
use std::str::FromStr;
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

const OPERATOR_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const OPERATOR_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
const OTHER_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
const CURRENT_BLOCK: u64 = 1_000;

struct Fixture {
    store: Arc<InMemoryKeyValueStore>,
    blocks: Arc<FixedBlockNumber>,
    admin: AdminService,
}

fn fixture(authentication_address: &str) -> Fixture {
    let store = Arc::new(InMemoryKeyValueStore::new());
    let blocks = Arc::new(FixedBlockNumber::new(CURRENT_BLOCK));
    let service = Arc::new(service_over(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        RetryPolicy::immediate(),
    ));
    let admin = AdminService::new(
        service,
        authentication_address,
        Arc::clone(&blocks) as Arc<dyn BlockNumberSource>,
        5,
    );
    Fixture {
        store,
        blocks,
        admin,
    }
}

fn signer(key: &str) -> PrivateKeySigner {
    PrivateKeySigner::from_str(key).unwrap()
}

/// Credentials of `caller_address`, signed by `key` over `block`.
fn credentials(key: &str, caller_address: &str, method: &str, block: u64) -> CallerAuthentication {
    let caller = Address::parse_checksummed(caller_address, None).unwrap();
    let signature = signer(key)
        .sign_message_sync(&signed_message(method, caller, block))
        .unwrap();
    CallerAuthentication {
        user_address: caller_address.to_string(),
        current_block: block,
        signature: signature.as_bytes().to_vec(),
    }
}

fn operator(method: &str) -> CallerAuthentication {
    credentials(OPERATOR_KEY, OPERATOR_ADDRESS, method, CURRENT_BLOCK)
}

// ============================================================================
// Authentication
// ============================================================================

#[test]
fn test_operator_key_matches_operator_address() {
    assert_eq!(
        signer(OPERATOR_KEY).address().to_checksum(None),
        OPERATOR_ADDRESS
    );
}

#[tokio::test]
async fn test_signed_call_by_the_operator_is_accepted() {
    let f = fixture(OPERATOR_ADDRESS);

    f.admin
        .authenticate(LIST_ALL_USERS_METHOD, &operator(LIST_ALL_USERS_METHOD))
        .await
        .unwrap();
    assert_eq!(f.admin.authentication_address().as_deref(), Some(OPERATOR_ADDRESS));
}

#[tokio::test]
async fn test_missing_authentication_address_closes_the_gate() {
    let f = fixture("");

    let err = f
        .admin
        .authenticate(LIST_ALL_USERS_METHOD, &operator(LIST_ALL_USERS_METHOD))
        .await
        .unwrap_err();

    assert_eq!(err, AuthError::MissingAuthenticationAddress);
    assert_eq!(
        err.to_string(),
        "invalid hex address specified/missing for configuration 'authentication_address' ,this is a mandatory configuration required to be set up manually for remote updates"
    );
    assert_eq!(f.admin.authentication_address(), None);
}

#[test]
fn test_caller_must_be_the_authentication_address() {
    let f = fixture(OPERATOR_ADDRESS);

    let other = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";
    let err = f.admin.check_authentication_address(other).unwrap_err();
    assert_eq!(err, AuthError::Unauthorized(other.to_string()));
    assert_eq!(
        err.to_string(),
        "unauthorized access, 0x70997970C51812dc3A010C7d01b50e0d17dc79C8 is not authorized"
    );

    let err = f.admin.check_authentication_address("0x123").unwrap_err();
    assert_eq!(err.to_string(), "0x123 is an invalid hex Address");

    let lowercase = OPERATOR_ADDRESS.to_lowercase();
    assert!(f.admin.check_authentication_address(&lowercase).is_ok());
}

#[tokio::test]
async fn test_stale_signature_has_expired() {
    let f = fixture(OPERATOR_ADDRESS);
    let auth = operator(UPDATE_USAGE_METHOD);

    f.blocks.set(CURRENT_BLOCK + 5);
    f.admin.authenticate(UPDATE_USAGE_METHOD, &auth).await.unwrap();

    f.blocks.set(CURRENT_BLOCK + 6);
    let err = f
        .admin
        .authenticate(UPDATE_USAGE_METHOD, &auth)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::Expired);
    assert_eq!(
        err.to_string(),
        "authentication failed as the signature passed has expired"
    );
}

#[tokio::test]
async fn test_signature_by_another_key_is_rejected() {
    let f = fixture(OPERATOR_ADDRESS);
    let auth = credentials(OTHER_KEY, OPERATOR_ADDRESS, LIST_ALL_USERS_METHOD, CURRENT_BLOCK);

    let err = f
        .admin
        .authenticate(LIST_ALL_USERS_METHOD, &auth)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AuthError::SignerMismatch { recovered, .. } if recovered == signer(OTHER_KEY).address()
    ));
}

#[tokio::test]
async fn test_signature_for_another_method_is_rejected() {
    let f = fixture(OPERATOR_ADDRESS);

    let err = f
        .admin
        .authenticate(UPDATE_USAGE_METHOD, &operator(LIST_ALL_USERS_METHOD))
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::SignerMismatch { .. }));
}

#[tokio::test]
async fn test_malformed_signature_is_rejected() {
    let f = fixture(OPERATOR_ADDRESS);
    let mut auth = operator(LIST_ALL_USERS_METHOD);
    auth.signature.truncate(10);

    let err = f
        .admin
        .authenticate(LIST_ALL_USERS_METHOD, &auth)
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::InvalidSignature(_)));
}

// ============================================================================
// Gated Operations
// ============================================================================

#[tokio::test]
async fn test_authenticated_operator_lists_and_updates_usage() {
    let f = fixture(OPERATOR_ADDRESS);
    f.store.put_record(&record(42, UsageType::Planned, 1_000));

    f.admin
        .update_usage(&operator(UPDATE_USAGE_METHOD), channel(42), delta(250), "USED")
        .await
        .unwrap();
    let records = f
        .admin
        .list_all_users(&operator(LIST_ALL_USERS_METHOD))
        .await
        .unwrap();

    assert_eq!(
        records,
        vec![
            record(42, UsageType::Used, 250),
            record(42, UsageType::Planned, 1_000),
        ]
    );
}

#[tokio::test]
async fn test_unauthenticated_update_never_touches_the_store() {
    let f = fixture(OPERATOR_ADDRESS);
    let auth = credentials(OTHER_KEY, OPERATOR_ADDRESS, UPDATE_USAGE_METHOD, CURRENT_BLOCK);

    let err = f
        .admin
        .update_usage(&auth, channel(42), delta(250), "PLANNED")
        .await
        .unwrap_err();

    assert!(matches!(err, AdminError::Auth(_)));
    assert_eq!(f.store.calls(), 0);
}

#[tokio::test]
async fn test_usage_errors_pass_through_the_gate() {
    let f = fixture(OPERATOR_ADDRESS);

    let err = f
        .admin
        .update_usage(&operator(UPDATE_USAGE_METHOD), channel(42), delta(1), "BOGUS")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AdminError::Usage(UsageServiceError::UnknownUsageType { .. })
    ));
}
