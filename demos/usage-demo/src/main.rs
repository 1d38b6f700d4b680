//! Usage Demo - Prepaid Channel Accounting
//!
//! Walks one payment channel through planned, used and refunded amounts,
//! then runs a burst of concurrent usage updates against the same channel.
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=debug cargo run -p usage-demo
//! ```
//!
//! Set `METRICS_ADDR=127.0.0.1:9090` to print the Prometheus payload at the
//! end. See `UsageConfig::from_env` for the other variables.

#![allow(missing_docs)]

use futures::future::join_all;
use prepaid_usage_core::channel::ChannelId;
use prepaid_usage_core::metadata::ChannelGroup;
use prepaid_usage_core::rules::RuleRegistry;
use prepaid_usage_core::typed_store::{KeyValueStore, TypedStore};
use prepaid_usage_runtime::config::UsageConfig;
use prepaid_usage_runtime::metrics::MetricsServer;
use prepaid_usage_runtime::service::PrepaidService;
use prepaid_usage_testing::delta;
use prepaid_usage_testing::helpers::ORGANIZATION_METADATA;
use prepaid_usage_testing::mocks::InMemoryKeyValueStore;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONCURRENT_UPDATES: i64 = 16;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,prepaid_usage_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Configuration and metrics
    let config = UsageConfig::from_env()?;
    let mut metrics = config.metrics_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start()?;
    }

    // 3. Group, store and service
    let group = ChannelGroup::from_json(ORGANIZATION_METADATA, &config.daemon_group_name)?;
    tracing::info!(
        org = group.org_name(),
        group = group.group_name(),
        payment_address = %group.payment_address(),
        "Loaded organization metadata"
    );

    let store = Arc::new(InMemoryKeyValueStore::new());
    let service = Arc::new(PrepaidService::new(
        TypedStore::new(Arc::clone(&store) as Arc<dyn KeyValueStore>),
        RuleRegistry::standard(),
        config.retry.policy(),
        &group,
    )?);

    // 4. One channel through its life
    let channel = ChannelId::from(42);
    let steps = [
        ("PLANNED", 1000),
        ("USED", 400),
        ("USED", 700),
        ("PLANNED", 200),
        ("USED", 700),
        ("PLANNED", -100),
        ("REFUND", 50),
        ("BOGUS", 1),
    ];
    for (usage_type, amount) in steps {
        match service.update_usage(channel, delta(amount), usage_type).await {
            Ok(()) => tracing::info!(usage_type, amount, "✓ Applied"),
            Err(err) => tracing::warn!(usage_type, amount, kind = ?err.kind(), %err, "✗ Rejected"),
        }
    }
    let usage = service.usage(channel).await?;
    tracing::info!(
        planned = %usage.planned_amount,
        used = %usage.used_amount,
        refunded = %usage.failed_amount,
        "Channel 42 after the walkthrough"
    );

    // 5. Concurrent usage on a fresh channel
    let busy = ChannelId::from(7);
    service.update_usage(busy, delta(10_000), "PLANNED").await?;
    let handles = (1..=CONCURRENT_UPDATES).map(|i| {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.update_usage(busy, delta(i * 10), "USED").await })
    });
    for result in join_all(handles).await {
        result??;
    }
    let usage = service.usage(busy).await?;
    tracing::info!(
        used = %usage.used_amount,
        expected = (1..=CONCURRENT_UPDATES).map(|i| i * 10).sum::<i64>(),
        "Channel 7 after {CONCURRENT_UPDATES} concurrent updates"
    );

    // 6. Everything in the store
    for record in service.list_all_users().await? {
        tracing::info!(
            channel_id = %record.channel_id,
            usage_type = %record.usage_type,
            amount = %record.amount,
            "Record"
        );
    }

    if let Some(payload) = metrics.as_ref().and_then(MetricsServer::render) {
        println!("{payload}");
    }

    Ok(())
}
