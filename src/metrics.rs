//! Metric name constants.

use std::time::Duration;

use anyhow::Context;
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config;

pub const CACHE_HITS: &str = "atprobe.cache.hits"; // Counter.
pub const CACHE_MISSES: &str = "atprobe.cache.misses"; // Counter.

pub const HANDLE_RESOLVED: &str = "atprobe.handle.resolved"; // Counter.
pub const HANDLE_FAILED: &str = "atprobe.handle.failed"; // Counter.
pub const HANDLE_LOOKUP_EMPTY: &str = "atprobe.handle.lookup_empty"; // Counter.

pub const DID_RESOLVED: &str = "atprobe.did.resolved"; // Counter.
pub const DID_FAILED: &str = "atprobe.did.failed"; // Counter.

pub const RECORD_FETCHED: &str = "atprobe.record.fetched"; // Counter.
pub const RECORD_VERIFIED: &str = "atprobe.record.verified"; // Counter.
pub const RECORD_UNVERIFIED: &str = "atprobe.record.unverified"; // Counter.

/// Must be ran exactly once on startup. This will declare all of the instruments for `metrics`.
pub fn setup(config: Option<&config::MetricConfig>) -> anyhow::Result<()> {
    describe_counter!(CACHE_HITS, "Resolver cache hits, labelled by cache.");
    describe_counter!(CACHE_MISSES, "Resolver cache misses, labelled by cache.");

    describe_counter!(HANDLE_RESOLVED, "Handles successfully resolved to a DID.");
    describe_counter!(
        HANDLE_FAILED,
        "Handles that failed to resolve, including DNS/HTTPS conflicts."
    );
    describe_counter!(
        HANDLE_LOOKUP_EMPTY,
        "Individual DNS or HTTPS lookups that produced no answer, labelled by source."
    );

    describe_counter!(DID_RESOLVED, "DID documents fetched from their source.");
    describe_counter!(DID_FAILED, "DID document fetches that failed.");

    describe_counter!(RECORD_FETCHED, "Records fetched from a PDS.");
    describe_counter!(RECORD_VERIFIED, "Records whose proof verified.");
    describe_counter!(
        RECORD_UNVERIFIED,
        "Records whose proof could not be verified."
    );

    if let Some(config) = config {
        match config {
            config::MetricConfig::PrometheusPush(prometheus_config) => {
                PrometheusBuilder::new()
                    .with_push_gateway(
                        prometheus_config.url.clone(),
                        Duration::from_secs(10),
                        None,
                        None,
                    )
                    .context("failed to set up push gateway")?
                    .install()
                    .context("failed to install metrics exporter")?;
            }
        }
    }

    Ok(())
}
