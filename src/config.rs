use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;
use url::Url;

/// The URL of the public PLC directory.
pub const PLC_DIRECTORY: &str = "https://plc.directory";

fn default_plc_directory() -> Url {
    Url::parse(PLC_DIRECTORY).expect("should be a valid URL")
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub listen_address: Option<SocketAddr>,
    /// Base URL of the PLC directory used for `did:plc` documents and audit logs.
    #[serde(default = "default_plc_directory")]
    pub plc_directory: Url,
    /// Overrides the default `atprobe/<version>` user agent.
    pub user_agent: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub metrics: Option<MetricConfig>,
}

/// Upper bounds on outbound requests, in milliseconds.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    /// DID document fetches.
    pub did_ms: u64,
    /// DNS TXT handle lookups.
    pub handle_ms: u64,
    /// HTTPS well-known handle lookups.
    pub https_ms: u64,
    /// XRPC calls against a PDS.
    pub request_ms: u64,
}

impl TimeoutConfig {
    pub fn did(&self) -> Duration {
        Duration::from_millis(self.did_ms)
    }

    pub fn handle(&self) -> Duration {
        Duration::from_millis(self.handle_ms)
    }

    pub fn https(&self) -> Duration {
        Duration::from_millis(self.https_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            did_ms: 1_000,
            handle_ms: 3_000,
            https_ms: 1_500,
            request_ms: 10_000,
        }
    }
}

/// Resolver cache sizing and revalidation windows, in seconds.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries per cache.
    pub capacity: u64,
    /// Raw DNS and HTTPS lookups, including negative answers.
    pub handle_lookup_secs: u64,
    /// Reconciled handle to DID results.
    pub handle_secs: u64,
    /// DID documents.
    pub did_doc_secs: u64,
}

impl CacheConfig {
    pub fn handle_lookup_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_lookup_secs)
    }

    pub fn handle_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_secs)
    }

    pub fn did_doc_ttl(&self) -> Duration {
        Duration::from_secs(self.did_doc_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            handle_lookup_secs: 60 * 60 * 24,
            handle_secs: 10,
            did_doc_secs: 10,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricConfig {
    PrometheusPush(PrometheusConfig),
}

#[derive(Deserialize, Debug, Clone)]
pub struct PrometheusConfig {
    /// The push gateway endpoint.
    pub url: String,
}
