//! Handle resolution via DNS TXT records and the HTTPS well-known endpoint.

use std::{future::Future, time::Duration};

use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
};
use metrics::counter;
use tracing::{debug, warn};

use crate::{
    cache::ResolverCache,
    error::{HandleFailure, ResolveError},
    metrics::{HANDLE_FAILED, HANDLE_LOOKUP_EMPTY, HANDLE_RESOLVED},
    syntax::{Did, Handle},
};

/// Prefix of the TXT record name holding a handle's DID.
const DNS_SUBDOMAIN: &str = "_atproto";
/// Prefix of the TXT record value.
const DNS_PREFIX: &str = "did=";
/// Path of the HTTPS well-known handle endpoint.
const WELL_KNOWN_PATH: &str = "/.well-known/atproto-did";

/// A DNS TXT lookup for `_atproto.<handle>`.
///
/// Implementations swallow their own failures: anything other than a usable DID is `None`.
pub trait TxtLookup: Send + Sync {
    fn txt_did(&self, handle: &Handle) -> impl Future<Output = Option<Did>> + Send;
}

/// An HTTPS lookup of `https://<handle>/.well-known/atproto-did`.
///
/// Implementations swallow their own failures: anything other than a usable DID is `None`.
pub trait WellKnownLookup: Send + Sync {
    fn well_known_did(&self, handle: &Handle) -> impl Future<Output = Option<Did>> + Send;
}

/// Extract the DID from the TXT record values of `_atproto.<handle>`.
///
/// Exactly one `did=` value must be present; several conflicting values are treated as no answer.
pub(crate) fn did_from_txt<S: AsRef<str>>(values: &[S]) -> Option<Did> {
    let mut dids = values
        .iter()
        .filter_map(|v| v.as_ref().trim().strip_prefix(DNS_PREFIX))
        .map(str::trim);

    let first = dids.next()?;
    if dids.any(|other| other != first) {
        warn!("conflicting {DNS_PREFIX} TXT records");
        return None;
    }

    Did::new(first).ok()
}

/// Extract the DID from a well-known response body. Only the first line is considered.
pub(crate) fn did_from_well_known(body: &str) -> Option<Did> {
    let line = body.lines().map(str::trim).find(|l| !l.is_empty())?;
    Did::new(line).ok()
}

/// DNS TXT lookups through the system resolver.
pub struct DnsTxtLookup {
    resolver: TokioAsyncResolver,
}

impl DnsTxtLookup {
    /// Use the system resolver configuration, falling back to public defaults.
    pub fn from_system_conf() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("failed to read system DNS configuration, using defaults: {e}");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

impl TxtLookup for DnsTxtLookup {
    async fn txt_did(&self, handle: &Handle) -> Option<Did> {
        let name = format!("{DNS_SUBDOMAIN}.{handle}.");
        let lookup = match self.resolver.txt_lookup(name.as_str()).await {
            Ok(lookup) => lookup,
            Err(e) => {
                debug!(%handle, "DNS lookup failed: {e}");
                return None;
            }
        };

        let values: Vec<String> = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect()
            })
            .collect();

        did_from_txt(&values)
    }
}

/// HTTPS well-known lookups.
pub struct HttpsWellKnownLookup {
    client: reqwest::Client,
}

impl HttpsWellKnownLookup {
    /// `client` should not cache; answers are cached by [`ResolverCache`] instead.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl WellKnownLookup for HttpsWellKnownLookup {
    async fn well_known_did(&self, handle: &Handle) -> Option<Did> {
        let url = format!("https://{handle}{WELL_KNOWN_PATH}");
        let res = match self.client.get(&url).send().await {
            Ok(res) => res,
            Err(e) => {
                debug!(%handle, "HTTPS lookup failed: {e}");
                return None;
            }
        };

        if !res.status().is_success() {
            debug!(%handle, "HTTPS lookup returned {}", res.status());
            return None;
        }

        let body = res.text().await.ok()?;
        did_from_well_known(&body)
    }
}

/// Decide the outcome of a handle resolution from its two independent answers.
///
/// Both answers present and different is a failure, since one of them is spoofed.
pub fn reconcile(
    handle: &Handle,
    dns: Option<Did>,
    https: Option<Did>,
) -> Result<Did, ResolveError> {
    let failed = |reason| ResolveError::HandleResolutionFailed {
        handle: handle.clone(),
        reason,
    };

    match (dns, https) {
        (Some(dns), Some(https)) if dns != https => Err(failed(HandleFailure::Conflict { dns, https })),
        (Some(did), _) | (None, Some(did)) => Ok(did),
        (None, None) => Err(failed(HandleFailure::NoAnswer)),
    }
}

/// Resolves handles to DIDs with concurrent DNS and HTTPS lookups.
pub struct HandleResolver<T = DnsTxtLookup, W = HttpsWellKnownLookup> {
    txt: T,
    well_known: W,
    cache: ResolverCache,
    dns_timeout: Duration,
    https_timeout: Duration,
}

impl<T: TxtLookup, W: WellKnownLookup> HandleResolver<T, W> {
    pub fn new(
        txt: T,
        well_known: W,
        cache: ResolverCache,
        dns_timeout: Duration,
        https_timeout: Duration,
    ) -> Self {
        Self {
            txt,
            well_known,
            cache,
            dns_timeout,
            https_timeout,
        }
    }

    pub fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    /// Resolve `handle` to a DID.
    ///
    /// This does not check the DID document; see [`crate::identity::IdentityResolver`] for
    /// bi-directional verification.
    pub async fn resolve(&self, handle: &Handle) -> Result<Did, ResolveError> {
        if let Some(did) = self.cache.handle(handle).await {
            return Ok(did);
        }

        // Each lookup is bounded by its own timeout; one timing out does not cancel the other.
        let dns = async {
            let lookup = tokio::time::timeout(self.dns_timeout, self.txt.txt_did(handle));
            lookup.await.unwrap_or_else(|_| {
                warn!(%handle, "DNS lookup timed out");
                None
            })
        };
        let https = async {
            let lookup =
                tokio::time::timeout(self.https_timeout, self.well_known.well_known_did(handle));
            lookup.await.unwrap_or_else(|_| {
                warn!(%handle, "HTTPS lookup timed out");
                None
            })
        };

        let (dns, https) = tokio::join!(
            self.cache.dns_lookup(handle, dns),
            self.cache.https_lookup(handle, https),
        );

        for (source, answer) in [("dns", &dns), ("https", &https)] {
            if answer.is_none() {
                counter!(HANDLE_LOOKUP_EMPTY, "source" => source).increment(1);
            }
        }

        match reconcile(handle, dns, https) {
            Ok(did) => {
                debug!(%handle, %did, "resolved handle");
                counter!(HANDLE_RESOLVED).increment(1);
                self.cache.insert_handle(handle.clone(), did.clone()).await;
                Ok(did)
            }
            Err(e) => {
                warn!("{e}");
                counter!(HANDLE_FAILED).increment(1);
                Err(e)
            }
        }
    }
}
