//! Read-through caches for identity resolution.
//!
//! Each resolution step has its own cache with its own revalidation window. Writes for
//! the same key are derived from the same upstream data, so concurrent population is
//! allowed and the last write wins.

use std::{future::Future, sync::Arc};

use metrics::counter;
use moka::future::Cache;
use tracing::debug;

use crate::{
    config::CacheConfig,
    did::DidDocument,
    metrics::{CACHE_HITS, CACHE_MISSES},
    syntax::{Did, Handle},
};

/// Caches shared by the handle and DID resolvers.
///
/// Cloning is cheap; clones share the same underlying storage.
#[derive(Clone)]
pub struct ResolverCache {
    /// DNS TXT answers, including negative ones.
    dns: Cache<Handle, Option<Did>>,
    /// HTTPS well-known answers, including negative ones.
    https: Cache<Handle, Option<Did>>,
    /// Reconciled handle to DID results. Only successes are cached.
    handles: Cache<Handle, Did>,
    /// DID documents.
    documents: Cache<Did, Arc<DidDocument>>,
}

impl ResolverCache {
    pub fn new(config: &CacheConfig) -> Self {
        let lookups = || {
            Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.handle_lookup_ttl())
                .build()
        };

        Self {
            dns: lookups(),
            https: lookups(),
            handles: Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.handle_ttl())
                .build(),
            documents: Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.did_doc_ttl())
                .build(),
        }
    }

    /// Return the cached DNS answer for `handle`, or run `lookup` and cache its result.
    pub(crate) async fn dns_lookup(
        &self,
        handle: &Handle,
        lookup: impl Future<Output = Option<Did>>,
    ) -> Option<Did> {
        read_through(&self.dns, "dns", handle, lookup).await
    }

    /// Return the cached HTTPS answer for `handle`, or run `lookup` and cache its result.
    pub(crate) async fn https_lookup(
        &self,
        handle: &Handle,
        lookup: impl Future<Output = Option<Did>>,
    ) -> Option<Did> {
        read_through(&self.https, "https", handle, lookup).await
    }

    pub(crate) async fn handle(&self, handle: &Handle) -> Option<Did> {
        record_lookup("handle", self.handles.get(handle).await)
    }

    pub(crate) async fn insert_handle(&self, handle: Handle, did: Did) {
        self.handles.insert(handle, did).await;
    }

    pub(crate) async fn document(&self, did: &Did) -> Option<Arc<DidDocument>> {
        record_lookup("did_doc", self.documents.get(did).await)
    }

    pub(crate) async fn insert_document(&self, did: Did, doc: Arc<DidDocument>) {
        self.documents.insert(did, doc).await;
    }

    /// Forget everything known about `handle`, including negative lookups.
    pub async fn invalidate_handle(&self, handle: &Handle) {
        debug!(%handle, "invalidating handle");
        self.dns.invalidate(handle).await;
        self.https.invalidate(handle).await;
        self.handles.invalidate(handle).await;
    }

    /// Forget the cached document for `did`.
    pub async fn invalidate_did(&self, did: &Did) {
        debug!(%did, "invalidating DID document");
        self.documents.invalidate(did).await;
    }

    /// Drop every cached entry.
    pub fn invalidate_all(&self) {
        self.dns.invalidate_all();
        self.https.invalidate_all();
        self.handles.invalidate_all();
        self.documents.invalidate_all();
    }
}

async fn read_through(
    cache: &Cache<Handle, Option<Did>>,
    name: &'static str,
    handle: &Handle,
    lookup: impl Future<Output = Option<Did>>,
) -> Option<Did> {
    if let Some(answer) = cache.get(handle).await {
        counter!(CACHE_HITS, "cache" => name).increment(1);
        return answer;
    }

    counter!(CACHE_MISSES, "cache" => name).increment(1);
    let answer = lookup.await;
    cache.insert(handle.clone(), answer.clone()).await;
    answer
}

fn record_lookup<T>(name: &'static str, value: Option<T>) -> Option<T> {
    if value.is_some() {
        counter!(CACHE_HITS, "cache" => name).increment(1);
    } else {
        counter!(CACHE_MISSES, "cache" => name).increment(1);
    }
    value
}
