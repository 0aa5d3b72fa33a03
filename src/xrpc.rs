//! XRPC calls against a Personal Data Server.
use std::{future::Future, time::Duration};

use constcat::concat;
use metrics::counter;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    Client,
    error::ResolveError,
    metrics::RECORD_FETCHED,
    syntax::{Did, Identifier, Nsid, RecordKey},
};

const GET_RECORD: &str = "com.atproto.repo.getRecord";
const LIST_RECORDS: &str = "com.atproto.repo.listRecords";
const DESCRIBE_REPO: &str = "com.atproto.repo.describeRepo";
const SYNC_GET_RECORD: &str = "com.atproto.sync.getRecord";
const SYNC_GET_BLOB: &str = "com.atproto.sync.getBlob";

/// Media type of a CAR file.
pub const CAR_MIME: &str = "application/vnd.ipld.car";

/// The default and maximum page size of `listRecords`.
pub const MAX_LIST_LIMIT: u16 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A record as returned by `getRecord` and `listRecords`.
pub struct RecordEnvelope {
    pub uri: String,
    /// Absent when the PDS serves a record it cannot address by content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRecords {
    pub records: Vec<RecordEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeRepo {
    pub handle: String,
    pub did: Did,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did_doc: Option<serde_json::Value>,
    pub collections: Vec<String>,
    pub handle_is_correct: bool,
}

#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

/// Client for the read-only repository endpoints of a PDS.
#[derive(Clone)]
pub struct PdsClient {
    /// Uncached client for records, listings and proofs.
    client: reqwest::Client,
    /// HTTP-cached client for blobs, which are immutable once addressed by CID.
    blob_client: Client,
    timeout: Duration,
}

fn xrpc_url(pds: &Url, path: &str) -> Result<Url, ResolveError> {
    pds.join(path)
        .map_err(|e| ResolveError::Network(format!("invalid PDS URL {pds}: {e}")))
}

async fn bounded<T>(
    timeout: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T, ResolveError>>,
) -> Result<T, ResolveError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ResolveError::Timeout(what))?
}

/// Turn a non-2xx response into [`ResolveError::RecordFetchFailed`].
async fn check(res: reqwest::Response) -> Result<reqwest::Response, ResolveError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let body = res.text().await.unwrap_or_default();
    Err(ResolveError::RecordFetchFailed { status, body })
}

fn network(e: impl std::fmt::Display) -> ResolveError {
    ResolveError::Network(e.to_string())
}

impl PdsClient {
    pub fn new(client: reqwest::Client, blob_client: Client, timeout: Duration) -> Self {
        Self {
            client,
            blob_client,
            timeout,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        what: &'static str,
    ) -> Result<T, ResolveError> {
        debug!(%url, "xrpc request");
        bounded(self.timeout, what, async {
            let res = self.client.get(url).send().await.map_err(network)?;
            let res = check(res).await?;
            res.json::<T>().await.map_err(network)
        })
        .await
    }

    /// Fetch a record with `com.atproto.repo.getRecord`.
    pub async fn get_record(
        &self,
        pds: &Url,
        repo: &Identifier,
        collection: &Nsid,
        rkey: &RecordKey,
    ) -> Result<RecordEnvelope, ResolveError> {
        let mut url = xrpc_url(pds, concat!("/xrpc/", GET_RECORD))?;
        let _ = url
            .query_pairs_mut()
            .append_pair("repo", &repo.to_string())
            .append_pair("collection", collection.as_str())
            .append_pair("rkey", rkey.as_str());

        let record: RecordEnvelope = self.get_json(url, "record fetch").await?;
        counter!(RECORD_FETCHED).increment(1);
        Ok(record)
    }

    /// Fetch the CAR proof of a record with `com.atproto.sync.getRecord`.
    pub async fn get_record_proof(
        &self,
        pds: &Url,
        did: &Did,
        collection: &Nsid,
        rkey: &RecordKey,
    ) -> Result<Vec<u8>, ResolveError> {
        let mut url = xrpc_url(pds, concat!("/xrpc/", SYNC_GET_RECORD))?;
        let _ = url
            .query_pairs_mut()
            .append_pair("did", did.as_str())
            .append_pair("collection", collection.as_str())
            .append_pair("rkey", rkey.as_str());
        debug!(%url, "fetching record proof");

        bounded(self.timeout, "record proof fetch", async {
            let res = self
                .client
                .get(url)
                .header(header::ACCEPT, CAR_MIME)
                .send()
                .await
                .map_err(network)?;
            let res = check(res).await?;
            Ok(res.bytes().await.map_err(network)?.to_vec())
        })
        .await
    }

    /// List a page of records in `collection`, newest first.
    pub async fn list_records(
        &self,
        pds: &Url,
        repo: &Identifier,
        collection: &Nsid,
        cursor: Option<&str>,
        limit: Option<u16>,
    ) -> Result<ListRecords, ResolveError> {
        let mut url = xrpc_url(pds, concat!("/xrpc/", LIST_RECORDS))?;
        {
            let mut query = url.query_pairs_mut();
            let _ = query
                .append_pair("repo", &repo.to_string())
                .append_pair("collection", collection.as_str())
                .append_pair(
                    "limit",
                    &limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT).to_string(),
                );
            if let Some(cursor) = cursor {
                let _ = query.append_pair("cursor", cursor);
            }
        }

        self.get_json(url, "record listing").await
    }

    /// Describe a repository, including its collections.
    pub async fn describe_repo(
        &self,
        pds: &Url,
        repo: &Identifier,
    ) -> Result<DescribeRepo, ResolveError> {
        let mut url = xrpc_url(pds, concat!("/xrpc/", DESCRIBE_REPO))?;
        let _ = url.query_pairs_mut().append_pair("repo", &repo.to_string());

        self.get_json(url, "repository description").await
    }

    /// The URL a blob can be downloaded from.
    pub fn blob_url(&self, pds: &Url, did: &Did, cid: &str) -> Result<Url, ResolveError> {
        let mut url = xrpc_url(pds, concat!("/xrpc/", SYNC_GET_BLOB))?;
        let _ = url
            .query_pairs_mut()
            .append_pair("did", did.as_str())
            .append_pair("cid", cid);
        Ok(url)
    }

    /// Download a blob.
    pub async fn get_blob(&self, pds: &Url, did: &Did, cid: &str) -> Result<Blob, ResolveError> {
        let url = self.blob_url(pds, did, cid)?;

        bounded(self.timeout, "blob fetch", async {
            let res = self.blob_client.get(url).send().await.map_err(network)?;
            let res = check(res).await?;
            let content_type = res
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let data = res.bytes().await.map_err(network)?.to_vec();

            Ok(Blob { data, content_type })
        })
        .await
    }
}
