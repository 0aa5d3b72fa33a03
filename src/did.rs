//! DID documents and their resolution.

use std::{sync::Arc, time::Duration};

use metrics::counter;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    cache::ResolverCache,
    error::ResolveError,
    metrics::{DID_FAILED, DID_RESOLVED},
    syntax::{Did, Handle},
};

/// Service type of a Personal Data Server entry.
pub const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";
/// Fragment id of the PDS service entry.
const PDS_SERVICE_ID: &str = "#atproto_pds";
/// Fragment id of the repository signing key.
const SIGNING_KEY_ID: &str = "#atproto";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

#[expect(
    clippy::arbitrary_source_item_ordering,
    reason = "serialized data might be structured"
)]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// DID verification method.
pub struct DidVerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub controller: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
/// A service endpoint. atproto only uses plain URLs, but DID documents allow maps and sets.
pub enum ServiceEndpoint {
    Url(String),
    Other(serde_json::Value),
}

#[expect(
    clippy::arbitrary_source_item_ordering,
    reason = "serialized data might be structured"
)]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub service_endpoint: ServiceEndpoint,
}

#[expect(
    clippy::arbitrary_source_item_ordering,
    reason = "serialized data might be structured"
)]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// DID document.
pub struct DidDocument {
    #[serde(
        rename = "@context",
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub context: Vec<String>,
    pub id: Did,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub verification_method: Vec<DidVerificationMethod>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

impl DidDocument {
    /// Whether a fragment reference (`#frag` or `<did>#frag`) names `fragment` in this document.
    fn is_fragment(&self, id: &str, fragment: &str) -> bool {
        id == fragment
            || id
                .strip_prefix(self.id.as_str())
                .is_some_and(|rest| rest == fragment)
    }

    /// The handle this document claims, i.e. the first `at://` entry in `alsoKnownAs`.
    ///
    /// This is only a claim; the handle must be resolved back to this DID to be trusted.
    pub fn handle(&self) -> Option<Handle> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .and_then(|h| Handle::new(h).ok())
    }

    /// The PDS endpoint. Prefers the `#atproto_pds` entry and falls back to the first
    /// service of the PDS type.
    pub fn pds(&self) -> Option<Url> {
        let pds_services = || self.service.iter().filter(|s| s.ty == PDS_SERVICE_TYPE);
        let service = pds_services()
            .find(|s| self.is_fragment(&s.id, PDS_SERVICE_ID))
            .or_else(|| pds_services().next())?;

        let ServiceEndpoint::Url(ref endpoint) = service.service_endpoint else {
            return None;
        };
        Url::parse(endpoint)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
    }

    /// The repository signing key, as a `did:key:` string.
    pub fn signing_key(&self) -> Option<String> {
        let method = self
            .verification_method
            .iter()
            .find(|m| self.is_fragment(&m.id, SIGNING_KEY_ID))?;

        match (method.ty.as_str(), method.public_key_multibase.as_deref()) {
            ("Multikey", Some(key)) if key.starts_with('z') => Some(format!("did:key:{key}")),
            (ty, _) => {
                debug!(did = %self.id, "unsupported verification method type {ty}");
                None
            }
        }
    }
}

/// Derive the document URL for a `did:web` identifier.
///
/// `did:web:example.com` maps to `https://example.com/.well-known/did.json`, and extra
/// colon-separated segments map to a path, e.g. `did:web:example.com:u:alice` maps to
/// `https://example.com/u/alice/did.json`.
pub fn did_web_url(did: &Did) -> Result<Url, ResolveError> {
    let malformed = |reason: &str| ResolveError::MalformedDocument {
        did: did.clone(),
        reason: reason.to_owned(),
    };

    let mut segments = did.method_specific_id().split(':');
    let host = segments.next().filter(|h| !h.is_empty());
    let host = host.ok_or_else(|| malformed("did:web is missing a host"))?;
    let host = urlencoding::decode(host).map_err(|_| malformed("did:web host is not UTF-8"))?;

    let path: Vec<String> = segments
        .map(|s| urlencoding::decode(s).map(|s| s.into_owned()))
        .collect::<Result<_, _>>()
        .map_err(|_| malformed("did:web path is not UTF-8"))?;

    let url = if path.is_empty() {
        format!("https://{host}/.well-known/did.json")
    } else {
        format!("https://{host}/{}/did.json", path.join("/"))
    };

    Url::parse(&url).map_err(|e| malformed(&format!("invalid did:web URL: {e}")))
}

/// Resolves DIDs to their documents.
///
/// Documents are cached only by [`ResolverCache`], so invalidating it always reaches upstream.
#[derive(Clone)]
pub struct DidResolver {
    client: reqwest::Client,
    plc_directory: Url,
    timeout: Duration,
    cache: ResolverCache,
}

impl DidResolver {
    pub fn new(
        client: reqwest::Client,
        plc_directory: Url,
        timeout: Duration,
        cache: ResolverCache,
    ) -> Self {
        Self {
            client,
            plc_directory,
            timeout,
            cache,
        }
    }

    /// The document URL for `did`.
    pub fn document_url(&self, did: &Did) -> Result<Url, ResolveError> {
        match did.method() {
            "plc" => {
                // N.B: `Url::join` would treat `did:plc:...` as an absolute URL with a `did` scheme.
                let base = self.plc_directory.as_str().trim_end_matches('/');
                Url::parse(&format!("{base}/{did}"))
                    .map_err(|e| ResolveError::Network(format!("invalid PLC directory URL: {e}")))
            }
            "web" => did_web_url(did),
            m => Err(ResolveError::UnsupportedDidMethod(format!("did:{m}"))),
        }
    }

    /// Resolve a DID document, consulting the cache first.
    pub async fn resolve(&self, did: &Did) -> Result<Arc<DidDocument>, ResolveError> {
        if let Some(doc) = self.cache.document(did).await {
            return Ok(doc);
        }

        let doc = match self.fetch(did).await {
            Ok(doc) => Arc::new(doc),
            Err(e) => {
                counter!(DID_FAILED).increment(1);
                return Err(e);
            }
        };
        counter!(DID_RESOLVED).increment(1);

        self.cache.insert_document(did.clone(), doc.clone()).await;
        Ok(doc)
    }

    /// Fetch a DID document from its source, bypassing the cache.
    pub async fn fetch(&self, did: &Did) -> Result<DidDocument, ResolveError> {
        let url = self.document_url(did)?;
        debug!(%did, %url, "fetching DID document");

        let body = tokio::time::timeout(self.timeout, async {
            let res = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| ResolveError::Network(e.to_string()))?;

            match res.status() {
                StatusCode::NOT_FOUND | StatusCode::GONE => {
                    return Err(ResolveError::DidDocumentNotFound(did.clone()))
                }
                s if !s.is_success() => {
                    return Err(ResolveError::Network(format!("{url} returned {s}")))
                }
                _ => {}
            }

            res.bytes()
                .await
                .map_err(|e| ResolveError::Network(e.to_string()))
        })
        .await
        .map_err(|_| ResolveError::Timeout("DID resolution"))??;

        parse_document(did, &body)
    }
}

/// Parse and validate a fetched document against the DID that was requested.
pub(crate) fn parse_document(did: &Did, body: &[u8]) -> Result<DidDocument, ResolveError> {
    let doc: DidDocument =
        serde_json::from_slice(body).map_err(|e| ResolveError::MalformedDocument {
            did: did.clone(),
            reason: e.to_string(),
        })?;

    if doc.id != *did {
        return Err(ResolveError::MalformedDocument {
            did: did.clone(),
            reason: format!("document is for {}", doc.id),
        });
    }

    Ok(doc)
}
