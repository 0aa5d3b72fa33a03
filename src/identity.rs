//! Identity resolution with bi-directional handle verification.
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::{
    did::{DidDocument, DidResolver},
    error::ResolveError,
    handle::{DnsTxtLookup, HandleResolver, HttpsWellKnownLookup, TxtLookup, WellKnownLookup},
    syntax::{Did, Handle, Identifier, classify},
};

/// Whether the handle claimed by a DID document points back at the DID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "handle", rename_all = "snake_case")]
pub enum HandleStatus {
    Verified(Handle),
    /// The document claims the handle, but the handle resolves elsewhere or not at all.
    Unverified(Handle),
    /// The document claims no handle.
    Missing,
}

impl HandleStatus {
    /// The verified handle, if any.
    pub fn verified(&self) -> Option<&Handle> {
        match self {
            Self::Verified(h) => Some(h),
            Self::Unverified(_) | Self::Missing => None,
        }
    }
}

/// A resolved identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub did: Did,
    pub handle: HandleStatus,
    pub pds: Option<Url>,
    pub signing_key: Option<String>,
    #[serde(skip)]
    pub document: Arc<DidDocument>,
}

impl Identity {
    /// The PDS, or [`ResolveError::NoPdsService`] when the document lists none.
    pub fn require_pds(&self) -> Result<&Url, ResolveError> {
        self.pds
            .as_ref()
            .ok_or_else(|| ResolveError::NoPdsService(self.did.clone()))
    }
}

/// Resolves identifiers to identities.
pub struct IdentityResolver<T = DnsTxtLookup, W = HttpsWellKnownLookup> {
    handles: HandleResolver<T, W>,
    dids: DidResolver,
}

impl<T: TxtLookup, W: WellKnownLookup> IdentityResolver<T, W> {
    pub fn new(handles: HandleResolver<T, W>, dids: DidResolver) -> Self {
        Self { handles, dids }
    }

    pub fn handles(&self) -> &HandleResolver<T, W> {
        &self.handles
    }

    pub fn dids(&self) -> &DidResolver {
        &self.dids
    }

    /// Resolve an identifier to a DID, without fetching its document.
    pub async fn resolve_did(&self, identifier: &Identifier) -> Result<Did, ResolveError> {
        match identifier {
            Identifier::Did(did) => Ok(did.clone()),
            Identifier::Handle(handle) => self.handles.resolve(handle).await,
        }
    }

    /// Resolve raw user input, such as a URL path segment.
    pub async fn resolve_input(&self, input: &str) -> Result<Identity, ResolveError> {
        let identifier = classify(input)?;
        self.resolve(&identifier).await
    }

    pub async fn resolve(&self, identifier: &Identifier) -> Result<Identity, ResolveError> {
        let did = self.resolve_did(identifier).await?;
        let document = self.dids.resolve(&did).await?;

        let handle = match document.handle() {
            None => HandleStatus::Missing,
            // The handle we started from already resolved to this DID.
            Some(claimed) if matches!(identifier, Identifier::Handle(h) if *h == claimed) => {
                HandleStatus::Verified(claimed)
            }
            Some(claimed) => match self.handles.resolve(&claimed).await {
                Ok(resolved) if resolved == did => HandleStatus::Verified(claimed),
                Ok(resolved) => {
                    warn!(%did, handle = %claimed, %resolved, "handle points at another DID");
                    HandleStatus::Unverified(claimed)
                }
                Err(e) => {
                    debug!(%did, handle = %claimed, "claimed handle did not resolve: {e}");
                    HandleStatus::Unverified(claimed)
                }
            },
        };

        Ok(Identity {
            did,
            handle,
            pds: document.pds(),
            signing_key: document.signing_key(),
            document,
        })
    }

    /// Drop cached resolution state for an identifier.
    pub async fn invalidate(&self, identifier: &Identifier) {
        let cache = self.handles.cache();
        match identifier {
            Identifier::Handle(handle) => {
                if let Some(did) = cache.handle(handle).await {
                    cache.invalidate_did(&did).await;
                }
                cache.invalidate_handle(handle).await;
            }
            Identifier::Did(did) => {
                if let Some(handle) = cache.document(did).await.and_then(|doc| doc.handle()) {
                    cache.invalidate_handle(&handle).await;
                }
                cache.invalidate_did(did).await;
            }
        }
    }
}
