//! The resolve, fetch and verify pipeline.
use atrium_repo::Cid;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::{ResolveError, VerificationError},
    handle::{DnsTxtLookup, HttpsWellKnownLookup, TxtLookup, WellKnownLookup},
    identity::{Identity, IdentityResolver},
    plc::{self, HistoryEntry, PlcClient},
    syntax::{AtUri, Did, Identifier, Nsid, RecordKey, SyntaxError},
    verify::{RecordClaim, RecordVerifier, Verification, VerifiedRecord},
    xrpc::{Blob, DescribeRepo, ListRecords, PdsClient, RecordEnvelope},
};

/// A record along with the identity that owns it and whether its proof checked out.
#[derive(Debug, Clone, Serialize)]
pub struct RecordReport {
    /// The record's URI with the repository named by DID.
    pub uri: AtUri,
    pub identity: Identity,
    pub record: RecordEnvelope,
    pub verification: Verification,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub did: Did,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionsReport {
    pub identity: Identity,
    #[serde(flatten)]
    pub repo: DescribeRepo,
}

fn record_parts(uri: &AtUri) -> Result<(&Nsid, &RecordKey), ResolveError> {
    match (&uri.collection, &uri.rkey) {
        (Some(collection), Some(rkey)) => Ok((collection, rkey)),
        _ => Err(SyntaxError::AtUri(format!("{uri} does not name a record")).into()),
    }
}

/// Resolves identities and fetches and verifies their records.
pub struct Inspector<T = DnsTxtLookup, W = HttpsWellKnownLookup> {
    identities: IdentityResolver<T, W>,
    pds: PdsClient,
    plc: PlcClient,
    verifier: RecordVerifier,
}

impl<T: TxtLookup, W: WellKnownLookup> Inspector<T, W> {
    pub fn new(identities: IdentityResolver<T, W>, pds: PdsClient, plc: PlcClient) -> Self {
        Self {
            identities,
            pds,
            plc,
            verifier: RecordVerifier,
        }
    }

    pub fn identities(&self) -> &IdentityResolver<T, W> {
        &self.identities
    }

    pub async fn identity(&self, identifier: &Identifier) -> Result<Identity, ResolveError> {
        self.identities.resolve(identifier).await
    }

    /// Fetch a record and, if `verify` is set, its proof.
    ///
    /// Proof failures are reported in [`RecordReport::verification`] and do not fail the fetch.
    pub async fn record(&self, uri: &AtUri, verify: bool) -> Result<RecordReport, ResolveError> {
        let (collection, rkey) = record_parts(uri)?;
        let identity = self.identities.resolve(&uri.authority).await?;
        let pds = identity.require_pds()?;
        let repo = Identifier::Did(identity.did.clone());

        let record = self.pds.get_record(pds, &repo, collection, rkey).await?;

        let verification = if verify {
            let cid = record.cid.as_deref().map(str::parse::<Cid>).transpose();
            match cid {
                Ok(cid) => {
                    Verification::from(self.verify_record(&identity, collection, rkey, cid).await)
                }
                Err(e) => Verification::Failed {
                    reason: format!("record has an invalid CID: {e}"),
                },
            }
        } else {
            Verification::Pending
        };

        Ok(RecordReport {
            uri: AtUri::record(repo, collection.clone(), rkey.clone()),
            identity,
            record,
            verification,
        })
    }

    /// Fetch and verify the proof of a record without fetching its JSON.
    pub async fn verify(&self, uri: &AtUri) -> Result<VerifiedRecord, ResolveError> {
        let (collection, rkey) = record_parts(uri)?;
        let identity = self.identities.resolve(&uri.authority).await?;

        self.verify_record(&identity, collection, rkey, None).await
    }

    async fn verify_record(
        &self,
        identity: &Identity,
        collection: &Nsid,
        rkey: &RecordKey,
        cid: Option<Cid>,
    ) -> Result<VerifiedRecord, ResolveError> {
        let pds = identity.require_pds()?;
        let key = identity.signing_key.as_deref().ok_or_else(|| {
            VerificationError::InvalidKey("DID document has no signing key".to_owned())
        })?;

        let proof = self
            .pds
            .get_record_proof(pds, &identity.did, collection, rkey)
            .await?;
        debug!(did = %identity.did, bytes = proof.len(), "fetched record proof");

        let claim = RecordClaim {
            did: identity.did.clone(),
            collection: collection.clone(),
            rkey: rkey.clone(),
            cid,
        };
        Ok(self.verifier.verify(proof, &claim, key).await?)
    }

    /// The operation history of a `did:plc` identity.
    pub async fn history(&self, identifier: &Identifier) -> Result<HistoryReport, ResolveError> {
        let did = self.identities.resolve_did(identifier).await?;
        let log = self.plc.audit_log(&did).await?;
        info!(%did, operations = log.len(), "fetched audit log");

        Ok(HistoryReport {
            history: plc::history(&log),
            did,
        })
    }

    /// The collections of a repository.
    pub async fn collections(
        &self,
        identifier: &Identifier,
    ) -> Result<CollectionsReport, ResolveError> {
        let identity = self.identities.resolve(identifier).await?;
        let pds = identity.require_pds()?;
        let repo = self
            .pds
            .describe_repo(pds, &Identifier::Did(identity.did.clone()))
            .await?;

        Ok(CollectionsReport { identity, repo })
    }

    /// A page of records in a collection.
    pub async fn list_records(
        &self,
        identifier: &Identifier,
        collection: &Nsid,
        cursor: Option<&str>,
        limit: Option<u16>,
    ) -> Result<ListRecords, ResolveError> {
        let identity = self.identities.resolve(identifier).await?;
        let pds = identity.require_pds()?;

        self.pds
            .list_records(
                pds,
                &Identifier::Did(identity.did.clone()),
                collection,
                cursor,
                limit,
            )
            .await
    }

    /// Download a blob from the repository's PDS.
    pub async fn blob(&self, identifier: &Identifier, cid: &str) -> Result<Blob, ResolveError> {
        let identity = self.identities.resolve(identifier).await?;
        let pds = identity.require_pds()?;

        self.pds.get_blob(pds, &identity.did, cid).await
    }

    /// Forget cached resolution state for `identifier`.
    pub async fn invalidate(&self, identifier: &Identifier) {
        self.identities.invalidate(identifier).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::HandleStatus,
        plc::Change,
        tests::{MockNetwork, RepoFixture},
    };

    fn post(authority: &str, rkey: &str) -> AtUri {
        format!("at://{authority}/app.bsky.feed.post/{rkey}")
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn resolves_and_verifies_a_record_by_handle() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;

        let report = net
            .inspector
            .record(&post("alice.example.com", "3k2a"), true)
            .await
            .expect("should fetch");

        assert_eq!(report.identity.did.as_str(), "did:plc:abc123");
        assert_eq!(
            report.identity.handle,
            HandleStatus::Verified("alice.example.com".parse().unwrap())
        );
        assert_eq!(report.uri.to_string(), "at://did:plc:abc123/app.bsky.feed.post/3k2a");
        assert_eq!(report.record.value["text"], "post 3k2a");
        assert!(
            matches!(report.verification, Verification::Verified { .. }),
            "{:?}",
            report.verification
        );
    }

    #[tokio::test]
    async fn unverified_records_are_still_returned() {
        let mut repo = RepoFixture::new("did:plc:abc123");
        repo.serve_tampered_proofs = true;
        let net = MockNetwork::start(repo).await;

        let report = net
            .inspector
            .record(&post("did:plc:abc123", "3k2a"), true)
            .await
            .expect("should fetch");

        assert_eq!(report.record.value["text"], "post 3k2a");
        assert!(matches!(report.verification, Verification::Failed { .. }));
    }

    #[tokio::test]
    async fn verification_can_be_skipped() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;

        let report = net
            .inspector
            .record(&post("did:plc:abc123", "3k2a"), false)
            .await
            .unwrap();
        assert_eq!(report.verification, Verification::Pending);
    }

    #[tokio::test]
    async fn missing_records_fail_with_status() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;

        let err = net
            .inspector
            .record(&post("did:plc:abc123", "nope"), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::RecordFetchFailed { status, .. } if status == 400
        ));
    }

    #[tokio::test]
    async fn unknown_dids_are_not_found() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;

        let err = net
            .inspector
            .record(&post("did:plc:xyz999", "3k2a"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::DidDocumentNotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn documents_without_a_pds_stop_the_pipeline() {
        let mut repo = RepoFixture::new("did:plc:abc123");
        repo.without_pds = true;
        let net = MockNetwork::start(repo).await;

        let err = net
            .inspector
            .record(&post("did:plc:abc123", "3k2a"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoPdsService(_)), "{err}");
    }

    #[tokio::test]
    async fn standalone_verification() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;

        let record = net
            .inspector
            .verify(&post("did:plc:abc123", "3k2b"))
            .await
            .expect("should verify");
        assert_eq!(record.cid, net.repo.record_cid("app.bsky.feed.post", "3k2b"));

        let err = net
            .inspector
            .verify(&"at://did:plc:abc123".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn history_and_collections() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;
        let alice: Identifier = "alice.example.com".parse().unwrap();

        let history = net.inspector.history(&alice).await.expect("should fetch");
        assert_eq!(history.did.as_str(), "did:plc:abc123");
        assert_eq!(history.history.len(), 2);
        assert_eq!(history.history[0].change, Change::Genesis);
        let Change::Update(diff) = &history.history[1].change else {
            panic!("expected an update");
        };
        assert_eq!(diff.aliases_added, ["at://alice.example.com"]);

        let collections = net.inspector.collections(&alice).await.expect("should fetch");
        assert_eq!(collections.repo.collections, ["app.bsky.feed.post"]);

        let page = net
            .inspector
            .list_records(&alice, &"app.bsky.feed.post".parse().unwrap(), None, Some(1))
            .await
            .expect("should list");
        assert_eq!(page.records.len(), 1);
        assert!(page.cursor.is_some());
    }

    #[tokio::test]
    async fn invalidation_refetches_documents() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;
        let did: Identifier = "did:plc:abc123".parse().unwrap();

        let _ = net.inspector.identity(&did).await.expect("should resolve");
        let _ = net.inspector.identity(&did).await.expect("should resolve");
        assert_eq!(net.document_fetches(), 1);

        net.inspector.invalidate(&did).await;
        let _ = net.inspector.identity(&did).await.expect("should resolve");
        assert_eq!(net.document_fetches(), 2);
    }

    #[tokio::test]
    async fn records_are_fetched_every_time() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;
        let uri = post("did:plc:abc123", "3k2a");

        for _ in 0..2 {
            let _ = net.inspector.record(&uri, false).await.expect("should fetch");
        }
        assert_eq!(net.record_fetches(), 2);
    }

    #[tokio::test]
    async fn handles_that_point_elsewhere_are_unverified() {
        let net = MockNetwork::start_with_lookup(
            RepoFixture::new("did:plc:abc123"),
            "did:plc:xyz999",
        )
        .await;

        let identity = net
            .inspector
            .identity(&"did:plc:abc123".parse().unwrap())
            .await
            .expect("should resolve");
        assert_eq!(
            identity.handle,
            HandleStatus::Unverified("alice.example.com".parse().unwrap())
        );
    }
}
