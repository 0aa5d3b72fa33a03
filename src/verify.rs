//! Record proof verification.
//!
//! A proof is a CAR file whose root is a signed repository commit, followed by the tree
//! nodes on the path to a record and the record itself.
use atrium_repo::Cid;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    car::CarFile,
    error::VerificationError,
    metrics::{RECORD_UNVERIFIED, RECORD_VERIFIED},
    mst,
    syntax::{Did, Nsid, RecordKey},
};

/// Commit versions that can be verified.
const SUPPORTED_VERSIONS: [u64; 2] = [2, 3];

#[expect(
    clippy::arbitrary_source_item_ordering,
    reason = "serialized data might be structured"
)]
#[derive(Deserialize, Serialize, Debug, Clone)]
/// A signed repository commit.
pub struct Commit {
    pub did: String,
    /// Absent on version 2 commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(with = "serde_bytes")]
    pub sig: Vec<u8>,
    pub data: Cid,
    pub prev: Option<Cid>,
    pub version: u64,
}

#[expect(
    clippy::arbitrary_source_item_ordering,
    reason = "serialized data might be structured"
)]
#[derive(Serialize, Debug, Clone)]
/// The signed portion of a commit, with fields in canonical DAG-CBOR order.
pub struct UnsignedCommit<'a> {
    pub did: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<&'a str>,
    pub data: Cid,
    pub prev: Option<Cid>,
    pub version: u64,
}

impl Commit {
    pub fn unsigned(&self) -> UnsignedCommit<'_> {
        UnsignedCommit {
            did: &self.did,
            rev: self.rev.as_deref(),
            data: self.data,
            prev: self.prev,
            version: self.version,
        }
    }
}

/// What a record fetch claims about a record.
#[derive(Debug, Clone)]
pub struct RecordClaim {
    pub did: Did,
    pub collection: Nsid,
    pub rkey: RecordKey,
    /// The CID reported alongside the record's JSON, if any.
    pub cid: Option<Cid>,
}

impl RecordClaim {
    /// The tree key of the record.
    pub fn key(&self) -> String {
        format!("{}/{}", self.collection, self.rkey)
    }
}

/// A record whose inclusion in a signed commit was proven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRecord {
    pub cid: Cid,
    pub commit: Cid,
    pub rev: String,
}

/// The verification state of a fetched record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    Pending,
    Verified { cid: String, rev: String },
    Failed { reason: String },
}

impl<E: std::fmt::Display> From<Result<VerifiedRecord, E>> for Verification {
    fn from(result: Result<VerifiedRecord, E>) -> Self {
        match result {
            Ok(record) => Self::Verified {
                cid: record.cid.to_string(),
                rev: record.rev,
            },
            Err(e) => Self::Failed {
                reason: e.to_string(),
            },
        }
    }
}

/// Verifies record proofs against a repository signing key.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordVerifier;

impl RecordVerifier {
    /// Verify that `car` proves `claim` under `signing_key`, a `did:key`.
    pub async fn verify(
        &self,
        car: Vec<u8>,
        claim: &RecordClaim,
        signing_key: &str,
    ) -> Result<VerifiedRecord, VerificationError> {
        let result = verify_proof(car, claim, signing_key).await;
        match &result {
            Ok(record) => {
                debug!(did = %claim.did, key = %claim.key(), cid = %record.cid, "record verified");
                counter!(RECORD_VERIFIED).increment(1);
            }
            Err(e) => {
                warn!(did = %claim.did, key = %claim.key(), "record failed to verify: {e}");
                counter!(RECORD_UNVERIFIED).increment(1);
            }
        }
        result
    }
}

async fn verify_proof(
    car: Vec<u8>,
    claim: &RecordClaim,
    signing_key: &str,
) -> Result<VerifiedRecord, VerificationError> {
    let mut car = CarFile::parse(car).await?;
    let root = car.root();
    let commit: Commit = car.decode(&root).await?;

    if !SUPPORTED_VERSIONS.contains(&commit.version) {
        return Err(VerificationError::UnsupportedVersion(commit.version));
    }
    if commit.did != claim.did.as_str() {
        return Err(VerificationError::DidMismatch {
            expected: claim.did.to_string(),
            actual: commit.did,
        });
    }

    let _ = atrium_crypto::did::parse_did_key(signing_key)
        .map_err(|e| VerificationError::InvalidKey(e.to_string()))?;
    let unsigned = serde_ipld_dagcbor::to_vec(&commit.unsigned()).map_err(|e| {
        VerificationError::MalformedBlock {
            cid: root,
            reason: e.to_string(),
        }
    })?;
    atrium_crypto::verify::verify_signature(signing_key, &unsigned, &commit.sig)
        .map_err(|e| VerificationError::BadSignature(e.to_string()))?;

    let key = claim.key();
    let cid = mst::find(&mut car, commit.data, key.as_bytes())
        .await?
        .ok_or_else(|| VerificationError::RecordNotFound(key.clone()))?;

    if let Some(record) = claim.cid {
        if record != cid {
            return Err(VerificationError::CidMismatch { proof: cid, record });
        }
    }
    let _ = car.get(&cid).await?;

    Ok(VerifiedRecord {
        cid,
        commit: root,
        rev: commit.rev.unwrap_or_default(),
    })
}
