//! Merkle Search Tree lookups over the blocks of a CAR file.
use atrium_repo::Cid;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use crate::{car::CarFile, error::VerificationError};

/// Trees deeper than this are rejected rather than walked.
const MAX_DEPTH: usize = 128;

#[expect(
    clippy::arbitrary_source_item_ordering,
    reason = "serialized data might be structured"
)]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
/// An entry of a tree node.
pub struct TreeEntry {
    /// Key suffix after the shared prefix.
    #[serde(with = "serde_bytes")]
    pub k: Vec<u8>,
    /// Length of the prefix shared with the previous key in the node.
    pub p: u64,
    /// Subtree of keys between this entry and the next.
    pub t: Option<Cid>,
    /// The value, usually a record CID.
    pub v: Cid,
}

#[expect(
    clippy::arbitrary_source_item_ordering,
    reason = "serialized data might be structured"
)]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
/// A tree node.
pub struct NodeData {
    pub e: Vec<TreeEntry>,
    /// Subtree of keys before the first entry.
    pub l: Option<Cid>,
}

/// The layer of `key`: the number of leading zero bits of its SHA-256 hash, divided by two.
pub fn key_layer(key: &[u8]) -> u32 {
    let digest = sha2::Sha256::digest(key);

    let mut zeros = 0;
    for byte in digest {
        zeros += byte.leading_zeros();
        if byte != 0 {
            break;
        }
    }
    zeros / 2
}

fn malformed(cid: Cid, reason: impl Into<String>) -> VerificationError {
    VerificationError::MalformedTree {
        cid,
        reason: reason.into(),
    }
}

/// Expand the prefix-compressed keys of a node.
fn node_keys(cid: Cid, node: &NodeData) -> Result<Vec<Vec<u8>>, VerificationError> {
    let mut keys: Vec<Vec<u8>> = Vec::with_capacity(node.e.len());

    for (i, entry) in node.e.iter().enumerate() {
        let prefix = usize::try_from(entry.p).map_err(|_| malformed(cid, "prefix too long"))?;
        let key = match keys.last() {
            None if prefix != 0 => return Err(malformed(cid, "first entry has a prefix")),
            None => entry.k.clone(),
            Some(prev) => {
                let shared = prev
                    .get(..prefix)
                    .ok_or_else(|| malformed(cid, format!("entry {i} prefix exceeds key")))?;
                [shared, entry.k.as_slice()].concat()
            }
        };

        if let Some(prev) = keys.last() {
            if *prev >= key {
                return Err(malformed(cid, format!("entry {i} is out of order")));
            }
        }
        keys.push(key);
    }

    Ok(keys)
}

/// Look up `key` in the tree rooted at `root`.
///
/// Returns `Ok(None)` if the blocks prove the key absent. Blocks that are needed to decide
/// but missing from `car` are an error.
pub async fn find(
    car: &mut CarFile,
    root: Cid,
    key: &[u8],
) -> Result<Option<Cid>, VerificationError> {
    let wanted = key_layer(key);
    let mut cid = root;
    let mut expected: Option<u32> = None;

    for _ in 0..MAX_DEPTH {
        let node: NodeData = car.decode(&cid).await?;
        let keys = node_keys(cid, &node)?;

        let layer = match (expected, keys.first()) {
            (Some(layer), _) => layer,
            (None, Some(first)) => key_layer(first),
            // An empty root has no layer of its own.
            (None, None) => match node.l {
                Some(_) => return Err(malformed(cid, "root has no entries")),
                None => return Ok(None),
            },
        };
        if let Some(k) = keys.iter().find(|k| key_layer(k) != layer) {
            return Err(malformed(
                cid,
                format!("key {} is not on layer {layer}", String::from_utf8_lossy(k)),
            ));
        }

        // Keys on higher layers would have been found in an ancestor.
        if wanted > layer {
            return Ok(None);
        }

        let pos = keys.partition_point(|k| k.as_slice() < key);
        if keys.get(pos).is_some_and(|k| k.as_slice() == key) {
            return Ok(Some(node.e[pos].v));
        }

        let subtree = match pos {
            0 => node.l,
            _ => node.e[pos - 1].t,
        };
        let Some(subtree) = subtree else {
            return Ok(None);
        };
        let Some(below) = layer.checked_sub(1) else {
            return Err(malformed(cid, "leaf node has a subtree"));
        };

        cid = subtree;
        expected = Some(below);
    }

    Err(malformed(root, "tree is too deep"))
}
