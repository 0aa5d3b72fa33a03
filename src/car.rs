//! CAR v1 reading.
//!
//! Blocks are indexed by [`CarStore`], which rejects SHA-256 blocks that do not match their
//! CID. Every block is checked again when it is read, so blocks hashed with anything else
//! never reach a decoder.
use std::io::Cursor;

use atrium_repo::{
    Cid, Multihash,
    blockstore::{AsyncBlockStoreRead as _, CarError, CarStore, Error as BlockstoreError, SHA2_256},
};
use serde::Deserialize;
use sha2::Digest as _;

use crate::error::VerificationError;

fn malformed(reason: impl Into<String>) -> VerificationError {
    VerificationError::MalformedCar(reason.into())
}

/// Check that `data` hashes to the digest in `cid`.
pub(crate) fn check_block(cid: &Cid, data: &[u8]) -> Result<(), VerificationError> {
    let code = cid.hash().code();
    if code != SHA2_256 {
        return Err(VerificationError::UnsupportedHash { cid: *cid, code });
    }

    let digest = sha2::Sha256::digest(data);
    let expected: Multihash<64> = Multihash::wrap(SHA2_256, digest.as_slice())
        .map_err(|e| malformed(format!("failed to wrap digest: {e}")))?;

    if *cid.hash() == expected {
        Ok(())
    } else {
        Err(VerificationError::HashMismatch)
    }
}

#[derive(Deserialize)]
struct Header {
    version: u64,
}

/// The version field of a CAR header.
fn header_version(bytes: &[u8]) -> Result<u64, VerificationError> {
    let mut len = 0_u64;
    for (i, byte) in bytes.iter().take(9).enumerate() {
        len |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            let header = usize::try_from(len)
                .ok()
                .and_then(|len| bytes.get(i + 1..)?.get(..len))
                .ok_or_else(|| malformed("truncated header"))?;
            let header: Header = serde_ipld_dagcbor::from_slice(header)
                .map_err(|e| malformed(format!("invalid header: {e}")))?;
            return Ok(header.version);
        }
    }
    Err(malformed("invalid header length"))
}

/// An in-memory CAR v1 file.
pub struct CarFile {
    root: Cid,
    store: CarStore<Cursor<Vec<u8>>>,
}

impl CarFile {
    /// Index the blocks of `bytes`. The header must be version 1 and name at least one root.
    pub async fn parse(bytes: Vec<u8>) -> Result<Self, VerificationError> {
        let version = header_version(&bytes)?;
        if version != 1 {
            return Err(malformed(format!("unsupported CAR version {version}")));
        }

        // Hostile section lengths can panic the indexer, so it runs on its own task.
        let store = tokio::spawn(CarStore::open(Cursor::new(bytes)))
            .await
            .map_err(|e| malformed(format!("failed to index blocks: {e}")))?
            .map_err(|e| match e {
                CarError::InvalidHash => VerificationError::HashMismatch,
                e => malformed(e.to_string()),
            })?;
        let root = store.roots().next().ok_or_else(|| malformed("no roots"))?;

        Ok(Self { root, store })
    }

    /// The first root.
    pub fn root(&self) -> Cid {
        self.root
    }

    /// Read a block, checking it against its CID.
    pub async fn get(&mut self, cid: &Cid) -> Result<Vec<u8>, VerificationError> {
        let data = self.store.read_block(*cid).await.map_err(|e| match e {
            BlockstoreError::CidNotFound => VerificationError::MissingBlock(*cid),
            e => malformed(format!("failed to read block {cid}: {e}")),
        })?;

        check_block(cid, &data)?;
        Ok(data)
    }

    /// Read and decode a DAG-CBOR block.
    pub async fn decode<T: serde::de::DeserializeOwned>(
        &mut self,
        cid: &Cid,
    ) -> Result<T, VerificationError> {
        let data = self.get(cid).await?;
        serde_ipld_dagcbor::from_slice(&data).map_err(|e| VerificationError::MalformedBlock {
            cid: *cid,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{block_cid, write_car, write_car_version};

    /// Parse `bytes` and read `cid`, whichever step fails first.
    async fn read(bytes: Vec<u8>, cid: &Cid) -> Result<Vec<u8>, VerificationError> {
        CarFile::parse(bytes).await?.get(cid).await
    }

    #[tokio::test]
    async fn reads_blocks() {
        let a = b"hello".to_vec();
        let b = b"world".to_vec();
        let (ca, cb) = (block_cid(&a), block_cid(&b));

        let mut car = CarFile::parse(write_car(&[ca], &[(ca, a.clone()), (cb, b.clone())]))
            .await
            .expect("should parse");
        assert_eq!(car.root(), ca);
        assert_eq!(car.get(&ca).await.unwrap(), a);
        assert_eq!(car.get(&cb).await.unwrap(), b);

        let missing = block_cid(b"missing");
        assert_eq!(
            car.get(&missing).await.unwrap_err(),
            VerificationError::MissingBlock(missing)
        );
    }

    #[tokio::test]
    async fn rejects_hash_mismatch() {
        let ca = block_cid(b"hello");
        let bytes = write_car(&[ca], &[(ca, b"jello".to_vec())]);

        assert_eq!(
            read(bytes, &ca).await.unwrap_err(),
            VerificationError::HashMismatch
        );
    }

    #[test]
    fn checks_blocks() {
        let ca = block_cid(b"hello");
        assert_eq!(check_block(&ca, b"hello"), Ok(()));
        assert_eq!(
            check_block(&ca, b"jello"),
            Err(VerificationError::HashMismatch)
        );

        let identity = Cid::new_v1(0x71, Multihash::wrap(0x00, b"hello").unwrap());
        assert!(matches!(
            check_block(&identity, b"hello"),
            Err(VerificationError::UnsupportedHash { code: 0x00, .. })
        ));
    }

    #[tokio::test]
    async fn rejects_truncation() {
        let ca = block_cid(b"hello");
        let bytes = write_car(&[ca], &[(ca, b"hello".to_vec())]);

        for len in [0, 1, bytes.len() - 1] {
            assert!(
                matches!(
                    read(bytes[..len].to_vec(), &ca).await,
                    Err(VerificationError::MalformedCar(_))
                ),
                "truncated at {len}"
            );
        }
    }

    #[tokio::test]
    async fn rejects_a_truncated_v0_cid() {
        let ca = block_cid(b"hello");
        // A two-byte section holding only the CIDv0 multihash prefix.
        let mut bytes = write_car(&[ca], &[]);
        bytes.extend_from_slice(&[0x02, 0x12, 0x20]);

        assert!(matches!(
            read(bytes, &ca).await,
            Err(VerificationError::MalformedCar(_))
        ));
    }

    #[tokio::test]
    async fn rejects_a_section_shorter_than_its_cid() {
        let ca = block_cid(b"hello");
        let mut bytes = write_car(&[ca], &[]);
        bytes.push(0x01);
        bytes.extend_from_slice(&ca.to_bytes());
        bytes.extend_from_slice(b"hello");

        assert!(matches!(
            read(bytes, &ca).await,
            Err(VerificationError::MalformedCar(_))
        ));
    }

    #[tokio::test]
    async fn rejects_other_versions() {
        let ca = block_cid(b"hello");
        let bytes = write_car_version(2, &[ca], &[(ca, b"hello".to_vec())]);

        assert_eq!(
            read(bytes, &ca).await.unwrap_err(),
            VerificationError::MalformedCar("unsupported CAR version 2".to_owned())
        );
    }

    #[tokio::test]
    async fn rejects_rootless() {
        assert_eq!(
            CarFile::parse(write_car(&[], &[])).await.err(),
            Some(VerificationError::MalformedCar("no roots".to_owned()))
        );
    }
}
