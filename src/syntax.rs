//! Identifier syntax: DIDs, handles, NSIDs, record keys and AT URIs.
//!
//! Everything in here is pure. User input is classified once at the edge and
//! then carried around as one of the validated newtypes below.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a DID, in bytes.
const DID_MAX_LEN: usize = 2048;
/// Maximum length of a handle, in bytes.
const HANDLE_MAX_LEN: usize = 253;
/// Maximum length of a single DNS label.
const LABEL_MAX_LEN: usize = 63;
/// Maximum length of an NSID, in bytes.
const NSID_MAX_LEN: usize = 317;
/// Maximum length of a record key, in bytes.
const RKEY_MAX_LEN: usize = 512;

/// A malformed identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    #[error("invalid DID: {0}")]
    Did(String),
    #[error("invalid handle: {0}")]
    Handle(String),
    #[error("invalid identifier: {0}")]
    Identifier(String),
    #[error("invalid NSID: {0}")]
    Nsid(String),
    #[error("invalid record key: {0}")]
    RecordKey(String),
    #[error("invalid AT URI: {0}")]
    AtUri(String),
}

/// A syntactically valid decentralized identifier (`did:<method>:<id>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    /// Validate and wrap a DID string.
    pub fn new(did: impl Into<String>) -> Result<Self, SyntaxError> {
        let did = did.into();
        if is_valid_did(&did) {
            Ok(Self(did))
        } else {
            Err(SyntaxError::Did(did))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The DID method, e.g. `plc` for `did:plc:...`.
    pub fn method(&self) -> &str {
        self.0
            .strip_prefix("did:")
            .and_then(|rest| rest.split(':').next())
            .unwrap_or_default()
    }

    /// Everything after `did:<method>:`.
    pub fn method_specific_id(&self) -> &str {
        let prefix = 4 + self.method().len() + 1;
        &self.0[prefix..]
    }
}

fn is_valid_did(did: &str) -> bool {
    if did.len() > DID_MAX_LEN {
        return false;
    }
    let Some(rest) = did.strip_prefix("did:") else {
        return false;
    };
    let Some((method, id)) = rest.split_once(':') else {
        return false;
    };

    !method.is_empty()
        && method.bytes().all(|b| b.is_ascii_lowercase())
        && !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'%' | b'-'))
        && !id.ends_with([':', '%'])
}

/// A syntactically valid handle, normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
    /// Validate, normalize and wrap a handle.
    pub fn new(handle: impl Into<String>) -> Result<Self, SyntaxError> {
        let handle = handle.into();
        if is_valid_handle(&handle) {
            Ok(Self(handle.to_ascii_lowercase()))
        } else {
            Err(SyntaxError::Handle(handle))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_handle(handle: &str) -> bool {
    if handle.is_empty() || handle.len() > HANDLE_MAX_LEN {
        return false;
    }

    let labels: Vec<&str> = handle.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= LABEL_MAX_LEN
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    });

    // The TLD may not start with a digit. This also rules out bare IPv4 addresses.
    labels_ok
        && labels
            .last()
            .and_then(|tld| tld.bytes().next())
            .is_some_and(|b| b.is_ascii_alphabetic())
}

/// A namespaced identifier naming a record collection, e.g. `app.bsky.feed.post`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nsid(String);

impl Nsid {
    pub fn new(nsid: impl Into<String>) -> Result<Self, SyntaxError> {
        let nsid = nsid.into();
        if is_valid_nsid(&nsid) {
            Ok(Self(nsid))
        } else {
            Err(SyntaxError::Nsid(nsid))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_nsid(nsid: &str) -> bool {
    if nsid.len() > NSID_MAX_LEN {
        return false;
    }
    let segments: Vec<&str> = nsid.split('.').collect();
    let Some((name, authority)) = segments.split_last() else {
        return false;
    };
    if authority.len() < 2 {
        return false;
    }

    let authority_ok = authority.iter().all(|seg| {
        !seg.is_empty()
            && seg.len() <= LABEL_MAX_LEN
            && seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !seg.starts_with('-')
            && !seg.ends_with('-')
    });
    let name_ok = !name.is_empty()
        && name.len() <= LABEL_MAX_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric())
        && name.bytes().next().is_some_and(|b| b.is_ascii_alphabetic());

    authority_ok
        && name_ok
        && authority
            .first()
            .and_then(|seg| seg.bytes().next())
            .is_some_and(|b| b.is_ascii_alphabetic())
}

/// A record key within a collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(rkey: impl Into<String>) -> Result<Self, SyntaxError> {
        let rkey = rkey.into();
        let valid = !rkey.is_empty()
            && rkey.len() <= RKEY_MAX_LEN
            && rkey != "."
            && rkey != ".."
            && rkey
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'~' | b'-'));

        if valid {
            Ok(Self(rkey))
        } else {
            Err(SyntaxError::RecordKey(rkey))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_newtype {
    ($($ty:ident),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = SyntaxError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = SyntaxError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$ty> for String {
            fn from(v: $ty) -> Self {
                v.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    )*};
}

string_newtype!(Did, Handle, Nsid, RecordKey);

/// A user-supplied account identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Identifier {
    Did(Did),
    Handle(Handle),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Did(did) => did.fmt(f),
            Self::Handle(handle) => handle.fmt(f),
        }
    }
}

impl FromStr for Identifier {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        classify(s)
    }
}

/// Classify user input as a DID or a handle.
///
/// The input may be percent-encoded (it usually arrives as a URL path segment).
/// Anything with a `did:` prefix is treated as a DID and never as a handle.
pub fn classify(input: &str) -> Result<Identifier, SyntaxError> {
    let decoded = urlencoding::decode(input)
        .map_err(|_| SyntaxError::Identifier(input.to_owned()))?;
    let decoded = decoded.trim();

    if decoded.starts_with("did:") {
        Did::new(decoded).map(Identifier::Did)
    } else {
        Handle::new(decoded)
            .map(Identifier::Handle)
            .map_err(|_| SyntaxError::Identifier(decoded.to_owned()))
    }
}

/// An `at://` URI naming an account, a collection, or a single record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub authority: Identifier,
    pub collection: Option<Nsid>,
    pub rkey: Option<RecordKey>,
}

impl AtUri {
    /// A URI pointing at a single record.
    pub fn record(authority: Identifier, collection: Nsid, rkey: RecordKey) -> Self {
        Self {
            authority,
            collection: Some(collection),
            rkey: Some(rkey),
        }
    }

    /// The repository path (`<collection>/<rkey>`) when this URI names a record.
    pub fn record_path(&self) -> Option<String> {
        match (&self.collection, &self.rkey) {
            (Some(collection), Some(rkey)) => Some(format!("{collection}/{rkey}")),
            _ => None,
        }
    }

    /// The browser path for this URI, e.g. `/at/alice.example.com/app.bsky.feed.post/3k2a`.
    pub fn browse_path(&self) -> String {
        let mut path = format!("/at/{}", self.authority);
        for part in [
            self.collection.as_ref().map(Nsid::as_str),
            self.rkey.as_ref().map(RecordKey::as_str),
        ]
        .into_iter()
        .flatten()
        {
            path.push('/');
            path.push_str(part);
        }
        path
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}", self.authority)?;
        if let Some(collection) = &self.collection {
            write!(f, "/{collection}")?;
            if let Some(rkey) = &self.rkey {
                write!(f, "/{rkey}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for AtUri {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyntaxError::AtUri(s.to_owned());

        let rest = s.strip_prefix("at://").ok_or_else(invalid)?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        let mut parts = rest.split('/');

        let authority = parts
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(invalid)?;
        let authority = classify(authority).map_err(|_| invalid())?;
        let collection = parts
            .next()
            .map(|c| Nsid::new(c).map_err(|_| invalid()))
            .transpose()?;
        let rkey = parts
            .next()
            .map(|r| RecordKey::new(r).map_err(|_| invalid()))
            .transpose()?;

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            authority,
            collection,
            rkey,
        })
    }
}

impl Serialize for AtUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
