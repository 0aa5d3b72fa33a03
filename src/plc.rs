//! PLC directory audit logs.
use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{error::ResolveError, syntax::Did};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
/// A service listed in a PLC operation.
pub struct PlcService {
    #[serde(rename = "type")]
    pub ty: String,
    pub endpoint: String,
}

#[expect(
    clippy::arbitrary_source_item_ordering,
    reason = "serialized data might be structured"
)]
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
/// A signed operation in a DID's PLC log.
pub enum PlcOperation {
    #[serde(rename = "plc_operation", rename_all = "camelCase")]
    Operation {
        rotation_keys: Vec<String>,
        verification_methods: BTreeMap<String, String>,
        also_known_as: Vec<String>,
        services: BTreeMap<String, PlcService>,
        prev: Option<String>,
        #[serde(default)]
        sig: String,
    },
    #[serde(rename = "plc_tombstone")]
    Tombstone {
        prev: Option<String>,
        #[serde(default)]
        sig: String,
    },
    /// The legacy genesis format, superseded by `plc_operation`.
    #[serde(rename = "create", rename_all = "camelCase")]
    LegacyCreate {
        signing_key: String,
        recovery_key: String,
        handle: String,
        service: String,
        prev: Option<String>,
        #[serde(default)]
        sig: String,
    },
}

impl PlcOperation {
    /// The operation's wire type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Operation { .. } => "plc_operation",
            Self::Tombstone { .. } => "plc_tombstone",
            Self::LegacyCreate { .. } => "create",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
/// An entry of `/<did>/log/audit`.
pub struct AuditEntry {
    pub did: Did,
    pub operation: PlcOperation,
    pub cid: String,
    #[serde(default)]
    pub nullified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ValueChange {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
/// A service present before and after an operation whose contents changed.
pub struct ServiceChange {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<ValueChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<ValueChange>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct MethodChange {
    pub id: String,
    pub from: String,
    pub to: String,
}

/// What a `plc_operation` changed relative to the operation before it.
#[derive(Debug, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationDiff {
    pub aliases_added: Vec<String>,
    pub aliases_removed: Vec<String>,
    pub services_added: BTreeMap<String, PlcService>,
    pub services_removed: BTreeMap<String, PlcService>,
    pub services_changed: Vec<ServiceChange>,
    pub rotation_keys_added: Vec<String>,
    pub rotation_keys_removed: Vec<String>,
    pub verification_methods_added: BTreeMap<String, String>,
    pub verification_methods_removed: BTreeMap<String, String>,
    pub verification_methods_changed: Vec<MethodChange>,
}

impl OperationDiff {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// The state a `plc_operation` sets.
struct OperationState<'a> {
    rotation_keys: &'a [String],
    verification_methods: &'a BTreeMap<String, String>,
    also_known_as: &'a [String],
    services: &'a BTreeMap<String, PlcService>,
}

impl<'a> OperationState<'a> {
    fn of(op: &'a PlcOperation) -> Option<Self> {
        match op {
            PlcOperation::Operation {
                rotation_keys,
                verification_methods,
                also_known_as,
                services,
                ..
            } => Some(Self {
                rotation_keys,
                verification_methods,
                also_known_as,
                services,
            }),
            PlcOperation::Tombstone { .. } | PlcOperation::LegacyCreate { .. } => None,
        }
    }
}

fn missing_from(items: &[String], other: &[String]) -> Vec<String> {
    items
        .iter()
        .filter(|x| !other.contains(x))
        .cloned()
        .collect()
}

fn keys_missing_from<V: Clone>(
    items: &BTreeMap<String, V>,
    other: &BTreeMap<String, V>,
) -> BTreeMap<String, V> {
    items
        .iter()
        .filter(|(id, _)| !other.contains_key(*id))
        .map(|(id, v)| (id.clone(), v.clone()))
        .collect()
}

fn changed(from: &str, to: &str) -> Option<ValueChange> {
    (from != to).then(|| ValueChange {
        from: from.to_owned(),
        to: to.to_owned(),
    })
}

fn diff(prev: &OperationState<'_>, next: &OperationState<'_>) -> OperationDiff {
    let services_changed = next
        .services
        .iter()
        .filter_map(|(id, service)| {
            let before = prev.services.get(id)?;
            let ty = changed(&before.ty, &service.ty);
            let endpoint = changed(&before.endpoint, &service.endpoint);
            (ty.is_some() || endpoint.is_some()).then(|| ServiceChange {
                id: id.clone(),
                ty,
                endpoint,
            })
        })
        .collect();

    let verification_methods_changed = next
        .verification_methods
        .iter()
        .filter_map(|(id, key)| {
            let before = prev.verification_methods.get(id)?;
            (before != key).then(|| MethodChange {
                id: id.clone(),
                from: before.clone(),
                to: key.clone(),
            })
        })
        .collect();

    OperationDiff {
        aliases_added: missing_from(next.also_known_as, prev.also_known_as),
        aliases_removed: missing_from(prev.also_known_as, next.also_known_as),
        services_added: keys_missing_from(next.services, prev.services),
        services_removed: keys_missing_from(prev.services, next.services),
        services_changed,
        rotation_keys_added: missing_from(next.rotation_keys, prev.rotation_keys),
        rotation_keys_removed: missing_from(prev.rotation_keys, next.rotation_keys),
        verification_methods_added: keys_missing_from(
            next.verification_methods,
            prev.verification_methods,
        ),
        verification_methods_removed: keys_missing_from(
            prev.verification_methods,
            next.verification_methods,
        ),
        verification_methods_changed,
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    /// The first operation in the log.
    Genesis,
    Update(OperationDiff),
    Tombstone,
    LegacyCreate,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub cid: String,
    pub created_at: DateTime<Utc>,
    /// Nullified operations were overridden by a rotation key with higher priority.
    pub nullified: bool,
    pub change: Change,
}

/// Summarize an audit log as a sequence of changes.
///
/// Each `plc_operation` is compared against the most recent non-nullified `plc_operation`
/// before it.
pub fn history(entries: &[AuditEntry]) -> Vec<HistoryEntry> {
    let mut current: Option<OperationState<'_>> = None;
    let mut out = Vec::with_capacity(entries.len());

    for (i, entry) in entries.iter().enumerate() {
        let change = match (&entry.operation, OperationState::of(&entry.operation)) {
            (_, Some(next)) => {
                let change = match &current {
                    Some(prev) => Change::Update(diff(prev, &next)),
                    None if i == 0 => Change::Genesis,
                    // The log resumed after a tombstone or legacy create.
                    None => Change::Update(diff(
                        &OperationState {
                            rotation_keys: &[],
                            verification_methods: &BTreeMap::new(),
                            also_known_as: &[],
                            services: &BTreeMap::new(),
                        },
                        &next,
                    )),
                };
                if !entry.nullified {
                    current = Some(next);
                }
                change
            }
            (PlcOperation::Tombstone { .. }, None) => {
                if !entry.nullified {
                    current = None;
                }
                Change::Tombstone
            }
            (_, None) if i == 0 => Change::Genesis,
            (_, None) => Change::LegacyCreate,
        };

        out.push(HistoryEntry {
            cid: entry.cid.clone(),
            created_at: entry.created_at,
            nullified: entry.nullified,
            change,
        });
    }

    out
}

/// Client for a PLC directory.
#[derive(Clone)]
pub struct PlcClient {
    client: reqwest::Client,
    plc_directory: Url,
    timeout: Duration,
}

impl PlcClient {
    pub fn new(client: reqwest::Client, plc_directory: Url, timeout: Duration) -> Self {
        Self {
            client,
            plc_directory,
            timeout,
        }
    }

    /// Fetch the full operation log of `did`, including nullified operations.
    pub async fn audit_log(&self, did: &Did) -> Result<Vec<AuditEntry>, ResolveError> {
        if did.method() != "plc" {
            return Err(ResolveError::UnsupportedDidMethod(format!(
                "did:{}",
                did.method()
            )));
        }

        let base = self.plc_directory.as_str().trim_end_matches('/');
        let url = format!("{base}/{did}/log/audit");
        debug!(%did, %url, "fetching audit log");

        let body = tokio::time::timeout(self.timeout, async {
            let res = self
                .client
                .get(&url)
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
        .map_err(|_| ResolveError::Timeout("PLC audit log"))??;

        serde_json::from_slice(&body).map_err(|e| ResolveError::MalformedDocument {
            did: did.clone(),
            reason: format!("invalid audit log: {e}"),
        })
    }
}
