use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::{Deserialize, Serialize};

use crate::{
    AppState, Result,
    did::DidDocument,
    error::ResolveError,
    handle::{TxtLookup, WellKnownLookup},
    identity::Identity,
    inspect::{CollectionsReport, HistoryReport, RecordReport},
    syntax::{AtUri, Identifier, Nsid, RecordKey, classify},
    verify::Verification,
    xrpc::ListRecords,
};

#[derive(Serialize, Debug)]
struct IdentityReport<'a> {
    #[serde(flatten)]
    identity: &'a Identity,
    document: &'a DidDocument,
}

#[derive(Deserialize, Debug, Default)]
struct ListQuery {
    cursor: Option<String>,
    limit: Option<u16>,
}

#[derive(Deserialize, Debug, Default)]
struct RecordQuery {
    verify: Option<bool>,
}

fn record_uri(
    identifier: &str,
    collection: &str,
    rkey: &str,
) -> std::result::Result<AtUri, ResolveError> {
    Ok(AtUri::record(
        classify(identifier)?,
        Nsid::new(collection)?,
        RecordKey::new(rkey)?,
    ))
}

async fn identity<T: TxtLookup, W: WellKnownLookup>(
    State(state): State<AppState<T, W>>,
    Path(identifier): Path<String>,
) -> Result<Response> {
    let identifier = classify(&identifier).map_err(ResolveError::from)?;
    let identity = state.inspector.identity(&identifier).await?;

    Ok(Json(IdentityReport {
        identity: &identity,
        document: &identity.document,
    })
    .into_response())
}

async fn history<T: TxtLookup, W: WellKnownLookup>(
    State(state): State<AppState<T, W>>,
    Path(identifier): Path<String>,
) -> Result<Json<HistoryReport>> {
    let identifier = classify(&identifier).map_err(ResolveError::from)?;
    Ok(Json(state.inspector.history(&identifier).await?))
}

async fn collections<T: TxtLookup, W: WellKnownLookup>(
    State(state): State<AppState<T, W>>,
    Path(identifier): Path<String>,
) -> Result<Json<CollectionsReport>> {
    let identifier = classify(&identifier).map_err(ResolveError::from)?;
    Ok(Json(state.inspector.collections(&identifier).await?))
}

async fn list_records<T: TxtLookup, W: WellKnownLookup>(
    State(state): State<AppState<T, W>>,
    Path((identifier, collection)): Path<(String, String)>,
    Query(input): Query<ListQuery>,
) -> Result<Json<ListRecords>> {
    let identifier = classify(&identifier).map_err(ResolveError::from)?;
    let collection = Nsid::new(collection).map_err(ResolveError::from)?;

    let page = state
        .inspector
        .list_records(&identifier, &collection, input.cursor.as_deref(), input.limit)
        .await?;
    Ok(Json(page))
}

async fn record<T: TxtLookup, W: WellKnownLookup>(
    State(state): State<AppState<T, W>>,
    Path((identifier, collection, rkey)): Path<(String, String, String)>,
    Query(input): Query<RecordQuery>,
) -> Result<Json<RecordReport>> {
    let uri = record_uri(&identifier, &collection, &rkey)?;
    let report = state
        .inspector
        .record(&uri, input.verify.unwrap_or(true))
        .await?;
    Ok(Json(report))
}

/// Only the proof is checked; a proof that fails to verify is still a successful response.
async fn verification<T: TxtLookup, W: WellKnownLookup>(
    State(state): State<AppState<T, W>>,
    Path((identifier, collection, rkey)): Path<(String, String, String)>,
) -> Result<Json<Verification>> {
    let uri = record_uri(&identifier, &collection, &rkey)?;

    match state.inspector.verify(&uri).await {
        Ok(record) => Ok(Json(Verification::from(Ok::<_, ResolveError>(record)))),
        Err(ResolveError::VerificationFailed(e)) => Ok(Json(Verification::Failed {
            reason: e.to_string(),
        })),
        Err(e) => Err(e.into()),
    }
}

async fn blob<T: TxtLookup, W: WellKnownLookup>(
    State(state): State<AppState<T, W>>,
    Path((identifier, cid)): Path<(String, String)>,
) -> Result<Response> {
    let identifier = classify(&identifier).map_err(ResolveError::from)?;
    let blob = state.inspector.blob(&identifier, &cid).await?;

    let content_type = blob
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_owned());
    Ok(([(header::CONTENT_TYPE, content_type)], blob.data).into_response())
}

async fn invalidate<T: TxtLookup, W: WellKnownLookup>(
    State(state): State<AppState<T, W>>,
    Path(identifier): Path<String>,
) -> Result<StatusCode> {
    let identifier: Identifier = classify(&identifier).map_err(ResolveError::from)?;
    state.inspector.invalidate(&identifier).await;
    Ok(StatusCode::NO_CONTENT)
}

#[rustfmt::skip]
pub(super) fn routes<T, W>() -> Router<AppState<T, W>>
where
    T: TxtLookup + 'static,
    W: WellKnownLookup + 'static,
{
    Router::new()
        .route("/at/{identifier}",                                     get(identity::<T, W>))
        .route("/at/{identifier}/history",                             get(history::<T, W>))
        .route("/at/{identifier}/collections",                         get(collections::<T, W>))
        .route("/at/{identifier}/{collection}",                        get(list_records::<T, W>))
        .route("/at/{identifier}/{collection}/{rkey}",                 get(record::<T, W>))
        .route("/at/{identifier}/{collection}/{rkey}/verification",    get(verification::<T, W>))
        .route("/blob/{identifier}/{cid}",                             get(blob::<T, W>))
        .route("/cache/{identifier}",                                  delete(invalidate::<T, W>))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use figment::Figment;
    use reqwest::redirect::Policy;
    use serde_json::Value;

    use crate::tests::{FakeLookup, HANDLE, MockNetwork, RepoFixture, mock_inspector};

    use super::*;

    /// Serve the API against a mock network, returning its base URL.
    async fn serve(net: &MockNetwork) -> String {
        let config = Figment::new().extract().expect("defaults should be valid");
        let state = AppState {
            config: Arc::new(config),
            inspector: Arc::new(mock_inspector(
                &net.base,
                FakeLookup::with(HANDLE, net.repo.did().as_str()),
            )),
        };
        let app = crate::endpoints::routes().with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        }));
        format!("http://{addr}")
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap()
    }

    async fn get_json(url: &str) -> (StatusCode, Value) {
        let res = client().get(url).send().await.unwrap();
        (res.status(), res.json().await.unwrap())
    }

    #[tokio::test]
    async fn record_route() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;
        let base = serve(&net).await;

        let (status, body) = get_json(&format!("{base}/at/{HANDLE}/app.bsky.feed.post/3k2a")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uri"], "at://did:plc:abc123/app.bsky.feed.post/3k2a");
        assert_eq!(body["identity"]["handle"]["status"], "verified");
        assert_eq!(body["record"]["value"]["text"], "post 3k2a");
        assert_eq!(body["verification"]["status"], "verified");

        let (_, body) = get_json(&format!(
            "{base}/at/did:plc:abc123/app.bsky.feed.post/3k2a?verify=false"
        ))
        .await;
        assert_eq!(body["verification"]["status"], "pending");
    }

    #[tokio::test]
    async fn verification_route_reports_failures() {
        let mut repo = RepoFixture::new("did:plc:abc123");
        repo.serve_tampered_proofs = true;
        let net = MockNetwork::start(repo).await;
        let base = serve(&net).await;

        let (status, body) = get_json(&format!(
            "{base}/at/did:plc:abc123/app.bsky.feed.post/3k2a/verification"
        ))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
    }

    #[tokio::test]
    async fn errors_carry_their_kind() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;
        let base = serve(&net).await;

        let (status, body) = get_json(&format!("{base}/at/not_a_handle")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidIdentifier");

        let (status, body) = get_json(&format!("{base}/at/did:plc:xyz999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "DidDocumentNotFound");

        let (status, body) = get_json(&format!("{base}/at/nobody.example.com")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "HandleResolutionFailed");
    }

    #[tokio::test]
    async fn identity_history_and_listing() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;
        let base = serve(&net).await;

        let (status, body) = get_json(&format!("{base}/at/did:plc:abc123")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["did"], "did:plc:abc123");
        assert_eq!(body["document"]["id"], "did:plc:abc123");
        assert_eq!(body["signingKey"], Value::from(net.repo.signing_key()));

        let (_, body) = get_json(&format!("{base}/at/{HANDLE}/history")).await;
        assert_eq!(body["history"][0]["change"]["type"], "genesis");
        assert_eq!(body["history"][1]["change"]["type"], "update");

        let (_, body) = get_json(&format!("{base}/at/{HANDLE}/collections")).await;
        assert_eq!(body["collections"][0], "app.bsky.feed.post");

        let (_, body) = get_json(&format!("{base}/at/{HANDLE}/app.bsky.feed.post?limit=2")).await;
        assert_eq!(body["records"].as_array().map(Vec::len), Some(2));
        let cursor = body["cursor"].as_str().expect("should have a cursor").to_owned();

        let (_, next) = get_json(&format!(
            "{base}/at/{HANDLE}/app.bsky.feed.post?limit=2&cursor={cursor}"
        ))
        .await;
        assert_ne!(next["records"][0]["uri"], body["records"][0]["uri"]);
    }

    #[tokio::test]
    async fn redirects() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;
        let base = serve(&net).await;

        let res = client()
            .get(format!("{base}/at?u=at://{HANDLE}/app.bsky.feed.post/3k2a"))
            .send()
            .await
            .unwrap();
        assert!(res.status().is_redirection());
        assert_eq!(
            res.headers()[header::LOCATION],
            format!("/at/{HANDLE}/app.bsky.feed.post/3k2a")
        );

        let res = client()
            .get(format!("{base}/bsky?u=https://example.com/nope"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn blobs_keep_their_content_type() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;
        let base = serve(&net).await;

        let res = client()
            .get(format!("{base}/blob/{HANDLE}/bafkreiblob"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(res.bytes().await.unwrap().as_ref(), b"blob bafkreiblob");
    }

    #[tokio::test]
    async fn cache_invalidation() {
        let net = MockNetwork::start(RepoFixture::new("did:plc:abc123")).await;
        let base = serve(&net).await;

        let _ = get_json(&format!("{base}/at/{HANDLE}")).await;
        let res = client()
            .delete(format!("{base}/cache/{HANDLE}"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        // Resolution starts over from the lookups.
        let (status, body) = get_json(&format!("{base}/at/{HANDLE}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["handle"]["status"], "verified");
    }
}
