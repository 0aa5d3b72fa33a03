use axum::{Router, extract::Query, http::StatusCode, response::Redirect, routing::get};
use serde::Deserialize;
use url::Url;

use crate::{Error, Result, error::ResolveError, syntax::AtUri};

#[derive(Deserialize, Debug)]
struct UriQuery {
    u: String,
}

/// The browse path of a `bsky.app` post URL, e.g.
/// `https://bsky.app/profile/alice.example.com/post/3k2a`.
pub(crate) fn bsky_post_path(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    if url.host_str() != Some("bsky.app") {
        return None;
    }

    let segments: Vec<_> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["profile", identifier, "post", rkey] => {
            Some(format!("/at/{identifier}/app.bsky.feed.post/{rkey}"))
        }
        _ => None,
    }
}

async fn at_uri(Query(input): Query<UriQuery>) -> Result<Redirect> {
    let uri: AtUri = input.u.trim().parse().map_err(ResolveError::from)?;
    Ok(Redirect::to(&uri.browse_path()))
}

async fn bsky(Query(input): Query<UriQuery>) -> Result<Redirect> {
    let path = bsky_post_path(input.u.trim()).ok_or_else(|| {
        Error::with_status(
            StatusCode::BAD_REQUEST,
            anyhow::anyhow!("not a bsky.app post URL: {}", input.u),
        )
    })?;
    Ok(Redirect::to(&path))
}

#[rustfmt::skip]
pub(super) fn routes<S: Clone + Send + Sync + 'static>() -> Router<S> {
    Router::new()
        .route("/at",   get(at_uri))
        .route("/bsky", get(bsky))
}
