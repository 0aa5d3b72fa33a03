use axum::{Router, extract::State, response::IntoResponse, routing::get};

use crate::{
    AppState,
    handle::{TxtLookup, WellKnownLookup},
};

mod browse;
mod redirect;

/// The index (/) route.
async fn index<T, W>(State(state): State<AppState<T, W>>) -> impl IntoResponse {
    format!(
        r"This is an AT Protocol identity and record inspector.

Routes:
  GET    /at?u=<at-uri>                                 redirect to the browse path of an AT URI
  GET    /bsky?u=<bsky.app post URL>                    redirect to the browse path of a post
  GET    /at/<identifier>                               resolve a handle or DID
  GET    /at/<identifier>/history                       PLC operation history
  GET    /at/<identifier>/collections                   repository collections
  GET    /at/<identifier>/<collection>?cursor=&limit=   list records
  GET    /at/<identifier>/<collection>/<rkey>?verify=   fetch (and verify) a record
  GET    /at/<identifier>/<collection>/<rkey>/verification
  GET    /blob/<identifier>/<cid>                       download a blob
  DELETE /cache/<identifier>                            forget cached resolution state

PLC directory: {}
",
        state.config.plc_directory
    )
}

pub fn routes<T, W>() -> Router<AppState<T, W>>
where
    T: TxtLookup + 'static,
    W: WellKnownLookup + 'static,
{
    Router::new()
        .route("/", get(index::<T, W>))
        .merge(redirect::routes())
        .merge(browse::routes())
}
