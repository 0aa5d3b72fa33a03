//! AT Protocol identity resolution and record verification.
pub mod cache;
pub mod car;
pub mod config;
pub mod did;
mod endpoints;
pub mod error;
pub mod handle;
pub mod identity;
pub mod inspect;
mod metrics;
pub mod mst;
pub mod plc;
mod serve;
pub mod syntax;
pub mod verify;
pub mod xrpc;


pub use serve::{APP_USER_AGENT, AppState, Client, Error, Result, build_inspector, run};
