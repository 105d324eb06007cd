use std::{sync::Arc, time::Duration};

use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // resolution
    #[error("no match found for {0}")]
    NoMatch(String),
    #[error("serviceable for {0} does not exist in cache")]
    NotFound(String),
    #[error("resolving {matcher} returned {count} serviceables, expected exactly one")]
    Ambiguous { matcher: String, count: usize },
    #[error("invalid naming path: {0}")]
    InvalidPath(String),
    #[error("fetching `{path}` failed with: {source}")]
    Fetch {
        path: String,
        #[source]
        source: AnyError,
    },

    // validation
    #[error("validating domain `{host}` failed with: {source}")]
    Domain {
        host: String,
        #[source]
        source: AnyError,
    },
    #[error("cached serviceable `{id}` pinned to commit `{cached}` is outdated, latest is `{latest}`")]
    Stale {
        id: String,
        cached: String,
        latest: String,
    },

    // provisioning
    #[error("provisioning `{id}` failed with: {source}")]
    Provision {
        id: String,
        #[source]
        source: Box<Error>,
    },
    #[error("serviceable is not ready: {0}")]
    NotReady(Arc<Error>),
    #[error("loading asset `{asset}` failed with: {source}")]
    Asset {
        asset: String,
        #[source]
        source: AnyError,
    },
    #[error("creating execution instance failed with: {0}")]
    Instantiate(#[source] AnyError),

    // execution
    #[error("module `{module}` has no function `{entry}`")]
    ModuleNotFound { module: String, entry: String },
    #[error("calling event `{event}` failed with: {source}")]
    Call {
        event: u32,
        #[source]
        source: AnyError,
    },
    #[error("event `{event}` timed out after {timeout:?}")]
    Timeout { event: u32, timeout: Duration },

    #[error("node is shut down")]
    Closed,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid config: {0}")]
    Config(String),
}
