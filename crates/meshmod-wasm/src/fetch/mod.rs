//! Module transport.
//!
//! The coordinator only needs "bytes for a URI, optionally authenticated";
//! [`ModuleFetcher`] is that seam. [`HttpFetcher`] is the production
//! implementation. Timeouts are enforced by the caller, not the fetcher.

use async_trait::async_trait;

use crate::error::WasmResult;

mod http;
pub(crate) mod unbox;

pub use http::{HttpFetcher, FETCHER_USER_AGENT};

/// Retrieves raw module bytes.
#[async_trait]
pub trait ModuleFetcher: Send + Sync + std::fmt::Debug {
    /// Fetch `uri`, authenticating with `pull_secret` when present.
    ///
    /// The returned bytes are exactly what the server sent; unboxing and
    /// checksum verification happen in the caller.
    async fn fetch(&self, uri: &str, pull_secret: Option<&[u8]>) -> WasmResult<Vec<u8>>;
}
