use bytes::Bytes;
use futures_util::future::LocalBoxFuture;

use crate::AnyResult;

/// Content addressed blob storage.
///
/// Blobs are returned whole; readers that need seeking wrap them in a
/// `std::io::Cursor`.
pub trait AssetStore: Send + Sync {
    fn get<'a>(&'a self, cid: &'a str) -> LocalBoxFuture<'a, AnyResult<Bytes>>;

    /// Whether the blob is already held locally.
    fn has_block<'a>(&'a self, cid: &'a str) -> LocalBoxFuture<'a, bool>;
}
