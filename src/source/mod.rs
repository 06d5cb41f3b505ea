//! Source object store: bucket resolution and lazy, paginated enumeration.

pub mod memory;
pub mod s3;

use std::pin::Pin;

use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use tokio::io::AsyncRead;

use crate::error::{BucketListError, SetupError, SourceError};

/// Live byte stream of (part of) a source object.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// One enumerated source object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

/// A single page of a bucket listing.
#[derive(Debug, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectDescriptor>,
    /// Present while the source reports more pages.
    pub next_token: Option<String>,
}

/// Inclusive byte range, as used by HTTP `Range` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end < self.start
    }

    #[must_use]
    pub fn header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<String>, SourceError>;

    /// Fetches one page of `bucket`, starting after `token` when given.
    async fn list_objects_page(
        &self,
        bucket: &str,
        token: Option<String>,
    ) -> Result<ObjectPage, SourceError>;

    /// Opens the object body, or only `range` of it.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectReader, SourceError>;
}

/// Returns the configured buckets, or every visible bucket when none are
/// configured.
///
/// # Errors
///
/// Fails with [`SetupError::BucketResolution`] if the listing fails and
/// [`SetupError::NoBuckets`] if nothing is visible.
pub async fn resolve_buckets(
    source: &dyn SourceStore,
    configured: &[String],
) -> Result<Vec<String>, SetupError> {
    if !configured.is_empty() {
        return Ok(configured.to_vec());
    }

    tracing::info!("bucket list not provided, migrating all visible buckets.");
    let buckets = source
        .list_buckets()
        .await
        .map_err(SetupError::BucketResolution)?;
    if buckets.is_empty() {
        return Err(SetupError::NoBuckets);
    }
    for bucket in &buckets {
        tracing::info!(bucket = bucket.as_str(), "found bucket.");
    }
    Ok(buckets)
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Lazily enumerates every object of `bucket`, one page at a time.
///
/// The stream is single pass. A page failure is yielded once as a
/// [`BucketListError`] and ends the stream.
pub fn list_objects<'a>(
    source: &'a dyn SourceStore,
    bucket: &'a str,
) -> BoxStream<'a, Result<ObjectDescriptor, BucketListError>> {
    stream::try_unfold(Cursor::Start, move |cursor| async move {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Done => return Ok(None),
        };
        let page = source
            .list_objects_page(bucket, token)
            .await
            .map_err(|source| BucketListError {
                bucket: bucket.to_string(),
                source,
            })?;
        tracing::debug!(bucket, objects = page.objects.len(), "fetched page.");
        let next = page.next_token.map_or(Cursor::Done, Cursor::Next);
        Ok::<_, BucketListError>(Some((page.objects, next)))
    })
    .map_ok(|objects| stream::iter(objects.into_iter().map(Ok::<_, BucketListError>)))
    .try_flatten()
    .boxed()
}
