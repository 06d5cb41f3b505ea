use std::{path::PathBuf, time::Duration};

/// Boxed transport error from the AWS SDK or another collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid migration settings or per-object attribute policy.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("allocation id must not be empty")]
    MissingAllocation,

    #[error("part size must be greater than zero")]
    ZeroPartSize,

    #[error("{name} must be at least 1")]
    ZeroWorkers { name: &'static str },

    #[error("invalid read payer policy {value:?}, expected one of: owner, 3rd_party")]
    InvalidReadPayer { value: String },
}

/// Errors raised by the source object store.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to list buckets: {source}")]
    ListBuckets { source: BoxError },

    #[error("failed to list objects in s3://{bucket}: {source}")]
    ListObjects { bucket: String, source: BoxError },

    #[error("failed to get s3://{bucket}/{key}: {source}")]
    GetObject {
        bucket: String,
        key: String,
        source: BoxError,
    },

    #[error("no such bucket: {bucket}")]
    NoSuchBucket { bucket: String },

    #[error("no such key: s3://{bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },
}

/// Pagination failure for one bucket. Aborts that bucket only.
#[derive(Debug, thiserror::Error)]
#[error("unable to list items in bucket {bucket}: {source}")]
pub struct BucketListError {
    pub bucket: String,
    #[source]
    pub source: SourceError,
}

/// Errors raised by the destination storage.
#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("allocation {id} not found")]
    AllocationNotFound { id: String },

    #[error("allocation {id} already exists")]
    AllocationExists { id: String },

    #[error("file {path} is not present in the allocation")]
    UnknownFile { path: String },

    #[error("size mismatch for {path}: expected {expected} bytes, received {actual}")]
    Integrity {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("corrupt allocation metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("completion signal dropped before it was resolved")]
    CompletionDropped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure while staging a single object.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortPart {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("staging path {path} escapes the staging root")]
    UnsafeKey { path: PathBuf },

    #[error("download worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-object failure. Caught at the orchestrator boundary and counted.
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("upload error: {0}")]
    Upload(#[source] DestinationError),

    #[error("object processing timed out after {0:?}")]
    Timeout(Duration),
}

/// Fatal setup failures. These abort the run before any object is touched.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("error fetching the allocation {id}: {source}")]
    Allocation {
        id: String,
        #[source]
        source: DestinationError,
    },

    #[error("error building the existing file index: {0}")]
    IndexBuild(#[source] DestinationError),

    #[error("unable to resolve source buckets: {0}")]
    BucketResolution(#[source] SourceError),

    #[error("no source buckets visible to the configured credentials")]
    NoBuckets,

    #[error("unable to prepare staging directory {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
