//! Destination storage: allocations, uploads and metadata commits.
//!
//! Uploads and commits are asynchronous on the destination side. Both hand
//! back a [`Completion`], a one-shot signal the destination resolves exactly
//! once; callers block on [`Completion::wait`] before looking at the result.

pub mod local;

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{config::ReadPayer, error::DestinationError, source::ObjectReader};

/// Receiving half of a one-shot completion signal.
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, DestinationError>>,
}

/// Resolving half of a one-shot completion signal. Consumed on use.
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<Result<T, DestinationError>>,
}

#[must_use]
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Completion { rx })
}

impl<T> Completer<T> {
    pub fn resolve(self, result: Result<T, DestinationError>) {
        // the waiter may have given up (timeout); nothing to report to
        let _ = self.tx.send(result);
    }
}

impl<T> Completion<T> {
    /// Blocks until the destination resolves the signal.
    ///
    /// # Errors
    ///
    /// Returns the destination's error, or
    /// [`DestinationError::CompletionDropped`] if the resolver went away.
    pub async fn wait(self) -> Result<T, DestinationError> {
        self.rx
            .await
            .map_err(|_| DestinationError::CompletionDropped)?
    }
}

/// Attributes stored with an uploaded file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub read_payer: Option<ReadPayer>,
}

/// Bytes to push to the destination.
pub enum UploadSource {
    /// A staged local file.
    File(PathBuf),
    /// A live source stream.
    Reader(ObjectReader),
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

#[derive(Debug)]
pub struct UploadRequest {
    pub source: UploadSource,
    pub remote_path: String,
    pub attributes: FileAttributes,
    pub encrypt: bool,
    /// When set, the destination rejects uploads of any other length.
    pub expected_size: Option<u64>,
}

/// Confirmation of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub remote_path: String,
    pub size: u64,
    /// Hex SHA-256 of the stored bytes.
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOperation {
    Upload,
    Update,
}

impl fmt::Display for CommitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("Upload"),
            Self::Update => f.write_str("Update"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub content_hash: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub remote_path: String,
    pub operation: CommitOperation,
    pub auth_ticket: Option<String>,
    pub lookup_hash: Option<String>,
    pub file_meta: Option<FileMeta>,
}

/// Identifier of a committed metadata transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId(pub String);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn get_allocation(&self, id: &str) -> Result<Arc<dyn Allocation>, DestinationError>;
}

/// A provisioned storage space on the destination.
#[async_trait]
pub trait Allocation: Send + Sync {
    fn id(&self) -> &str;

    /// Walks the file tree once, returning path to size for every file not
    /// under an excluded name.
    async fn list_file_tree(
        &self,
        excluded: &HashSet<String>,
    ) -> Result<BTreeMap<String, u64>, DestinationError>;

    async fn upload(
        &self,
        request: UploadRequest,
    ) -> Result<Completion<UploadReceipt>, DestinationError>;

    async fn commit_metadata(
        &self,
        request: CommitRequest,
    ) -> Result<Completion<CommitId>, DestinationError>;
}

/// True when any component of `path` is one of the excluded names.
#[must_use]
pub fn is_excluded(path: &str, excluded: &HashSet<String>) -> bool {
    path.split('/')
        .filter(|part| !part.is_empty())
        .any(|part| excluded.contains(part))
}
