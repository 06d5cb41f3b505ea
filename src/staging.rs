//! Local staging of source objects between download and upload.

use std::{
    io::SeekFrom,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use sha2::{Digest, Sha256};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    task::JoinSet,
};

use crate::{
    config::{MigrationConfig, StagingStrategy},
    destination::UploadSource,
    error::DownloadError,
    source::{ByteRange, ObjectDescriptor, ObjectReader, SourceStore},
};

/// A staged local copy of one source object.
///
/// The file belongs to exactly one in-flight object and is deleted when the
/// value is released with [`StagedFile::remove`] or dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    bucket: String,
    key: String,
    released: bool,
}

impl StagedFile {
    fn new(path: PathBuf, object: &ObjectDescriptor) -> Self {
        Self {
            path,
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            released: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Deletes the staged file.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file exists but cannot be removed.
    pub async fn remove(mut self) -> std::io::Result<()> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to delete staged file."
                );
            }
        }
    }
}

/// A source object ready to be uploaded.
pub enum Staged {
    File(StagedFile),
    Stream(ObjectReader),
}

impl std::fmt::Debug for Staged {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl Staged {
    /// Splits into the bytes to upload and the local file to release
    /// afterwards, if any.
    #[must_use]
    pub fn into_upload(self) -> (UploadSource, Option<StagedFile>) {
        match self {
            Self::File(file) => (UploadSource::File(file.path.clone()), Some(file)),
            Self::Stream(reader) => (UploadSource::Reader(reader), None),
        }
    }
}

/// Splits `size` bytes into consecutive ranges of at most `part_size`.
#[must_use]
pub fn plan_parts(size: u64, part_size: u64) -> Vec<ByteRange> {
    let part_size = part_size.max(1);
    let mut parts = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + part_size).min(size) - 1;
        parts.push(ByteRange { start, end });
        start = end + 1;
    }
    parts
}

/// Copies source objects into the local staging tree.
#[derive(Clone)]
pub struct Stager {
    source: Arc<dyn SourceStore>,
    root: PathBuf,
    strategy: StagingStrategy,
    part_size: u64,
    workers: usize,
}

impl Stager {
    #[must_use]
    pub fn new(source: Arc<dyn SourceStore>, config: &MigrationConfig) -> Self {
        Self {
            source,
            root: config.staging_dir.join("tmp"),
            strategy: config.strategy,
            part_size: config.part_size,
            workers: config.download_workers,
        }
    }

    /// Directory holding every staged file of the run. Removed when the
    /// run ends; nothing else under the staging directory is touched.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging path for an object: `<staging>/tmp/<bucket>/<sha256 of key>`.
    ///
    /// Keys are hashed so that `a/b`, `a//b` and `a` never share a path or
    /// need a directory where another object has a file.
    ///
    /// # Errors
    ///
    /// Rejects an empty key or a bucket name that is not a single plain path
    /// component.
    pub fn staging_path(&self, bucket: &str, key: &str) -> Result<PathBuf, DownloadError> {
        let mut components = Path::new(bucket).components();
        let plain_bucket = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) && !bucket.contains(['/', '\\']);
        if !plain_bucket || key.is_empty() {
            return Err(DownloadError::UnsafeKey {
                path: self.root.join(bucket).join(key),
            });
        }
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        Ok(self.root.join(bucket).join(name))
    }

    /// Stages one object using the configured strategy.
    ///
    /// # Errors
    ///
    /// Any part failure yields a [`DownloadError`]; no partial file is left
    /// behind.
    pub async fn stage(&self, object: &ObjectDescriptor) -> Result<Staged, DownloadError> {
        match self.strategy {
            StagingStrategy::LocalDisk => Ok(Staged::File(self.download(object).await?)),
            StagingStrategy::Stream => Ok(Staged::Stream(
                self.source
                    .get_object(&object.bucket, &object.key, None)
                    .await?,
            )),
        }
    }

    async fn download(&self, object: &ObjectDescriptor) -> Result<StagedFile, DownloadError> {
        let path = self.staging_path(&object.bucket, &object.key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = File::create(&path).await?;
        let staged = StagedFile::new(path.clone(), object);
        file.set_len(object.size).await?;
        drop(file);

        tracing::debug!(
            bucket = object.bucket.as_str(),
            key = object.key.as_str(),
            path = %path.display(),
            "downloading."
        );

        let parts = Arc::new(plan_parts(object.size, self.part_size));
        let next = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();
        for _ in 0..self.workers.min(parts.len()) {
            let source = Arc::clone(&self.source);
            let parts = Arc::clone(&parts);
            let next = Arc::clone(&next);
            let path = path.clone();
            let bucket = object.bucket.clone();
            let key = object.key.clone();
            workers.spawn(async move {
                while let Some(range) = parts.get(next.fetch_add(1, Ordering::Relaxed)).copied() {
                    download_part(source.as_ref(), &bucket, &key, range, &path).await?;
                }
                Ok::<_, DownloadError>(())
            });
        }

        // every worker must report before the transfer counts as complete
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(|e| DownloadError::Worker(e.to_string()));
            if let Err(e) = result.and_then(|r| r) {
                if failure.is_none() {
                    workers.abort_all();
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(staged),
        }
    }
}

async fn download_part(
    source: &dyn SourceStore,
    bucket: &str,
    key: &str,
    range: ByteRange,
    path: &Path,
) -> Result<(), DownloadError> {
    let reader = source.get_object(bucket, key, Some(range)).await?;
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let copied = tokio::io::copy(&mut reader.take(range.len()), &mut file).await?;
    if copied != range.len() {
        return Err(DownloadError::ShortPart {
            offset: range.start,
            expected: range.len(),
            actual: copied,
        });
    }
    file.flush().await?;
    Ok(())
}
