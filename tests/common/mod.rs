use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use s3migrate::{
    destination::{
        local::{LocalAllocation, LocalStore},
        Allocation, CommitId, CommitRequest, Completion, DestinationStore, UploadReceipt,
        UploadRequest, UploadSource,
    },
    error::{DestinationError, SourceError},
    source::{memory::MemorySource, ByteRange, ObjectPage, ObjectReader, SourceStore},
    MigrationConfig,
};

pub const ALLOCATION: &str = "a1";

pub fn config(staging: &Path) -> s3migrate::config::MigrationConfigBuilder {
    MigrationConfig::builder(ALLOCATION)
        .staging_dir(staging)
        .part_size(8)
}

pub fn scenario_source() -> MemorySource {
    MemorySource::new(100)
        .with_object("b1", "a.txt", vec![b'a'; 10])
        .with_object("b1", "b.txt", vec![b'b'; 20])
}

/// Source wrapper that counts calls and fails selected operations.
pub struct FlakySource {
    inner: MemorySource,
    pub failing_gets: HashSet<String>,
    pub failing_listings: HashSet<String>,
    pub fail_buckets: bool,
    pub slow_gets: HashSet<String>,
    pub list_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
}

impl FlakySource {
    pub fn new(inner: MemorySource) -> Self {
        Self {
            inner,
            failing_gets: HashSet::new(),
            failing_listings: HashSet::new(),
            fail_buckets: false,
            slow_gets: HashSet::new(),
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_get(mut self, key: &str) -> Self {
        self.failing_gets.insert(key.to_string());
        self
    }

    pub fn fail_listing(mut self, bucket: &str) -> Self {
        self.failing_listings.insert(bucket.to_string());
        self
    }

    pub fn fail_bucket_listing(mut self) -> Self {
        self.fail_buckets = true;
        self
    }

    pub fn slow_get(mut self, key: &str) -> Self {
        self.slow_gets.insert(key.to_string());
        self
    }
}

#[async_trait]
impl SourceStore for FlakySource {
    async fn list_buckets(&self) -> Result<Vec<String>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_buckets {
            return Err(SourceError::ListBuckets {
                source: "injected bucket listing failure".into(),
            });
        }
        self.inner.list_buckets().await
    }

    async fn list_objects_page(
        &self,
        bucket: &str,
        token: Option<String>,
    ) -> Result<ObjectPage, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_listings.contains(bucket) {
            return Err(SourceError::ListObjects {
                bucket: bucket.to_string(),
                source: "injected listing failure".into(),
            });
        }
        self.inner.list_objects_page(bucket, token).await
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectReader, SourceError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_gets.contains(key) {
            return Err(SourceError::GetObject {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: "injected download failure".into(),
            });
        }
        if self.slow_gets.contains(key) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.get_object(bucket, key, range).await
    }
}

/// Allocation wrapper that fails selected uploads, every commit or the file
/// tree listing, and checks that earlier staged files are gone before each new upload.
pub struct CheckedAllocation {
    inner: LocalAllocation,
    failing_uploads: HashSet<String>,
    fail_commits: bool,
    fail_tree: bool,
    seen_staged: Mutex<Vec<PathBuf>>,
    pub leaked: AtomicUsize,
    pub uploads: AtomicUsize,
}

#[async_trait]
impl Allocation for CheckedAllocation {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn list_file_tree(
        &self,
        excluded: &HashSet<String>,
    ) -> Result<BTreeMap<String, u64>, DestinationError> {
        if self.fail_tree {
            return Err(DestinationError::Io(std::io::Error::other(
                "injected file tree failure",
            )));
        }
        self.inner.list_file_tree(excluded).await
    }

    async fn upload(
        &self,
        request: UploadRequest,
    ) -> Result<Completion<UploadReceipt>, DestinationError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        {
            let mut seen = self.seen_staged.lock().unwrap();
            let leaked = seen.iter().filter(|path| path.exists()).count();
            self.leaked.fetch_add(leaked, Ordering::SeqCst);
            if let UploadSource::File(path) = &request.source {
                seen.push(path.clone());
            }
        }
        if self.failing_uploads.contains(&request.remote_path) {
            return Err(DestinationError::Io(std::io::Error::other(
                "injected upload failure",
            )));
        }
        self.inner.upload(request).await
    }

    async fn commit_metadata(
        &self,
        request: CommitRequest,
    ) -> Result<Completion<CommitId>, DestinationError> {
        if self.fail_commits {
            return Err(DestinationError::Io(std::io::Error::other(
                "injected commit failure",
            )));
        }
        self.inner.commit_metadata(request).await
    }
}

impl CheckedAllocation {
    /// Staged files seen by earlier uploads that still exist.
    pub fn leaked_now(&self) -> usize {
        self.seen_staged
            .lock()
            .unwrap()
            .iter()
            .filter(|path| path.exists())
            .count()
    }
}

/// Destination handing out one shared [`CheckedAllocation`].
pub struct CheckedDestination {
    pub allocation: Arc<CheckedAllocation>,
}

impl CheckedDestination {
    pub async fn new(root: &Path, failing_uploads: &[&str], fail_commits: bool) -> Self {
        Self::build(root, failing_uploads, fail_commits, false).await
    }

    /// Destination whose file tree cannot be listed.
    pub async fn with_unreadable_tree(root: &Path) -> Self {
        Self::build(root, &[], false, true).await
    }

    async fn build(
        root: &Path,
        failing_uploads: &[&str],
        fail_commits: bool,
        fail_tree: bool,
    ) -> Self {
        let inner = LocalStore::new(root)
            .create_allocation(ALLOCATION)
            .await
            .unwrap();
        Self {
            allocation: Arc::new(CheckedAllocation {
                inner,
                failing_uploads: failing_uploads.iter().map(ToString::to_string).collect(),
                fail_commits,
                fail_tree,
                seen_staged: Mutex::new(Vec::new()),
                leaked: AtomicUsize::new(0),
                uploads: AtomicUsize::new(0),
            }),
        }
    }
}

#[async_trait]
impl DestinationStore for CheckedDestination {
    async fn get_allocation(&self, id: &str) -> Result<Arc<dyn Allocation>, DestinationError> {
        if id == ALLOCATION {
            let allocation: Arc<dyn Allocation> = self.allocation.clone();
            Ok(allocation)
        } else {
            Err(DestinationError::AllocationNotFound { id: id.to_string() })
        }
    }
}
