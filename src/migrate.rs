//! Migration orchestrator.
//!
//! Drives the whole run: resolve the allocation and build the index of what
//! already exists, then for every enumerated object skip, stage, upload and
//! clean up. Only setup failures end the run early; everything that goes
//! wrong with a single object is logged and counted in the
//! [`MigrationReport`].

use std::{fmt, sync::Arc};

use futures::StreamExt;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::{
    config::MigrationConfig,
    destination::{CommitOperation, DestinationStore},
    error::{BucketListError, ObjectError, SetupError},
    index::{ExistingFileIndex, IndexMatch},
    source::{list_objects, resolve_buckets, ObjectDescriptor, SourceStore},
    staging::Stager,
    upload::{UploadOutcome, UploadService},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Already on the destination with the same size.
    AlreadyPresent,
    /// A zero-byte `prefix/` placeholder, not a real file.
    DirectoryMarker,
}

/// What happened to one source object.
#[derive(Debug)]
pub enum ObjectOutcome {
    Skipped(SkipReason),
    Migrated {
        outcome: UploadOutcome,
        /// The destination held a copy of a different size.
        replaced: bool,
    },
    Failed(ObjectError),
}

/// Run-level counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Uploaded objects, including those whose commit failed.
    pub migrated: u64,
    /// Subset of `migrated` that overwrote a differently sized copy.
    pub replaced: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Subset of `migrated` that still needs a commit.
    pub commit_failed: u64,
    /// Destination paths of failed objects.
    pub failed_paths: Vec<String>,
    /// Destination paths uploaded without a successful commit.
    pub commit_retry_paths: Vec<String>,
    /// Buckets whose enumeration was aborted.
    pub failed_buckets: Vec<String>,
    /// The run was stopped by the operator before it finished.
    pub cancelled: bool,
}

impl MigrationReport {
    pub fn record(&mut self, remote_path: &str, outcome: &ObjectOutcome) {
        match outcome {
            ObjectOutcome::Skipped(_) => self.skipped += 1,
            ObjectOutcome::Migrated { outcome, replaced } => {
                self.migrated += 1;
                if *replaced {
                    self.replaced += 1;
                }
                if outcome.needs_commit_retry() {
                    self.commit_failed += 1;
                    self.commit_retry_paths.push(remote_path.to_string());
                }
            }
            ObjectOutcome::Failed(_) => {
                self.failed += 1;
                self.failed_paths.push(remote_path.to_string());
            }
        }
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.migrated + self.skipped + self.failed
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} migrated ({} replaced), {} skipped, {} failed, {} awaiting commit retry",
            self.migrated, self.replaced, self.skipped, self.failed, self.commit_failed
        )?;
        if !self.failed_buckets.is_empty() {
            write!(f, ", {} bucket(s) not fully listed", self.failed_buckets.len())?;
        }
        if self.cancelled {
            f.write_str(", cancelled")?;
        }
        Ok(())
    }
}

/// Per-run collaborators shared by every object.
struct RunContext {
    index: ExistingFileIndex,
    stager: Stager,
    uploader: UploadService,
}

pub struct Migrator {
    config: MigrationConfig,
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    cancel: CancellationToken,
}

impl Migrator {
    #[must_use]
    pub fn new(
        config: MigrationConfig,
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops pulling new objects once `token` is cancelled. In-flight
    /// objects still finish and are cleaned up.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Runs the migration to completion.
    ///
    /// # Errors
    ///
    /// Only setup failures are returned: unreachable allocation, index build
    /// failure, bucket resolution failure, or an unusable staging directory.
    pub async fn run(&self) -> Result<MigrationReport, SetupError> {
        let config = &self.config;
        tracing::info!(allocation = config.allocation_id.as_str(), "starting migration.");

        let allocation = self
            .destination
            .get_allocation(&config.allocation_id)
            .await
            .map_err(|source| SetupError::Allocation {
                id: config.allocation_id.clone(),
                source,
            })?;
        let index = ExistingFileIndex::build(allocation.as_ref(), &config.excluded_names).await?;
        let buckets = resolve_buckets(self.source.as_ref(), &config.buckets).await?;

        fs::create_dir_all(&config.staging_dir)
            .await
            .map_err(|source| SetupError::Staging {
                path: config.staging_dir.clone(),
                source,
            })?;

        let ctx = RunContext {
            index,
            stager: Stager::new(Arc::clone(&self.source), config),
            uploader: UploadService::new(allocation, config),
        };

        let mut report = MigrationReport::default();
        for bucket in &buckets {
            if self.cancel.is_cancelled() {
                break;
            }
            self.migrate_bucket(bucket, &ctx, &mut report).await;
        }
        report.cancelled = self.cancel.is_cancelled();

        let staged_root = ctx.stager.root();
        tracing::info!(path = %staged_root.display(), "delete local path.");
        if let Err(e) = fs::remove_dir_all(staged_root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %staged_root.display(),
                    error = %e,
                    "failed to delete staging directory."
                );
            }
        }

        tracing::info!(
            migrated = report.migrated,
            replaced = report.replaced,
            skipped = report.skipped,
            failed = report.failed,
            commit_failed = report.commit_failed,
            cancelled = report.cancelled,
            "migration done: {report}"
        );
        Ok(report)
    }

    async fn migrate_bucket(&self, bucket: &str, ctx: &RunContext, report: &mut MigrationReport) {
        tracing::info!(bucket, "processing bucket.");

        let results = list_objects(self.source.as_ref(), bucket)
            .take_until(self.cancel.cancelled())
            .map(|item| async move {
                let object = item?;
                let remote_path = self.config.remote_path(&object.bucket, &object.key);
                let outcome = self.process_object(&object, &remote_path, ctx).await;
                Ok::<_, BucketListError>((object, remote_path, outcome))
            })
            .buffer_unordered(self.config.object_workers);
        // the cancellation future is !Unpin
        let mut results = std::pin::pin!(results);

        while let Some(result) = results.next().await {
            match result {
                Ok((object, remote_path, outcome)) => {
                    log_outcome(&object, &remote_path, &outcome);
                    report.record(&remote_path, &outcome);
                }
                Err(e) => {
                    tracing::error!(bucket, error = %e, "bucket listing aborted.");
                    report.failed_buckets.push(bucket.to_string());
                }
            }
        }
    }

    async fn process_object(
        &self,
        object: &ObjectDescriptor,
        remote_path: &str,
        ctx: &RunContext,
    ) -> ObjectOutcome {
        if object.key.ends_with('/') {
            return ObjectOutcome::Skipped(SkipReason::DirectoryMarker);
        }

        let replaced = match ctx.index.lookup(remote_path, object.size) {
            IndexMatch::Present => return ObjectOutcome::Skipped(SkipReason::AlreadyPresent),
            IndexMatch::SizeMismatch { recorded } => {
                tracing::warn!(
                    bucket = object.bucket.as_str(),
                    key = object.key.as_str(),
                    source_size = object.size,
                    destination_size = recorded,
                    "size differs from existing copy, re-uploading."
                );
                true
            }
            IndexMatch::Missing => false,
        };

        let transfer = transfer(object, remote_path, replaced, ctx);
        let result = match self.config.object_timeout {
            Some(limit) => tokio::time::timeout(limit, transfer)
                .await
                .unwrap_or(Err(ObjectError::Timeout(limit))),
            None => transfer.await,
        };

        match result {
            Ok(outcome) => ObjectOutcome::Migrated { outcome, replaced },
            Err(e) => ObjectOutcome::Failed(e),
        }
    }
}

/// Stage, upload, then release the staged file on every path.
async fn transfer(
    object: &ObjectDescriptor,
    remote_path: &str,
    replaced: bool,
    ctx: &RunContext,
) -> Result<UploadOutcome, ObjectError> {
    let staged = ctx.stager.stage(object).await?;
    let (source, staged_file) = staged.into_upload();

    let operation = if replaced {
        CommitOperation::Update
    } else {
        CommitOperation::Upload
    };
    let result = ctx
        .uploader
        .upload(source, remote_path, Some(object.size), operation)
        .await;

    if let Some(file) = staged_file {
        let path = file.path().to_path_buf();
        if let Err(e) = file.remove().await {
            tracing::warn!(path = %path.display(), error = %e, "file delete error.");
        }
    }
    result
}

fn log_outcome(object: &ObjectDescriptor, remote_path: &str, outcome: &ObjectOutcome) {
    let bucket = object.bucket.as_str();
    let key = object.key.as_str();
    let size = object.size;
    match outcome {
        ObjectOutcome::Skipped(reason) => {
            tracing::info!(
                bucket,
                key,
                size,
                remote = remote_path,
                reason = ?reason,
                outcome = "skipped",
                "object skipped."
            );
        }
        ObjectOutcome::Migrated { outcome, replaced } => {
            let commit = outcome.commit_id().map(ToString::to_string);
            if outcome.needs_commit_retry() {
                tracing::warn!(
                    bucket,
                    key,
                    size,
                    remote = remote_path,
                    replaced,
                    outcome = "commit_failed",
                    "object uploaded, commit failed."
                );
            } else {
                tracing::info!(
                    bucket,
                    key,
                    size,
                    remote = remote_path,
                    hash = outcome.receipt.content_hash.as_str(),
                    replaced,
                    commit = commit.as_deref(),
                    outcome = "migrated",
                    "object migrated."
                );
            }
        }
        ObjectOutcome::Failed(e) => {
            tracing::warn!(
                bucket,
                key,
                size,
                remote = remote_path,
                error = %e,
                outcome = "failed",
                "object failed."
            );
        }
    }
}
