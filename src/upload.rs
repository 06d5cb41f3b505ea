use std::sync::Arc;

use crate::{
    config::{MigrationConfig, ReadPayer},
    destination::{
        Allocation, CommitId, CommitOperation, CommitRequest, FileAttributes, FileMeta,
        UploadReceipt, UploadRequest, UploadSource,
    },
    error::{ConfigError, DestinationError, ObjectError},
};

/// Result of the optional metadata commit that follows an upload.
#[derive(Debug)]
pub enum CommitStatus {
    NotRequested,
    Committed(CommitId),
    /// The upload succeeded but the commit did not; retry the commit only.
    Failed(DestinationError),
}

/// A confirmed upload, plus what happened to its commit.
#[derive(Debug)]
pub struct UploadOutcome {
    pub receipt: UploadReceipt,
    pub commit: CommitStatus,
}

impl UploadOutcome {
    #[must_use]
    pub fn commit_id(&self) -> Option<&CommitId> {
        match &self.commit {
            CommitStatus::Committed(id) => Some(id),
            _ => None,
        }
    }

    #[must_use]
    pub const fn needs_commit_retry(&self) -> bool {
        matches!(self.commit, CommitStatus::Failed(_))
    }
}

/// Pushes staged objects to one destination allocation.
#[derive(Clone)]
pub struct UploadService {
    allocation: Arc<dyn Allocation>,
    encrypt: bool,
    commit: bool,
    read_payer: Option<String>,
}

impl UploadService {
    #[must_use]
    pub fn new(allocation: Arc<dyn Allocation>, config: &MigrationConfig) -> Self {
        Self {
            allocation,
            encrypt: config.encrypt,
            commit: config.commit,
            read_payer: config.read_payer.clone(),
        }
    }

    /// Resolves the attribute policy applied to every uploaded file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidReadPayer`] for an unknown policy.
    pub fn attributes(&self) -> Result<FileAttributes, ConfigError> {
        let read_payer = self
            .read_payer
            .as_deref()
            .map(str::parse::<ReadPayer>)
            .transpose()?;
        Ok(FileAttributes { read_payer })
    }

    /// Uploads `source` to `remote_path` and waits for the destination to
    /// confirm it, then commits the metadata transaction when enabled.
    ///
    /// # Errors
    ///
    /// Fails on an invalid attribute policy or a rejected upload. A failed
    /// commit is not an error; it is reported in [`UploadOutcome::commit`].
    pub async fn upload(
        &self,
        source: UploadSource,
        remote_path: &str,
        expected_size: Option<u64>,
        operation: CommitOperation,
    ) -> Result<UploadOutcome, ObjectError> {
        let attributes = self.attributes()?;
        tracing::debug!(
            source = ?source,
            remote = remote_path,
            encrypt = self.encrypt,
            "uploading."
        );

        let signal = self
            .allocation
            .upload(UploadRequest {
                source,
                remote_path: remote_path.to_string(),
                attributes,
                encrypt: self.encrypt,
                expected_size,
            })
            .await
            .map_err(ObjectError::Upload)?;
        let receipt = signal.wait().await.map_err(ObjectError::Upload)?;

        let commit = if self.commit {
            self.commit(&receipt, operation).await
        } else {
            CommitStatus::NotRequested
        };

        Ok(UploadOutcome { receipt, commit })
    }

    async fn commit(&self, receipt: &UploadReceipt, operation: CommitOperation) -> CommitStatus {
        let name = receipt
            .remote_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let request = CommitRequest {
            remote_path: receipt.remote_path.clone(),
            operation,
            auth_ticket: None,
            lookup_hash: None,
            file_meta: Some(FileMeta {
                name,
                path: receipt.remote_path.clone(),
                size: receipt.size,
                content_hash: receipt.content_hash.clone(),
                encrypted: self.encrypt,
            }),
        };

        let result = match self.allocation.commit_metadata(request).await {
            Ok(signal) => signal.wait().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(id) => CommitStatus::Committed(id),
            Err(e) => {
                tracing::warn!(
                    remote = receipt.remote_path.as_str(),
                    error = %e,
                    "commit failed after successful upload."
                );
                CommitStatus::Failed(e)
            }
        }
    }
}
