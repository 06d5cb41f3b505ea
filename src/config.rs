use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Local scratch root used when none is configured.
pub const DEFAULT_STAGING_DIR: &str = "/tmp/migration/s3";

/// Fixed part size for partitioned downloads (5 MiB).
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Number of concurrent part downloads per object.
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 4;

/// Region used when the operator does not provide one.
pub const DEFAULT_REGION: &str = "us-east-2";

/// Destination names that never count as existing files.
pub const DEFAULT_EXCLUDED_NAMES: &[&str] = &[".DS_Store", ".git"];

/// Who bears the cost of future reads of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadPayer {
    /// The uploader (allocation owner) pays.
    #[serde(rename = "owner")]
    Owner,
    /// Whoever downloads the file pays.
    #[serde(rename = "3rd_party")]
    ThirdParty,
}

impl FromStr for ReadPayer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" | "uploader" | "uploader-pays" => Ok(Self::Owner),
            "3rd_party" | "third-party" | "downloader" | "downloader-pays" => Ok(Self::ThirdParty),
            _ => Err(ConfigError::InvalidReadPayer {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ReadPayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner => f.write_str("owner"),
            Self::ThirdParty => f.write_str("3rd_party"),
        }
    }
}

/// How a source object is held between download and upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StagingStrategy {
    /// Partitioned download into a local scratch file.
    #[default]
    LocalDisk,
    /// Hand the live source body straight to the uploader.
    Stream,
}

/// Immutable settings for one migration run.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub region: String,
    /// Empty means "every bucket visible to the credentials".
    pub buckets: Vec<String>,
    pub allocation_id: String,
    pub commit: bool,
    pub encrypt: bool,
    /// Raw read payer policy; parsed per object by the upload service.
    pub read_payer: Option<String>,
    pub staging_dir: PathBuf,
    /// Prefix prepended to `/bucket/key` on the destination.
    pub remote_root: String,
    pub strategy: StagingStrategy,
    pub part_size: u64,
    pub download_workers: usize,
    pub object_workers: usize,
    pub object_timeout: Option<Duration>,
    pub excluded_names: Vec<String>,
}

impl MigrationConfig {
    pub fn builder(allocation_id: impl Into<String>) -> MigrationConfigBuilder {
        MigrationConfigBuilder::new(allocation_id)
    }

    /// Destination path for a source object, always rooted at `remote_root`.
    ///
    /// With the default root this is `/bucket/key`.
    #[must_use]
    pub fn remote_path(&self, bucket: &str, key: &str) -> String {
        let root = self.remote_root.trim_end_matches('/');
        let key = key.trim_start_matches('/');
        if root.is_empty() {
            format!("/{bucket}/{key}")
        } else if root.starts_with('/') {
            format!("{root}/{bucket}/{key}")
        } else {
            format!("/{root}/{bucket}/{key}")
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationConfigBuilder {
    config: MigrationConfig,
}

impl MigrationConfigBuilder {
    fn new(allocation_id: impl Into<String>) -> Self {
        Self {
            config: MigrationConfig {
                region: DEFAULT_REGION.to_string(),
                buckets: Vec::new(),
                allocation_id: allocation_id.into(),
                commit: false,
                encrypt: false,
                read_payer: None,
                staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
                remote_root: "/".to_string(),
                strategy: StagingStrategy::LocalDisk,
                part_size: DEFAULT_PART_SIZE,
                download_workers: DEFAULT_DOWNLOAD_WORKERS,
                object_workers: 1,
                object_timeout: None,
                excluded_names: DEFAULT_EXCLUDED_NAMES
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            },
        }
    }

    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = region.into();
        self
    }

    #[must_use]
    pub fn buckets(mut self, buckets: Vec<String>) -> Self {
        self.config.buckets = buckets;
        self
    }

    #[must_use]
    pub fn commit(mut self, commit: bool) -> Self {
        self.config.commit = commit;
        self
    }

    #[must_use]
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.config.encrypt = encrypt;
        self
    }

    #[must_use]
    pub fn read_payer(mut self, read_payer: Option<String>) -> Self {
        self.config.read_payer = read_payer.filter(|s| !s.is_empty());
        self
    }

    #[must_use]
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = dir.into();
        self
    }

    #[must_use]
    pub fn remote_root(mut self, root: impl Into<String>) -> Self {
        self.config.remote_root = root.into();
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: StagingStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    #[must_use]
    pub fn part_size(mut self, part_size: u64) -> Self {
        self.config.part_size = part_size;
        self
    }

    #[must_use]
    pub fn download_workers(mut self, workers: usize) -> Self {
        self.config.download_workers = workers;
        self
    }

    #[must_use]
    pub fn object_workers(mut self, workers: usize) -> Self {
        self.config.object_workers = workers;
        self
    }

    #[must_use]
    pub fn object_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.object_timeout = timeout;
        self
    }

    #[must_use]
    pub fn excluded_names(mut self, names: Vec<String>) -> Self {
        self.config.excluded_names = names;
        self
    }

    /// Validates and freezes the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the allocation id is empty or a size or
    /// worker count is zero.
    pub fn build(self) -> Result<MigrationConfig, ConfigError> {
        let config = self.config;
        if config.allocation_id.trim().is_empty() {
            return Err(ConfigError::MissingAllocation);
        }
        if config.part_size == 0 {
            return Err(ConfigError::ZeroPartSize);
        }
        if config.download_workers == 0 {
            return Err(ConfigError::ZeroWorkers {
                name: "download workers",
            });
        }
        if config.object_workers == 0 {
            return Err(ConfigError::ZeroWorkers {
                name: "object workers",
            });
        }
        Ok(config)
    }
}
