//! Filesystem-backed, content-addressed allocation store.
//!
//! Layout of one allocation:
//!
//! ```text
//! <root>/<allocation-id>/
//!     manifest.json     path -> size, content hash, attributes
//!     allocation.key    hex ChaCha20-Poly1305 key for encrypted uploads
//!     commits.jsonl     append-only metadata transaction log
//!     blobs/<sha256>    stored bytes, deduplicated by hash
//!     tmp/              in-flight uploads
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, ChaCha20Poly1305, Key, Nonce,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};

use super::{
    completion, is_excluded, Allocation, CommitId, CommitOperation, CommitRequest, Completion,
    DestinationStore, FileMeta, UploadReceipt, UploadRequest, UploadSource,
};
use crate::{config::ReadPayer, error::DestinationError, source::ObjectReader};

/// Plaintext chunk size for the encrypting upload path.
const CHUNK_SIZE: usize = 64 * 1024;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const MANIFEST_FILE: &str = "manifest.json";
const KEY_FILE: &str = "allocation.key";
const COMMIT_LOG: &str = "commits.jsonl";

/// One stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Plaintext size in bytes.
    pub size: u64,
    pub content_hash: String,
    pub encrypted: bool,
    pub read_payer: Option<ReadPayer>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    files: BTreeMap<String, FileEntry>,
}

/// A line of `commits.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub operation: CommitOperation,
    pub remote_path: String,
    pub content_hash: String,
    pub auth_ticket: Option<String>,
    pub lookup_hash: Option<String>,
    pub file_meta: Option<FileMeta>,
    pub committed_at: DateTime<Utc>,
}

/// Root directory holding any number of allocations.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn allocation_dir(&self, id: &str) -> Result<PathBuf, DestinationError> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\']);
        if valid {
            Ok(self.root.join(id))
        } else {
            Err(DestinationError::AllocationNotFound { id: id.to_string() })
        }
    }

    /// Provisions a new, empty allocation.
    ///
    /// # Errors
    ///
    /// Fails if the allocation already exists or the directory cannot be
    /// written.
    pub async fn create_allocation(&self, id: &str) -> Result<LocalAllocation, DestinationError> {
        let dir = self.allocation_dir(id)?;
        if fs::try_exists(dir.join(MANIFEST_FILE)).await? {
            return Err(DestinationError::AllocationExists { id: id.to_string() });
        }
        fs::create_dir_all(dir.join("blobs")).await?;
        fs::create_dir_all(dir.join("tmp")).await?;

        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        fs::write(dir.join(KEY_FILE), hex::encode(key)).await?;
        write_manifest(&dir, &Manifest::default()).await?;

        tracing::info!(allocation = id, path = %dir.display(), "created allocation.");
        LocalAllocation::open(id, dir).await
    }

    /// Opens an existing allocation.
    ///
    /// # Errors
    ///
    /// Returns [`DestinationError::AllocationNotFound`] when no allocation
    /// with this id exists.
    pub async fn open_allocation(&self, id: &str) -> Result<LocalAllocation, DestinationError> {
        let dir = self.allocation_dir(id)?;
        if !fs::try_exists(dir.join(MANIFEST_FILE)).await? {
            return Err(DestinationError::AllocationNotFound { id: id.to_string() });
        }
        LocalAllocation::open(id, dir).await
    }
}

#[async_trait]
impl DestinationStore for LocalStore {
    async fn get_allocation(&self, id: &str) -> Result<Arc<dyn Allocation>, DestinationError> {
        Ok(Arc::new(self.open_allocation(id).await?))
    }
}

struct Inner {
    id: String,
    dir: PathBuf,
    key: Key,
    manifest: Mutex<Manifest>,
    commit_log: Mutex<()>,
    seq: AtomicU64,
}

/// Handle to one local allocation. Cheap to clone.
#[derive(Clone)]
pub struct LocalAllocation {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LocalAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAllocation")
            .field("id", &self.inner.id)
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

impl LocalAllocation {
    async fn open(id: &str, dir: PathBuf) -> Result<Self, DestinationError> {
        let manifest: Manifest = serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE)).await?)?;
        let key_hex = fs::read_to_string(dir.join(KEY_FILE)).await?;
        let key_bytes: [u8; 32] = hex::decode(key_hex.trim())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| DestinationError::Encryption("malformed allocation key".to_string()))?;
        fs::create_dir_all(dir.join("tmp")).await?;

        Ok(Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                dir,
                key: Key::from(key_bytes),
                manifest: Mutex::new(manifest),
                commit_log: Mutex::new(()),
                seq: AtomicU64::new(0),
            }),
        })
    }

    /// Returns the manifest entry for `path`, if stored.
    pub async fn entry(&self, path: &str) -> Option<FileEntry> {
        self.inner
            .manifest
            .lock()
            .await
            .files
            .get(&normalize_path(path))
            .cloned()
    }

    /// Reads a stored file back, decrypting it when needed.
    ///
    /// # Errors
    ///
    /// Fails when the path is unknown or the blob cannot be read or
    /// decrypted.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, DestinationError> {
        let entry = self
            .entry(path)
            .await
            .ok_or_else(|| DestinationError::UnknownFile {
                path: path.to_string(),
            })?;
        let stored = fs::read(self.inner.dir.join("blobs").join(&entry.content_hash)).await?;
        if !entry.encrypted {
            return Ok(stored);
        }

        let cipher = ChaCha20Poly1305::new(&self.inner.key);
        let mut plain = Vec::with_capacity(stored.len());
        for chunk in stored.chunks(NONCE_LEN + CHUNK_SIZE + TAG_LEN) {
            if chunk.len() < NONCE_LEN + TAG_LEN {
                return Err(DestinationError::Encryption("truncated chunk".to_string()));
            }
            let (nonce, ciphertext) = chunk.split_at(NONCE_LEN);
            let decrypted = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|e| DestinationError::Encryption(e.to_string()))?;
            plain.extend_from_slice(&decrypted);
        }
        Ok(plain)
    }

    /// Reads every recorded metadata commit, oldest first.
    ///
    /// # Errors
    ///
    /// Fails when the log cannot be read or a line is malformed.
    pub async fn commit_log(&self) -> Result<Vec<CommitRecord>, DestinationError> {
        let path = self.inner.dir.join(COMMIT_LOG);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(path).await?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(DestinationError::from))
            .collect()
    }
}

#[async_trait]
impl Allocation for LocalAllocation {
    fn id(&self) -> &str {
        &self.inner.id
    }

    async fn list_file_tree(
        &self,
        excluded: &HashSet<String>,
    ) -> Result<BTreeMap<String, u64>, DestinationError> {
        let manifest = self.inner.manifest.lock().await;
        Ok(manifest
            .files
            .iter()
            .filter(|(path, _)| !is_excluded(path, excluded))
            .map(|(path, entry)| (path.clone(), entry.size))
            .collect())
    }

    async fn upload(
        &self,
        request: UploadRequest,
    ) -> Result<Completion<UploadReceipt>, DestinationError> {
        let (completer, signal) = completion();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            completer.resolve(inner.store(request).await);
        });
        Ok(signal)
    }

    async fn commit_metadata(
        &self,
        request: CommitRequest,
    ) -> Result<Completion<CommitId>, DestinationError> {
        let (completer, signal) = completion();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            completer.resolve(inner.commit(request).await);
        });
        Ok(signal)
    }
}

impl Inner {
    fn temp_path(&self) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join("tmp")
            .join(format!("{}-{seq}.part", std::process::id()))
    }

    async fn store(&self, request: UploadRequest) -> Result<UploadReceipt, DestinationError> {
        let remote_path = normalize_path(&request.remote_path);
        let reader: ObjectReader = match request.source {
            UploadSource::File(path) => Box::pin(File::open(path).await?),
            UploadSource::Reader(reader) => reader,
        };

        let tmp_path = self.temp_path();
        let written = self
            .write_blob(reader, &tmp_path, request.encrypt)
            .await
            .and_then(|(size, hash)| match request.expected_size {
                Some(expected) if expected != size => Err(DestinationError::Integrity {
                    path: remote_path.clone(),
                    expected,
                    actual: size,
                }),
                _ => Ok((size, hash)),
            });
        let (size, content_hash) = match written {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };

        let blob_path = self.dir.join("blobs").join(&content_hash);
        if fs::try_exists(&blob_path).await? {
            fs::remove_file(&tmp_path).await?;
        } else {
            fs::rename(&tmp_path, &blob_path).await?;
        }

        let mut manifest = self.manifest.lock().await;
        manifest.files.insert(
            remote_path.clone(),
            FileEntry {
                size,
                content_hash: content_hash.clone(),
                encrypted: request.encrypt,
                read_payer: request.attributes.read_payer,
                updated_at: Utc::now(),
            },
        );
        write_manifest(&self.dir, &manifest).await?;
        drop(manifest);

        tracing::debug!(
            allocation = self.id.as_str(),
            path = remote_path.as_str(),
            size,
            hash = content_hash.as_str(),
            "stored file."
        );
        Ok(UploadReceipt {
            remote_path,
            size,
            content_hash,
        })
    }

    /// Copies `reader` into `tmp_path`, returning plaintext size and the hex
    /// SHA-256 of the bytes written.
    async fn write_blob(
        &self,
        mut reader: impl AsyncRead + Unpin,
        tmp_path: &Path,
        encrypt: bool,
    ) -> Result<(u64, String), DestinationError> {
        let mut out = File::create(tmp_path).await?;
        let cipher = encrypt.then(|| ChaCha20Poly1305::new(&self.key));
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let n = read_chunk(&mut reader, &mut buffer).await?;
            if n == 0 {
                break;
            }
            size += n as u64;

            if let Some(cipher) = &cipher {
                let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
                let ciphertext = cipher
                    .encrypt(&nonce, &buffer[..n])
                    .map_err(|e| DestinationError::Encryption(e.to_string()))?;
                hasher.update(nonce);
                hasher.update(&ciphertext);
                out.write_all(&nonce).await?;
                out.write_all(&ciphertext).await?;
            } else {
                hasher.update(&buffer[..n]);
                out.write_all(&buffer[..n]).await?;
            }
        }
        out.flush().await?;

        Ok((size, hex::encode(hasher.finalize())))
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitId, DestinationError> {
        let remote_path = normalize_path(&request.remote_path);
        let content_hash = self
            .manifest
            .lock()
            .await
            .files
            .get(&remote_path)
            .map(|entry| entry.content_hash.clone())
            .ok_or_else(|| DestinationError::UnknownFile {
                path: remote_path.clone(),
            })?;

        let committed_at = Utc::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(remote_path.as_bytes());
        hasher.update(request.operation.to_string().as_bytes());
        hasher.update(content_hash.as_bytes());
        hasher.update(committed_at.to_rfc3339().as_bytes());
        hasher.update(seq.to_le_bytes());
        let id = CommitId(hex::encode(hasher.finalize()));

        let record = CommitRecord {
            id: id.clone(),
            operation: request.operation,
            remote_path,
            content_hash,
            auth_ticket: request.auth_ticket,
            lookup_hash: request.lookup_hash,
            file_meta: request.file_meta,
            committed_at,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.commit_log.lock().await;
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(COMMIT_LOG))
            .await?;
        log.write_all(&line).await?;
        log.flush().await?;

        Ok(id)
    }
}

/// Ensures a leading slash and strips a trailing one.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

/// Fills `buffer` unless the reader ends first.
async fn read_chunk(
    reader: &mut (impl AsyncRead + Unpin),
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), DestinationError> {
    let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec_pretty(manifest)?).await?;
    fs::rename(&tmp, dir.join(MANIFEST_FILE)).await?;
    Ok(())
}
