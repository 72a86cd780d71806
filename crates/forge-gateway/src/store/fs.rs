//! Durable store: one file per key under a directory.
//!
//! File names are the SHA-256 of the key so arbitrary cache keys (paths,
//! query strings) map to safe names. Each file holds an 8-byte big-endian
//! expiry in unix milliseconds (`0` = no expiry) followed by the raw value.
//! Writes go to a temporary file first and are renamed into place, so a
//! reader never sees a half-written entry.
//!
//! Expired files are removed when read, and by a directory sweep every
//! [`SWEEP_EVERY_WRITES`] writes.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{KvStore, StoreError, StoreResult, SWEEP_EVERY_WRITES};

const HEADER_LEN: usize = 8;

#[derive(Debug)]
pub struct FsKvStore {
    root: PathBuf,
    tmp_seq: AtomicU64,
    writes: AtomicU64,
}

impl FsKvStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            tmp_seq: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.root.join(hex::encode(digest))
    }

    fn tmp_path(&self, final_path: &Path) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let mut name = final_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.{}.tmp", std::process::id(), seq));
        final_path.with_file_name(name)
    }

    /// Expiry stamp of one entry file. `None` for files that are not
    /// entries: temporaries, or anything shorter than a header.
    async fn expiry_of(path: &Path) -> StoreResult<Option<u64>> {
        if path.extension().is_some_and(|ext| ext == "tmp") {
            return Ok(None);
        }
        let mut file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut header = [0u8; HEADER_LEN];
        match file.read_exact(&mut header).await {
            Ok(_) => Ok(Some(u64::from_be_bytes(header))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn encode(value: &[u8], expires_at_ms: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + value.len());
    out.extend_from_slice(&expires_at_ms.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode(raw: Vec<u8>) -> StoreResult<(u64, Bytes)> {
    if raw.len() < HEADER_LEN {
        return Err(StoreError::Corrupt(format!(
            "entry is {} bytes, shorter than its header",
            raw.len()
        )));
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&raw[..HEADER_LEN]);
    let expires_at_ms = u64::from_be_bytes(header);
    let value = Bytes::from(raw).slice(HEADER_LEN..);
    Ok((expires_at_ms, value))
}

#[async_trait]
impl KvStore for FsKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (expires_at_ms, value) = decode(raw)?;
        if expires_at_ms != 0 && now_ms() >= expires_at_ms {
            // Expired entries are cleaned up lazily on read.
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at_ms = match ttl {
            Some(ttl) => now_ms()
                .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
                .max(1),
            None => 0,
        };
        let path = self.entry_path(key);
        let tmp = self.tmp_path(&path);

        fs::write(&tmp, encode(&value, expires_at_ms)).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            if let Err(e) = self.purge_expired().await {
                warn!(error = %e, "cache directory sweep failed");
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = now_ms();
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(expires_at_ms) = Self::expiry_of(&path).await? else {
                continue;
            };
            if expires_at_ms != 0 && now >= expires_at_ms {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        debug!(removed, "swept expired cache files");
        Ok(removed)
    }
}
