use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use thiserror::Error;

use crate::pipeline::job::current_timestamp_ms;

/// Errors emitted by blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error("io error for blob `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque byte storage addressed by key. Keys follow
/// `{tenant_id}/jobs/{job_id}/{file_name}`.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, mime: &str) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Bytes, BlobError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobError>;

    async fn delete(&self, key: &str) -> Result<bool, BlobError>;
}

/// Compose the canonical blob key for a job upload.
pub fn job_blob_key(tenant_id: &str, job_id: &str, file_name: &str) -> String {
    debug_assert!(!tenant_id.is_empty());
    debug_assert!(!job_id.is_empty());
    format!(
        "{}/jobs/{}/{}",
        sanitize_component(tenant_id),
        sanitize_component(job_id),
        sanitize_component(file_name)
    )
}

/// Strip path separators and traversal segments from one key component.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

fn validate_key(key: &str) -> Result<(), BlobError> {
    if key.is_empty() || key.len() > 1024 {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    if key
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Filesystem-backed blob store rooted under the app data directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        let path = self.root.join(key);
        debug_assert!(path.starts_with(&self.root));
        Ok(path)
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, _mime: &str) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| BlobError::Io {
                    key: key.to_string(),
                    source,
                })?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| BlobError::Io {
                key: key.to_string(),
                source,
            })
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(source) => Err(BlobError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(BlobError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// In-memory blob store for tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, _mime: &str) -> Result<(), BlobError> {
        validate_key(key)?;
        let mut blobs = self.blobs.lock().expect("blob map lock");
        blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        validate_key(key)?;
        let blobs = self.blobs.lock().expect("blob map lock");
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        validate_key(key)?;
        let blobs = self.blobs.lock().expect("blob map lock");
        Ok(blobs.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        validate_key(key)?;
        let mut blobs = self.blobs.lock().expect("blob map lock");
        Ok(blobs.remove(key).is_some())
    }
}

const PRESIGN_CONTEXT: &str = "ocrbase 2025-06-02 presigned upload token";

#[derive(Debug, Error)]
pub enum PresignError {
    #[error("malformed upload token")]
    Malformed,
    #[error("upload token signature mismatch")]
    BadSignature,
    #[error("upload token expired")]
    Expired,
}

/// Claims carried by a verified upload token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignClaims {
    pub blob_key: String,
    pub mime_type: String,
    pub expires_at_ms: i64,
}

/// Issues and verifies MAC-signed upload tokens for the two-phase upload
/// path. Tokens are `base64url(payload).base64url(keyed-hash)`.
#[derive(Debug, Clone)]
pub struct UploadSigner {
    key: [u8; 32],
}

impl UploadSigner {
    pub fn new(secret: &str) -> Self {
        debug_assert!(!secret.is_empty());
        let key = blake3::derive_key(PRESIGN_CONTEXT, secret.as_bytes());
        Self { key }
    }

    pub fn sign(&self, blob_key: &str, mime_type: &str, ttl_ms: i64) -> String {
        let expires_at_ms = current_timestamp_ms().saturating_add(ttl_ms);
        let payload = format!("{expires_at_ms}\n{mime_type}\n{blob_key}");
        let mac = blake3::keyed_hash(&self.key, payload.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(mac.as_bytes())
        )
    }

    pub fn verify(&self, token: &str) -> Result<PresignClaims, PresignError> {
        let (payload_b64, mac_b64) = token.split_once('.').ok_or(PresignError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| PresignError::Malformed)?;
        let mac_bytes = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| PresignError::Malformed)?;

        let expected = blake3::keyed_hash(&self.key, &payload);
        let provided: [u8; 32] = mac_bytes
            .as_slice()
            .try_into()
            .map_err(|_| PresignError::Malformed)?;
        // Hash equality is constant-time in blake3.
        if expected != blake3::Hash::from(provided) {
            return Err(PresignError::BadSignature);
        }

        let payload = String::from_utf8(payload).map_err(|_| PresignError::Malformed)?;
        let mut parts = payload.splitn(3, '\n');
        let expires_at_ms: i64 = parts
            .next()
            .and_then(|raw| raw.parse().ok())
            .ok_or(PresignError::Malformed)?;
        let mime_type = parts.next().ok_or(PresignError::Malformed)?.to_string();
        let blob_key = parts.next().ok_or(PresignError::Malformed)?.to_string();

        if expires_at_ms < current_timestamp_ms() {
            return Err(PresignError::Expired);
        }
        Ok(PresignClaims {
            blob_key,
            mime_type,
            expires_at_ms,
        })
    }
}
