use std::sync::Arc;

use crate::config::{Config, Provider};
use crate::{CloudArcError, Result};

mod fs;
mod mem;
mod s3;

pub use fs::FsBackend;
pub use mem::{CallRecord, MemBackend};
pub use s3::S3Backend;

/// Backend-assigned token identifying an accepted part (an entity tag for
/// S3-style stores). Required when completing the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub seq: u32,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct RemotePart {
    pub seq: u32,
    pub etag: String,
    pub size: u64,
}

/// An in-progress upload reported by the backend for one object name.
#[derive(Debug, Clone)]
pub struct RemoteUpload {
    pub upload_id: String,
    pub parts: Vec<RemotePart>,
}

/// The uniform session interface every provider is adapted behind, so the
/// pipeline never sees backend-specific types. Backends without native
/// multipart expose the same operations through a virtual session and
/// report no resumable uploads.
pub trait StorageBackend: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Minimum size of every non-final part, or 0 when the backend has no
    /// such rule.
    fn min_part_size(&self) -> u64;

    fn open_session(&self, object: &str) -> Result<String>;

    fn upload_part(&self, object: &str, upload_id: &str, seq: u32, data: &[u8])
        -> Result<PartReceipt>;

    fn complete_session(&self, object: &str, upload_id: &str, parts: &[CompletedPart])
        -> Result<()>;

    fn abort_session(&self, object: &str, upload_id: &str) -> Result<()>;

    fn list_in_progress(&self, object: &str) -> Result<Vec<RemoteUpload>>;

    /// Whole-object upload used when the stream fits in a single part.
    fn put_object(&self, object: &str, data: &[u8]) -> Result<()>;
}

pub fn create_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    match config.provider {
        Provider::S3 | Provider::Minio => Ok(Arc::new(S3Backend::new(config)?)),
        Provider::Fs => {
            let target_dir = config
                .target_dir
                .as_ref()
                .ok_or_else(|| CloudArcError::InvalidConfig {
                    description: "fs provider requires target_dir".to_string(),
                })?;
            Ok(Arc::new(FsBackend::new(target_dir.clone(), config.chunk_size)?))
        }
        Provider::Googledrive | Provider::Mega => Err(CloudArcError::InvalidConfig {
            description: format!(
                "Provider {} is not supported by this build",
                config.provider.as_str()
            ),
        }),
    }
}
