use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Mutex;

use log::debug;

use super::{CompletedPart, PartReceipt, RemoteUpload, StorageBackend};
use crate::{CloudArcError, Result};

/// Local-directory backend. It is the whole-stream adapter shape used for
/// providers without native multipart: `open_session` hands out a virtual
/// session backed by a `.partial` staging file, parts land at their
/// stream offsets, and `complete_session` atomically renames the staging
/// file over the final object name. Resume is unsupported and always
/// reports no in-progress uploads.
pub struct FsBackend {
    base_dir: PathBuf,
    chunk_size: u64,
    sessions: Mutex<FsSessions>,
}

#[derive(Default)]
struct FsSessions {
    next_id: u64,
    open: HashMap<String, FsUpload>,
}

struct FsUpload {
    object: String,
    partial_path: PathBuf,
    file: File,
}

impl FsBackend {
    pub fn new(base_dir: PathBuf, chunk_size: u64) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(FsBackend {
            base_dir,
            chunk_size,
            sessions: Mutex::new(FsSessions::default()),
        })
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let path = self.base_dir.join(name);
        if path.file_name().is_none()
            || path.file_name() == Some(std::ffi::OsStr::new("."))
            || path.file_name() == Some(std::ffi::OsStr::new(".."))
            || path.parent() != Some(self.base_dir.as_path())
        {
            return Err(CloudArcError::BackendPermanent {
                description: format!(
                    "Invalid object name resulting in path outside the target directory: {:?}",
                    name
                ),
            });
        }
        Ok(path)
    }

    fn staging_path(&self, object: &str) -> Result<PathBuf> {
        self.object_path(&format!("{}.partial", object))
    }
}

impl StorageBackend for FsBackend {
    fn provider_name(&self) -> &'static str {
        "fs"
    }

    fn min_part_size(&self) -> u64 {
        0
    }

    fn open_session(&self, object: &str) -> Result<String> {
        self.object_path(object)?;
        let partial_path = self.staging_path(object)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial_path)?;

        let mut sessions = self.sessions.lock().unwrap();
        sessions.next_id += 1;
        let upload_id = format!("fs-{}", sessions.next_id);
        sessions.open.insert(
            upload_id.clone(),
            FsUpload {
                object: object.to_string(),
                partial_path,
                file,
            },
        );
        debug!("Opened fs session {} for {}", upload_id, object);
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        _object: &str,
        upload_id: &str,
        seq: u32,
        data: &[u8],
    ) -> Result<PartReceipt> {
        let sessions = self.sessions.lock().unwrap();
        let upload = sessions
            .open
            .get(upload_id)
            .ok_or_else(|| CloudArcError::BackendPermanent {
                description: format!("unknown upload id {}", upload_id),
            })?;

        let offset = (seq as u64 - 1) * self.chunk_size;
        upload.file.write_all_at(data, offset)?;
        Ok(PartReceipt {
            etag: format!("fs-{}-{}", seq, data.len()),
        })
    }

    fn complete_session(
        &self,
        object: &str,
        upload_id: &str,
        _parts: &[CompletedPart],
    ) -> Result<()> {
        let upload = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.open.remove(upload_id).ok_or_else(|| {
                CloudArcError::BackendPermanent {
                    description: format!("unknown upload id {}", upload_id),
                }
            })?
        };
        if upload.object != object {
            return Err(CloudArcError::BackendPermanent {
                description: format!(
                    "upload {} belongs to {}, not {}",
                    upload_id, upload.object, object
                ),
            });
        }

        upload.file.sync_all()?;
        let final_path = self.object_path(object)?;
        fs::rename(&upload.partial_path, &final_path)?;
        debug!("Completed fs session {} into {}", upload_id, final_path.display());
        Ok(())
    }

    fn abort_session(&self, _object: &str, upload_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(upload) = sessions.open.remove(upload_id) {
            if let Err(e) = fs::remove_file(&upload.partial_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(
                        "Failed to remove staging file {}: {}",
                        upload.partial_path.display(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    fn list_in_progress(&self, _object: &str) -> Result<Vec<RemoteUpload>> {
        Ok(Vec::new())
    }

    fn put_object(&self, object: &str, data: &[u8]) -> Result<()> {
        let final_path = self.object_path(object)?;
        let temp_path = self.staging_path(object)?;
        fs::write(&temp_path, data)?;
        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parts_assemble_out_of_order() {
        let dir = tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_path_buf(), 4).unwrap();

        let upload_id = backend.open_session("obj").unwrap();
        backend.upload_part("obj", &upload_id, 2, b"worl").unwrap();
        backend.upload_part("obj", &upload_id, 1, b"hell").unwrap();
        backend.upload_part("obj", &upload_id, 3, b"d").unwrap();

        let parts: Vec<CompletedPart> = (1..=3)
            .map(|seq| CompletedPart {
                seq,
                etag: format!("fs-{}-0", seq),
            })
            .collect();
        backend.complete_session("obj", &upload_id, &parts).unwrap();

        assert_eq!(fs::read(dir.path().join("obj")).unwrap(), b"hellworld");
        assert!(!dir.path().join("obj.partial").exists());
    }

    #[test]
    fn test_abort_removes_staging_file() {
        let dir = tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_path_buf(), 4).unwrap();

        let upload_id = backend.open_session("obj").unwrap();
        backend.upload_part("obj", &upload_id, 1, b"data").unwrap();
        assert!(dir.path().join("obj.partial").exists());

        backend.abort_session("obj", &upload_id).unwrap();
        assert!(!dir.path().join("obj.partial").exists());

        // Idempotent: aborting again is safe.
        backend.abort_session("obj", &upload_id).unwrap();
    }

    #[test]
    fn test_put_object_is_atomic_rename() {
        let dir = tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_path_buf(), 4).unwrap();
        backend.put_object("small", b"content").unwrap();
        assert_eq!(fs::read(dir.path().join("small")).unwrap(), b"content");
        assert!(!dir.path().join("small.partial").exists());
    }

    #[test]
    fn test_object_name_cannot_escape_base_dir() {
        let dir = tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_path_buf(), 4).unwrap();
        for name in ["../escape", "sub/dir", ".", ".."] {
            let err = backend.put_object(name, b"x").unwrap_err();
            assert!(err.to_string().contains("Invalid object name"), "{}", name);
        }
    }

    #[test]
    fn test_resume_is_unsupported() {
        let dir = tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_path_buf(), 4).unwrap();
        backend.open_session("obj").unwrap();
        assert!(backend.list_in_progress("obj").unwrap().is_empty());
    }

    #[test]
    fn test_creates_base_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("store");
        let _backend = FsBackend::new(nested.clone(), 4).unwrap();
        assert!(nested.is_dir());
    }
}
