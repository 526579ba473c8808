use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::storage::{CompletedPart, RemoteUpload, StorageBackend};
use crate::{CloudArcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Completing,
    Completed,
    Aborted,
}

/// One multipart upload in flight. The inner mutex covers the upload id,
/// the receipt list, and the state together; workers only hold it while
/// appending a receipt, never across a network call.
pub struct UploadSession {
    backend: Arc<dyn StorageBackend>,
    object: String,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    upload_id: String,
    parts: Vec<CompletedPart>,
    resumed: HashSet<u32>,
    resumed_bytes: u64,
    state: SessionState,
}

impl UploadSession {
    pub fn open(backend: Arc<dyn StorageBackend>, object: &str) -> Result<Self> {
        let upload_id = backend.open_session(object)?;
        Ok(Self::with_parts(backend, object, upload_id, Vec::new(), 0))
    }

    /// Adopts a pre-existing in-progress upload if the backend reports
    /// exactly one for this object; otherwise returns `None` and the
    /// caller opens a fresh session. Parts already received by the remote
    /// are skipped by the workers, not re-uploaded.
    pub fn resume(backend: Arc<dyn StorageBackend>, object: &str) -> Result<Option<Self>> {
        let mut uploads: Vec<RemoteUpload> = backend.list_in_progress(object)?;
        if uploads.len() != 1 {
            if uploads.len() > 1 {
                debug!(
                    "Found {} in-progress uploads for {}; not resuming",
                    uploads.len(),
                    object
                );
            }
            return Ok(None);
        }

        let upload = uploads.remove(0);
        let resumed_bytes = upload.parts.iter().map(|p| p.size).sum();
        let parts: Vec<CompletedPart> = upload
            .parts
            .iter()
            .map(|p| CompletedPart {
                seq: p.seq,
                etag: p.etag.clone(),
            })
            .collect();
        info!(
            "Resuming upload {} with {} parts already received",
            upload.upload_id,
            parts.len()
        );
        Ok(Some(Self::with_parts(
            backend,
            object,
            upload.upload_id,
            parts,
            resumed_bytes,
        )))
    }

    fn with_parts(
        backend: Arc<dyn StorageBackend>,
        object: &str,
        upload_id: String,
        parts: Vec<CompletedPart>,
        resumed_bytes: u64,
    ) -> Self {
        let resumed = parts.iter().map(|p| p.seq).collect();
        UploadSession {
            backend,
            object: object.to_string(),
            inner: Mutex::new(SessionInner {
                upload_id,
                parts,
                resumed,
                resumed_bytes,
                state: SessionState::Open,
            }),
        }
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn is_resumed_part(&self, seq: u32) -> bool {
        self.inner.lock().unwrap().resumed.contains(&seq)
    }

    /// Bytes the remote already holds from the adopted session.
    pub fn resumed_bytes(&self) -> u64 {
        self.inner.lock().unwrap().resumed_bytes
    }

    /// Uploads one part and appends its receipt. The backend call happens
    /// without the lock; receipt insertion is serialized.
    pub fn upload_part(&self, seq: u32, data: &[u8]) -> Result<()> {
        let upload_id = {
            let inner = self.inner.lock().unwrap();
            if inner.state != SessionState::Open {
                return Err(CloudArcError::Cancelled);
            }
            inner.upload_id.clone()
        };

        let receipt = self
            .backend
            .upload_part(&self.object, &upload_id, seq, data)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Open {
            debug!("Dropping receipt for part {}: session is closing", seq);
            return Ok(());
        }
        inner.parts.push(CompletedPart {
            seq,
            etag: receipt.etag,
        });
        Ok(())
    }

    /// Finalizes the upload. The receipt list is ordered by sequence
    /// number and must be gap-free and duplicate-free.
    pub fn complete(&self) -> Result<()> {
        let (upload_id, parts) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != SessionState::Open {
                return Err(CloudArcError::Pipeline {
                    stage: "session".to_string(),
                    description: format!("Cannot complete session in state {:?}", inner.state),
                });
            }
            inner.state = SessionState::Completing;
            let mut parts = inner.parts.clone();
            parts.sort_by_key(|p| p.seq);
            (inner.upload_id.clone(), parts)
        };

        if let Err(e) = verify_contiguous(&parts) {
            self.inner.lock().unwrap().state = SessionState::Open;
            return Err(e);
        }

        match self.backend.complete_session(&self.object, &upload_id, &parts) {
            Ok(()) => {
                self.inner.lock().unwrap().state = SessionState::Completed;
                Ok(())
            }
            Err(e) => {
                self.inner.lock().unwrap().state = SessionState::Open;
                Err(e)
            }
        }
    }

    /// Best-effort remote abort. Idempotent and infallible from the
    /// caller's view; a failed abort leaves the upload for a later resume
    /// and is only logged.
    pub fn abort(&self) {
        let upload_id = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SessionState::Completed | SessionState::Aborted => return,
                _ => {}
            }
            inner.state = SessionState::Aborted;
            inner.upload_id.clone()
        };

        if let Err(e) = self.backend.abort_session(&self.object, &upload_id) {
            warn!("Failed to abort upload {}: {}", upload_id, e);
        }
    }
}

fn verify_contiguous(parts: &[CompletedPart]) -> Result<()> {
    for (i, part) in parts.iter().enumerate() {
        let expected = i as u32 + 1;
        if part.seq != expected {
            return Err(CloudArcError::Pipeline {
                stage: "session".to_string(),
                description: format!(
                    "Part manifest has a gap or duplicate: expected {}, found {}",
                    expected, part.seq
                ),
            });
        }
    }
    Ok(())
}
