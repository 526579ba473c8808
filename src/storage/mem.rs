use std::collections::HashMap;
use std::sync::Mutex;

use super::{CompletedPart, PartReceipt, RemotePart, RemoteUpload, StorageBackend};
use crate::{CloudArcError, Result};

/// In-memory backend used by tests and dry runs. Records every call it
/// receives, hands out deterministic receipts, and can be told to fail
/// specific part numbers a fixed number of times to exercise retry paths.
#[derive(Default)]
pub struct MemBackend {
    state: Mutex<MemState>,
    part_delay: Mutex<Option<std::time::Duration>>,
}

#[derive(Default)]
struct MemState {
    objects: HashMap<String, Vec<u8>>,
    sessions: HashMap<String, MemSession>,
    calls: Vec<CallRecord>,
    next_session: u64,
    transient_failures: HashMap<u32, u32>,
}

struct MemSession {
    object: String,
    parts: HashMap<u32, Vec<u8>>,
    open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallRecord {
    OpenSession { object: String, upload_id: String },
    UploadPart { upload_id: String, seq: u32 },
    CompleteSession { upload_id: String, parts: Vec<u32> },
    AbortSession { upload_id: String },
    ListInProgress { object: String },
    PutObject { object: String, size: u64 },
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `upload_part` fail with a transient error the next `times`
    /// calls for the given sequence number.
    pub fn fail_part_transiently(&self, seq: u32, times: u32) {
        let mut state = self.state.lock().unwrap();
        state.transient_failures.insert(seq, times);
    }

    /// Slows every part upload down, so tests can interleave cancellation
    /// with uploads deterministically.
    pub fn set_part_delay(&self, delay: std::time::Duration) {
        *self.part_delay.lock().unwrap() = Some(delay);
    }

    /// Seeds an in-progress session, as left behind by an interrupted run.
    pub fn seed_in_progress(&self, object: &str, parts: &[(u32, Vec<u8>)]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let upload_id = format!("upload-{}", state.next_session);
        let mut session = MemSession {
            object: object.to_string(),
            parts: HashMap::new(),
            open: true,
        };
        for (seq, data) in parts {
            session.parts.insert(*seq, data.clone());
        }
        state.sessions.insert(upload_id.clone(), session);
        upload_id
    }

    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn abort_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, CallRecord::AbortSession { .. }))
            .count()
    }

    pub fn open_session_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, CallRecord::OpenSession { .. }))
            .count()
    }

    pub fn uploaded_part_seqs(&self) -> Vec<u32> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                CallRecord::UploadPart { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    pub fn has_open_sessions(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .sessions
            .values()
            .any(|s| s.open)
    }

    fn receipt_for(seq: u32) -> String {
        format!("etag-{}", seq)
    }
}

impl StorageBackend for MemBackend {
    fn provider_name(&self) -> &'static str {
        "mem"
    }

    fn min_part_size(&self) -> u64 {
        0
    }

    fn open_session(&self, object: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let upload_id = format!("upload-{}", state.next_session);
        state.sessions.insert(
            upload_id.clone(),
            MemSession {
                object: object.to_string(),
                parts: HashMap::new(),
                open: true,
            },
        );
        state.calls.push(CallRecord::OpenSession {
            object: object.to_string(),
            upload_id: upload_id.clone(),
        });
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        _object: &str,
        upload_id: &str,
        seq: u32,
        data: &[u8],
    ) -> Result<PartReceipt> {
        let delay = *self.part_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock().unwrap();
        state.calls.push(CallRecord::UploadPart {
            upload_id: upload_id.to_string(),
            seq,
        });

        if let Some(remaining) = state.transient_failures.get_mut(&seq) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CloudArcError::BackendTransient {
                    description: format!("injected failure for part {}", seq),
                });
            }
        }

        let session = state
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| CloudArcError::BackendPermanent {
                description: format!("unknown upload id {}", upload_id),
            })?;
        if !session.open {
            return Err(CloudArcError::BackendPermanent {
                description: format!("upload {} is no longer open", upload_id),
            });
        }
        session.parts.insert(seq, data.to_vec());
        Ok(PartReceipt {
            etag: Self::receipt_for(seq),
        })
    }

    fn complete_session(
        &self,
        object: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(CallRecord::CompleteSession {
            upload_id: upload_id.to_string(),
            parts: parts.iter().map(|p| p.seq).collect(),
        });

        let session = state
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| CloudArcError::BackendPermanent {
                description: format!("unknown upload id {}", upload_id),
            })?;
        if !session.open {
            return Err(CloudArcError::BackendPermanent {
                description: format!("upload {} is no longer open", upload_id),
            });
        }

        let mut assembled = Vec::new();
        for part in parts {
            let data = session.parts.get(&part.seq).ok_or_else(|| {
                CloudArcError::BackendPermanent {
                    description: format!("part {} was never uploaded", part.seq),
                }
            })?;
            assembled.extend_from_slice(data);
        }
        session.open = false;
        state.objects.insert(object.to_string(), assembled);
        Ok(())
    }

    fn abort_session(&self, _object: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(CallRecord::AbortSession {
            upload_id: upload_id.to_string(),
        });
        if let Some(session) = state.sessions.get_mut(upload_id) {
            session.open = false;
            session.parts.clear();
        }
        Ok(())
    }

    fn list_in_progress(&self, object: &str) -> Result<Vec<RemoteUpload>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(CallRecord::ListInProgress {
            object: object.to_string(),
        });
        let uploads = state
            .sessions
            .iter()
            .filter(|(_, s)| s.open && s.object == object)
            .map(|(upload_id, s)| {
                let mut parts: Vec<RemotePart> = s
                    .parts
                    .iter()
                    .map(|(seq, data)| RemotePart {
                        seq: *seq,
                        etag: Self::receipt_for(*seq),
                        size: data.len() as u64,
                    })
                    .collect();
                parts.sort_by_key(|p| p.seq);
                RemoteUpload {
                    upload_id: upload_id.clone(),
                    parts,
                }
            })
            .collect();
        Ok(uploads)
    }

    fn put_object(&self, object: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(CallRecord::PutObject {
            object: object.to_string(),
            size: data.len() as u64,
        });
        state.objects.insert(object.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_roundtrip() {
        let backend = MemBackend::new();
        let upload_id = backend.open_session("obj").unwrap();

        backend.upload_part("obj", &upload_id, 2, b"world").unwrap();
        backend.upload_part("obj", &upload_id, 1, b"hello ").unwrap();

        let parts = vec![
            CompletedPart {
                seq: 1,
                etag: "etag-1".to_string(),
            },
            CompletedPart {
                seq: 2,
                etag: "etag-2".to_string(),
            },
        ];
        backend.complete_session("obj", &upload_id, &parts).unwrap();
        assert_eq!(backend.object("obj").unwrap(), b"hello world");
        assert!(!backend.has_open_sessions());
    }

    #[test]
    fn test_injected_transient_failures_expire() {
        let backend = MemBackend::new();
        let upload_id = backend.open_session("obj").unwrap();
        backend.fail_part_transiently(1, 2);

        assert!(backend.upload_part("obj", &upload_id, 1, b"x").is_err());
        assert!(backend.upload_part("obj", &upload_id, 1, b"x").is_err());
        assert!(backend.upload_part("obj", &upload_id, 1, b"x").is_ok());
    }

    #[test]
    fn test_seeded_session_is_listed() {
        let backend = MemBackend::new();
        let upload_id = backend.seed_in_progress("obj", &[(1, b"a".to_vec()), (2, b"b".to_vec())]);

        let uploads = backend.list_in_progress("obj").unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].upload_id, upload_id);
        assert_eq!(uploads[0].parts.len(), 2);
        assert_eq!(uploads[0].parts[0].seq, 1);

        assert!(backend.list_in_progress("other").unwrap().is_empty());
    }

    #[test]
    fn test_abort_is_idempotent() {
        let backend = MemBackend::new();
        let upload_id = backend.open_session("obj").unwrap();
        backend.abort_session("obj", &upload_id).unwrap();
        backend.abort_session("obj", &upload_id).unwrap();
        assert_eq!(backend.abort_count(), 2);
        assert!(!backend.has_open_sessions());
    }
}
