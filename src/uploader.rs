use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::chunker::Chunk;
use crate::progress::ProgressTracker;
use crate::session::UploadSession;
use crate::{CloudArcError, Result};

pub const UPLOAD_ATTEMPTS: u32 = 3;
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct UploaderConfig {
    pub workers: usize,
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl UploaderConfig {
    pub fn new(workers: usize) -> Self {
        UploaderConfig {
            workers,
            attempts: UPLOAD_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
        }
    }
}

/// Spawns the worker pool draining the chunk queue. Each worker uploads
/// one part at a time with retry; the first terminal failure goes to
/// `error_tx` and cancels the run so sibling workers stop at their next
/// queue receive or retry decision.
pub fn spawn_workers(
    config: &UploaderConfig,
    session: Arc<UploadSession>,
    rx: Receiver<Chunk>,
    tracker: Arc<ProgressTracker>,
    cancel: CancelToken,
    error_tx: Sender<CloudArcError>,
) -> Vec<JoinHandle<()>> {
    let mut workers = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let config = config.clone();
        let session = Arc::clone(&session);
        let rx = rx.clone();
        let tracker = Arc::clone(&tracker);
        let cancel = cancel.clone();
        let error_tx = error_tx.clone();

        workers.push(std::thread::spawn(move || {
            worker_loop(worker_id, &config, session, rx, tracker, cancel, error_tx)
        }));
    }
    workers
}

fn worker_loop(
    worker_id: usize,
    config: &UploaderConfig,
    session: Arc<UploadSession>,
    rx: Receiver<Chunk>,
    tracker: Arc<ProgressTracker>,
    cancel: CancelToken,
    error_tx: Sender<CloudArcError>,
) {
    while let Ok(chunk) = rx.recv() {
        if cancel.is_cancelled() {
            debug!("Worker {} stopping on cancellation", worker_id);
            return;
        }

        let seq = chunk.seq;
        let size = chunk.len();
        match upload_with_retry(config, &session, &chunk, &cancel) {
            Ok(()) => {
                tracker.update(size);
                info!("Part {} done: {}", seq, tracker.format_status());
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!("Worker {} giving up on part {}: {}", worker_id, seq, e);
                }
                // Only the first error is reported; drop the rest.
                let _ = error_tx.try_send(e);
                cancel.cancel();
                return;
            }
        }
    }
    debug!("Worker {} finished: queue drained", worker_id);
}

/// Uploads one chunk with up to `attempts` tries. Transient backend errors
/// back off exponentially (base, 2x, 4x, ...); permanent errors and
/// cancellation end the attempt loop immediately. Parts the resumed
/// session already holds are skipped but still counted as transferred.
fn upload_with_retry(
    config: &UploaderConfig,
    session: &UploadSession,
    chunk: &Chunk,
    cancel: &CancelToken,
) -> Result<()> {
    if session.is_resumed_part(chunk.seq) {
        debug!("Skipping part {}: already on the remote", chunk.seq);
        return Ok(());
    }

    let mut delay = config.backoff_base;
    let mut last_err: Option<CloudArcError> = None;

    for attempt in 1..=config.attempts {
        cancel.check()?;

        match session.upload_part(chunk.seq, &chunk.data) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(
                    "Attempt {}/{} for part {} failed: {}",
                    attempt, config.attempts, chunk.seq, e
                );
                let transient = e.is_transient();
                last_err = Some(e);
                if !transient || attempt == config.attempts {
                    break;
                }
                if !cancel.sleep(delay) {
                    return Err(CloudArcError::Cancelled);
                }
                delay *= 2;
            }
        }
    }

    Err(last_err.unwrap_or(CloudArcError::Cancelled))
}
