use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded};
use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::chunker::split_into_chunks;
use crate::config::Config;
use crate::crypto::StreamEncryptor;
use crate::pipe::pipe;
use crate::progress::ProgressTracker;
use crate::session::UploadSession;
use crate::storage::{create_backend, StorageBackend};
use crate::tar_stream::TarPacker;
use crate::uploader::{spawn_workers, UploaderConfig};
use crate::util::format_bytes;
use crate::walker::SourceWalker;
use crate::{CloudArcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Setup,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Closed,
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub object: String,
    pub bytes_transferred: u64,
    pub multipart: bool,
    pub resumed: bool,
}

/// Wires walker, packer, cipher, splitter, and the worker pool through
/// in-process pipes, owns the cancellation token, and guarantees that
/// every spawned thread is joined and the remote session is completed or
/// aborted before `run` returns.
pub struct Pipeline {
    config: Config,
    backend: Arc<dyn StorageBackend>,
    uploader: UploaderConfig,
    cancel: CancelToken,
    state: Mutex<PipelineState>,
}

impl Pipeline {
    pub fn new(config: Config, cancel: CancelToken) -> Result<Self> {
        config.validate()?;
        let backend = create_backend(&config)?;
        let uploader = UploaderConfig::new(config.workers);
        Self::assemble(config, backend, uploader, cancel)
    }

    /// Builds a pipeline around an externally-constructed backend.
    pub fn with_backend(
        config: Config,
        backend: Arc<dyn StorageBackend>,
        uploader: UploaderConfig,
        cancel: CancelToken,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, backend, uploader, cancel)
    }

    fn assemble(
        config: Config,
        backend: Arc<dyn StorageBackend>,
        uploader: UploaderConfig,
        cancel: CancelToken,
    ) -> Result<Self> {
        let min_part = backend.min_part_size();
        if min_part > 0 && config.chunk_size < min_part {
            return Err(CloudArcError::InvalidConfig {
                description: format!(
                    "chunk_size {} is below the {} backend minimum part size of {}",
                    config.chunk_size,
                    backend.provider_name(),
                    min_part
                ),
            });
        }
        Ok(Pipeline {
            config,
            backend,
            uploader,
            cancel,
            state: Mutex::new(PipelineState::Setup),
        })
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn set_state(&self, state: PipelineState) {
        debug!("Pipeline state: {:?}", state);
        *self.state.lock().unwrap() = state;
    }

    /// Runs the whole archive upload. Terminal states are entered only
    /// after every stage thread joined and the session is finalized.
    pub fn run(&self) -> Result<UploadReport> {
        self.set_state(PipelineState::Running);
        let result = self.execute();

        match &result {
            Ok(report) => {
                info!(
                    "Upload of {} finished: {} transferred",
                    report.object,
                    format_bytes(report.bytes_transferred)
                );
                self.set_state(PipelineState::Succeeded);
            }
            Err(e) if e.is_cancelled() => self.set_state(PipelineState::Cancelled),
            Err(_) => self.set_state(PipelineState::Failed),
        }
        self.set_state(PipelineState::Closed);
        result
    }

    fn execute(&self) -> Result<UploadReport> {
        self.cancel.check()?;

        let walker = SourceWalker::new(&self.config.sources);
        let total_estimate = walker.estimate_total()?;
        info!(
            "Archiving {} source(s), estimated {}",
            self.config.sources.len(),
            format_bytes(total_estimate)
        );
        let tracker = Arc::new(ProgressTracker::new(total_estimate));

        // Resolve the cipher before spawning anything, so construction
        // failures cannot leave a stage thread behind.
        let encryptor = if self.config.encrypt {
            Some(StreamEncryptor::new(&self.config.resolve_encryption_key())?)
        } else {
            None
        };

        // Stage 1: tar packer feeding the first pipe.
        let pipe_capacity = self.config.buffer_size.max(1);
        let (tar_writer, tar_reader) = pipe(pipe_capacity);
        let buffer_size = self.config.buffer_size;
        let sources = self.config.sources.clone();
        let cancel = self.cancel.clone();
        let packer: JoinHandle<Result<()>> = std::thread::spawn(move || {
            let walker = SourceWalker::new(&sources);
            let result = TarPacker::new(buffer_size).pack(&walker, tar_writer, &cancel);
            if result.is_err() {
                cancel.cancel();
            }
            result
        });

        // Stage 2 (optional): cipher between two pipes.
        let mut cipher: Option<JoinHandle<Result<()>>> = None;
        let final_reader: Box<dyn Read + Send> = if let Some(encryptor) = encryptor {
            let (cipher_writer, cipher_reader) = pipe(pipe_capacity);
            let cancel = self.cancel.clone();
            cipher = Some(std::thread::spawn(move || {
                let result = encryptor.encrypt_stream(tar_reader, cipher_writer, &cancel);
                if result.is_err() {
                    cancel.cancel();
                }
                result
            }));
            Box::new(cipher_reader)
        } else {
            Box::new(tar_reader)
        };

        if total_estimate <= self.config.chunk_size {
            self.upload_single(final_reader, packer, cipher, &tracker)
        } else {
            self.upload_multipart(final_reader, packer, cipher, &tracker)
        }
    }

    /// Whole-stream upload for archives the estimate says fit in a single
    /// part. The stream is buffered in memory, which the estimate bounds.
    fn upload_single(
        &self,
        mut final_reader: Box<dyn Read + Send>,
        packer: JoinHandle<Result<()>>,
        cipher: Option<JoinHandle<Result<()>>>,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<UploadReport> {
        debug!("Using single-part upload");
        let mut data = Vec::new();
        let read_result = final_reader.read_to_end(&mut data);
        drop(final_reader);

        let mut errors = join_stage_threads(packer, cipher, None);
        if let Err(e) = read_result {
            errors.push(CloudArcError::Pipeline {
                stage: "upload".to_string(),
                description: format!("Failed to read archive stream: {}", e),
            });
        }

        if let Some(e) = pick_error(errors, &self.cancel) {
            return Err(e);
        }

        self.backend.put_object(&self.config.filename, &data)?;
        tracker.update(data.len() as u64);
        info!("Uploaded {} in one part", format_bytes(data.len() as u64));

        Ok(UploadReport {
            object: self.config.filename.clone(),
            bytes_transferred: tracker.transferred(),
            multipart: false,
            resumed: false,
        })
    }

    fn upload_multipart(
        &self,
        final_reader: Box<dyn Read + Send>,
        packer: JoinHandle<Result<()>>,
        cipher: Option<JoinHandle<Result<()>>>,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<UploadReport> {
        debug!("Using multipart upload");
        let object = self.config.filename.as_str();

        let resumed_session = if self.config.resume {
            match UploadSession::resume(Arc::clone(&self.backend), object) {
                Ok(session) => session,
                Err(e) => {
                    warn!("Failed to check for resumable uploads: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let resumed = resumed_session.is_some();
        let session = match resumed_session {
            Some(session) => Arc::new(session),
            None => Arc::new(UploadSession::open(Arc::clone(&self.backend), object)?),
        };
        if session.resumed_bytes() > 0 {
            tracker.update(session.resumed_bytes());
        }

        // Stage 3: splitter feeding the bounded chunk queue.
        let (chunk_tx, chunk_rx) = bounded(self.uploader.workers);
        let chunk_size = self.config.chunk_size as usize;
        let cancel = self.cancel.clone();
        let splitter: JoinHandle<Result<()>> = std::thread::spawn(move || {
            let result = split_into_chunks(final_reader, chunk_size, chunk_tx, &cancel);
            if result.is_err() {
                cancel.cancel();
            }
            result
        });

        // Stage 4: the worker pool.
        let (error_tx, error_rx) = unbounded();
        let workers = spawn_workers(
            &self.uploader,
            Arc::clone(&session),
            chunk_rx,
            Arc::clone(tracker),
            self.cancel.clone(),
            error_tx,
        );

        let mut errors = Vec::new();
        for worker in workers {
            if worker.join().is_err() {
                errors.push(thread_panic("upload worker"));
            }
        }
        errors.extend(error_rx.try_iter());
        errors.extend(join_stage_threads(packer, cipher, Some(splitter)));

        match pick_error(errors, &self.cancel) {
            None => {
                if let Err(e) = session.complete() {
                    session.abort();
                    return Err(e);
                }
                Ok(UploadReport {
                    object: object.to_string(),
                    bytes_transferred: tracker.transferred(),
                    multipart: true,
                    resumed,
                })
            }
            Some(e) => {
                session.abort();
                Err(e)
            }
        }
    }
}

/// Joins the long-running stage threads, collecting their failures. The
/// packer and cipher are always joined, even after an upload-side error,
/// so no thread outlives the pipeline.
fn join_stage_threads(
    packer: JoinHandle<Result<()>>,
    cipher: Option<JoinHandle<Result<()>>>,
    splitter: Option<JoinHandle<Result<()>>>,
) -> Vec<CloudArcError> {
    let mut errors = Vec::new();

    let mut collect = |name: &str, handle: JoinHandle<Result<()>>| match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => errors.push(e),
        Err(_) => errors.push(thread_panic(name)),
    };

    if let Some(splitter) = splitter {
        collect("splitter", splitter);
    }
    if let Some(cipher) = cipher {
        collect("cipher", cipher);
    }
    collect("packer", packer);
    errors
}

fn thread_panic(name: &str) -> CloudArcError {
    CloudArcError::Pipeline {
        stage: name.to_string(),
        description: "stage thread panicked".to_string(),
    }
}

/// Picks the error the run reports: the first non-cancellation failure
/// wins, later ones are logged; a run that only saw cancellation reports
/// the distinct cancelled error.
fn pick_error(errors: Vec<CloudArcError>, cancel: &CancelToken) -> Option<CloudArcError> {
    let mut first: Option<CloudArcError> = None;
    for error in errors {
        if error.is_cancelled() {
            continue;
        }
        if first.is_none() {
            first = Some(error);
        } else {
            warn!("Additional pipeline error suppressed: {}", error);
        }
    }
    if first.is_none() && cancel.is_cancelled() {
        first = Some(CloudArcError::Cancelled);
    }
    first
}

#[cfg(test)]
mod pipeline_tests;
