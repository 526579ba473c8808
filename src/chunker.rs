use std::io::Read;
use std::time::Duration;

use crossbeam_channel::{SendTimeoutError, Sender};
use log::debug;

use crate::cancel::CancelToken;
use crate::util::read_full;
use crate::{CloudArcError, Result};

/// One upload part in flight between the splitter and the worker pool.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 1-based, strictly contiguous.
    pub seq: u32,
    pub data: Vec<u8>,
    pub is_final: bool,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reads the final pipeline stream and emits `chunk_size` slices into the
/// bounded queue, numbering from 1. Only the last chunk may be short. The
/// splitter reads one chunk ahead so the final chunk is flagged even when
/// the stream length is an exact multiple of `chunk_size`.
pub fn split_into_chunks<R: Read>(
    mut reader: R,
    chunk_size: usize,
    tx: Sender<Chunk>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut seq = 0u32;
    let mut pending: Option<Vec<u8>> = None;

    loop {
        cancel.check()?;

        let mut buf = vec![0u8; chunk_size];
        let n = read_full(&mut reader, &mut buf).map_err(|e| CloudArcError::Pipeline {
            stage: "splitter".to_string(),
            description: format!("Failed to read archive stream: {}", e),
        })?;
        buf.truncate(n);

        if let Some(data) = pending.take() {
            seq += 1;
            let chunk = Chunk {
                seq,
                data,
                is_final: n == 0,
            };
            if !send_chunk(&tx, chunk, cancel) {
                return Ok(());
            }
        }

        if n == 0 {
            if seq == 0 {
                // Empty stream: emit one empty final chunk so the uploader
                // still creates the remote object.
                let chunk = Chunk {
                    seq: 1,
                    data: Vec::new(),
                    is_final: true,
                };
                send_chunk(&tx, chunk, cancel);
            }
            debug!("Splitter finished after {} chunks", seq.max(1));
            return Ok(());
        }
        pending = Some(buf);
    }
}

/// Blocks until the queue accepts the chunk, the consumers disappear, or
/// cancellation fires. Returns false when the chunk was dropped.
fn send_chunk(tx: &Sender<Chunk>, chunk: Chunk, cancel: &CancelToken) -> bool {
    let mut chunk = chunk;
    loop {
        if cancel.is_cancelled() {
            debug!("Splitter dropping chunk {} on cancellation", chunk.seq);
            return false;
        }
        match tx.send_timeout(chunk, Duration::from_millis(100)) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => chunk = returned,
            Err(SendTimeoutError::Disconnected(returned)) => {
                debug!("Chunk queue closed; dropping chunk {}", returned.seq);
                return false;
            }
        }
    }
}
