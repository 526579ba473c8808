use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

/// Creates a bounded in-process byte pipe with one writer and one reader.
///
/// Writes block while the buffer is full and the reader is alive; reads
/// block while the buffer is empty and the writer is alive. Dropping the
/// writer signals EOF to the reader; dropping the reader poisons later
/// writes with `BrokenPipe`. Both condvars are notified on every close so
/// no thread can stay blocked once a half goes away.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    assert!(capacity > 0, "pipe capacity must be non-zero");
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            writer_closed: false,
            reader_closed: false,
        }),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
    });
    (
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    )
}

struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
}

struct PipeShared {
    state: Mutex<PipeState>,
    not_full: Condvar,
    not_empty: Condvar,
}

pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.reader_closed {
                return Err(Error::new(ErrorKind::BrokenPipe, "pipe reader closed"));
            }
            let room = state.capacity - state.buf.len();
            if room > 0 {
                let n = room.min(data.len());
                state.buf.extend(&data[..n]);
                self.shared.not_empty.notify_one();
                return Ok(n);
            }
            state = self.shared.not_full.wait(state).unwrap();
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.writer_closed = true;
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for slot in out.iter_mut().take(n) {
                    *slot = state.buf.pop_front().unwrap();
                }
                self.shared.not_full.notify_one();
                return Ok(n);
            }
            if state.writer_closed {
                return Ok(0);
            }
            state = self.shared.not_empty.wait(state).unwrap();
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.reader_closed = true;
        state.buf.clear();
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }
}
