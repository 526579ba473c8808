use std::io::{Read, Write};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use log::debug;

use crate::cancel::CancelToken;
use crate::util::{is_broken_pipe, read_full};
use crate::{CloudArcError, Result};

/// Plaintext bytes sealed per frame. Small enough to keep the re-transmit
/// cost of a corrupt frame modest, large enough that the per-frame length
/// prefix and tag stay negligible.
pub const FRAME_SIZE: usize = 64 * 1024;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

type FrameNonce = Nonce<<Aes256Gcm as AeadCore>::NonceSize>;

/// The encrypted stream layout is: a random 12-byte initial nonce, then
/// zero or more frames of `u32be ciphertext-length || ciphertext`, where
/// the ciphertext includes the AEAD tag. The nonce is interpreted as a
/// big-endian counter and incremented before each successive frame, so no
/// nonce is ever reused under one key within a stream.
struct NonceCounter {
    initial: [u8; NONCE_LEN],
    current: [u8; NONCE_LEN],
    started: bool,
}

impl NonceCounter {
    fn random() -> Self {
        let initial: [u8; NONCE_LEN] = Aes256Gcm::generate_nonce(&mut OsRng).into();
        Self::starting_at(initial)
    }

    fn starting_at(initial: [u8; NONCE_LEN]) -> Self {
        NonceCounter {
            initial,
            current: initial,
            started: false,
        }
    }

    fn initial(&self) -> [u8; NONCE_LEN] {
        self.initial
    }

    /// Returns the nonce for the next frame, advancing the counter.
    fn next(&mut self) -> Result<[u8; NONCE_LEN]> {
        if !self.started {
            self.started = true;
            return Ok(self.current);
        }
        for byte in self.current.iter_mut().rev() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
        if self.current == self.initial {
            return Err(CloudArcError::Crypto {
                description: "Nonce counter exhausted; refusing to reuse a nonce".to_string(),
            });
        }
        Ok(self.current)
    }
}

pub struct StreamEncryptor {
    cipher: Aes256Gcm,
}

impl StreamEncryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CloudArcError::Crypto {
            description: format!("Key must be 32 bytes for AES-256, got {} bytes", key.len()),
        })?;
        Ok(StreamEncryptor { cipher })
    }

    /// Encrypts `reader` into `writer` frame by frame until EOF. A broken
    /// pipe on the output side means downstream already finished or failed
    /// and is not reported as a fresh error; the orchestrator carries the
    /// original cause.
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut nonces = NonceCounter::random();
        if let Err(e) = writer.write_all(&nonces.initial()) {
            return map_write_error(e);
        }

        let mut frame = vec![0u8; FRAME_SIZE];
        let mut frames_written = 0u64;
        loop {
            cancel.check()?;
            let n = read_full(&mut reader, &mut frame)?;
            if n == 0 {
                break;
            }

            let nonce = nonces.next()?;
            let ciphertext = self
                .cipher
                .encrypt(&FrameNonce::from(nonce), &frame[..n])
                .map_err(|_| CloudArcError::Crypto {
                    description: "AEAD seal failed".to_string(),
                })?;

            let len = ciphertext.len() as u32;
            let result = writer
                .write_all(&len.to_be_bytes())
                .and_then(|_| writer.write_all(&ciphertext));
            if let Err(e) = result {
                return map_write_error(e);
            }
            frames_written += 1;

            if n < FRAME_SIZE {
                break;
            }
        }

        if let Err(e) = writer.flush() {
            return map_write_error(e);
        }
        debug!("Encryption finished after {} frames", frames_written);
        Ok(())
    }
}

pub struct StreamDecryptor {
    cipher: Aes256Gcm,
}

impl StreamDecryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CloudArcError::Crypto {
            description: format!("Key must be 32 bytes for AES-256, got {} bytes", key.len()),
        })?;
        Ok(StreamDecryptor { cipher })
    }

    /// Inverse of [`StreamEncryptor::encrypt_stream`]. Any tag mismatch is
    /// fatal: a tampered frame must never produce plaintext.
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<()> {
        let mut initial = [0u8; NONCE_LEN];
        reader
            .read_exact(&mut initial)
            .map_err(|e| CloudArcError::Crypto {
                description: format!("Failed to read stream nonce: {}", e),
            })?;
        let mut nonces = NonceCounter::starting_at(initial);

        loop {
            let len = match read_frame_len(&mut reader)? {
                Some(len) => len as usize,
                None => break,
            };
            if len < TAG_LEN || len > FRAME_SIZE + TAG_LEN {
                return Err(CloudArcError::Crypto {
                    description: format!("Invalid frame length {}", len),
                });
            }

            let mut ciphertext = vec![0u8; len];
            reader
                .read_exact(&mut ciphertext)
                .map_err(|e| CloudArcError::Crypto {
                    description: format!("Truncated frame: {}", e),
                })?;

            let nonce = nonces.next()?;
            let plaintext = self
                .cipher
                .decrypt(&FrameNonce::from(nonce), ciphertext.as_slice())
                .map_err(|_| CloudArcError::Crypto {
                    description: "AEAD authentication failed; wrong key or tampered data"
                        .to_string(),
                })?;
            writer.write_all(&plaintext)?;
        }

        writer.flush()?;
        Ok(())
    }
}

/// Reads the 4-byte frame length, distinguishing a clean end of stream
/// (no bytes at all) from a truncated prefix.
fn read_frame_len<R: Read>(reader: &mut R) -> Result<Option<u32>> {
    let mut prefix = [0u8; 4];
    let n = read_full(reader, &mut prefix)?;
    match n {
        0 => Ok(None),
        4 => Ok(Some(u32::from_be_bytes(prefix))),
        _ => Err(CloudArcError::Crypto {
            description: "Truncated frame length prefix".to_string(),
        }),
    }
}

fn map_write_error(err: std::io::Error) -> Result<()> {
    if is_broken_pipe(&err) {
        debug!("Cipher output pipe closed; downstream already finished");
        Ok(())
    } else {
        Err(CloudArcError::IoError { source: err })
    }
}
