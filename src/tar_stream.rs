use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use log::debug;
use tar::{Builder, EntryType, Header};

use crate::cancel::CancelToken;
use crate::util::is_broken_pipe;
use crate::walker::{ArchiveEntry, EntryKind, SourceWalker};
use crate::{CloudArcError, Result};

/// Streams walker entries into a POSIX ustar archive.
///
/// The end-of-archive marker is written only when every source packed
/// successfully; on error or cancellation the output is simply dropped,
/// which closes the pipe and propagates EOF downstream. A broken pipe from
/// the output side means downstream finished or failed first; the packer
/// reports success and leaves the real cause to the orchestrator.
pub struct TarPacker {
    buffer_size: usize,
}

impl TarPacker {
    pub fn new(buffer_size: usize) -> Self {
        TarPacker { buffer_size }
    }

    pub fn pack<W: Write>(
        &self,
        walker: &SourceWalker,
        writer: W,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut builder = Builder::new(writer);

        for entry in walker.entries() {
            cancel.check()?;
            let entry = entry?;
            debug!("Packing {}", entry.logical_name);
            match self.append_entry(&mut builder, &entry) {
                Ok(()) => {}
                Err(e) if is_broken_pipe(&e) => {
                    debug!("Tar output pipe closed; stopping pack early");
                    return Ok(());
                }
                Err(e) => {
                    return Err(CloudArcError::SourceIo {
                        path: entry.path.display().to_string(),
                        source: e,
                    })
                }
            }
        }

        match builder.finish() {
            Ok(()) => Ok(()),
            Err(e) if is_broken_pipe(&e) => {
                debug!("Tar output pipe closed while finishing archive");
                Ok(())
            }
            Err(e) => Err(CloudArcError::IoError { source: e }),
        }
    }

    fn append_entry<W: Write>(
        &self,
        builder: &mut Builder<W>,
        entry: &ArchiveEntry,
    ) -> std::io::Result<()> {
        let mut header = Header::new_ustar();
        header.set_mode(entry.mode);
        header.set_mtime(entry.mtime);
        header.set_uid(0);
        header.set_gid(0);

        match entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(
                    &mut header,
                    Path::new(&entry.logical_name),
                    std::io::empty(),
                )
            }
            EntryKind::File => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(entry.size);
                let file = File::open(&entry.path)?;
                let reader = BufReader::with_capacity(self.buffer_size, file);
                builder.append_data(&mut header, Path::new(&entry.logical_name), reader)
            }
            EntryKind::Symlink => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                let target = std::fs::read_link(&entry.path)?;
                builder.append_link(&mut header, Path::new(&entry.logical_name), target)
            }
            EntryKind::Other => {
                debug!("Skipping special file {}", entry.logical_name);
                Ok(())
            }
        }
    }
}
