use std::fs::Metadata;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use crate::{CloudArcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// One archive member produced by the walker, in archive order.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Archive-relative name with `/` separators. Directory names carry a
    /// trailing slash.
    pub logical_name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub mtime: u64,
    pub size: u64,
    pub path: PathBuf,
}

/// Enumerates the configured sources in declared order. Each directory
/// source is traversed depth-first with children sorted lexicographically
/// by byte value, so the archive layout is deterministic across runs.
/// Symlinks are reported as symlink entries and never followed.
pub struct SourceWalker {
    sources: Vec<PathBuf>,
}

impl SourceWalker {
    pub fn new(sources: &[PathBuf]) -> Self {
        SourceWalker {
            sources: sources.to_vec(),
        }
    }

    pub fn entries(&self) -> EntryIter {
        EntryIter {
            sources: self.sources.clone().into_iter(),
            current: None,
        }
    }

    /// Sums the sizes of regular files across all sources. Used only as the
    /// progress denominator; tar overhead and cipher expansion are not
    /// accounted for.
    pub fn estimate_total(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in self.entries() {
            let entry = entry?;
            if entry.kind == EntryKind::File {
                total += entry.size;
            }
        }
        Ok(total)
    }
}

pub struct EntryIter {
    sources: std::vec::IntoIter<PathBuf>,
    current: Option<CurrentSource>,
}

enum CurrentSource {
    Dir {
        base: PathBuf,
        prefix: String,
        iter: walkdir::IntoIter,
    },
    Single {
        path: PathBuf,
        done: bool,
    },
}

impl Iterator for EntryIter {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = &mut self.current {
                match current.next_entry() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            let source = self.sources.next()?;
            match CurrentSource::start(source) {
                Ok(current) => self.current = Some(current),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl CurrentSource {
    fn start(source: PathBuf) -> Result<Self> {
        let metadata = std::fs::symlink_metadata(&source).map_err(|e| source_io(&source, e))?;
        if metadata.is_dir() {
            let prefix = basename(&source)?;
            let iter = WalkDir::new(&source)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter();
            Ok(CurrentSource::Dir {
                base: source,
                prefix,
                iter,
            })
        } else {
            Ok(CurrentSource::Single {
                path: source,
                done: false,
            })
        }
    }

    fn next_entry(&mut self) -> Option<Result<ArchiveEntry>> {
        match self {
            CurrentSource::Single { path, done } => {
                if *done {
                    return None;
                }
                *done = true;
                Some(single_entry(path))
            }
            CurrentSource::Dir { base, prefix, iter } => {
                let entry = match iter.next()? {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e
                            .path()
                            .map(Path::to_path_buf)
                            .unwrap_or_else(|| base.clone());
                        let io = e.into_io_error().unwrap_or_else(|| {
                            std::io::Error::other("directory traversal failed")
                        });
                        return Some(Err(source_io(&path, io)));
                    }
                };
                Some(dir_entry(base, prefix, &entry))
            }
        }
    }
}

fn single_entry(path: &Path) -> Result<ArchiveEntry> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| source_io(path, e))?;
    let name = basename(path)?;
    Ok(build_entry(name, path, &metadata))
}

fn dir_entry(base: &Path, prefix: &str, entry: &walkdir::DirEntry) -> Result<ArchiveEntry> {
    let metadata = entry
        .metadata()
        .map_err(|e| {
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("stat failed"));
            source_io(entry.path(), io)
        })?;

    let rel = entry
        .path()
        .strip_prefix(base)
        .expect("walked path is always under its base");
    let mut name = String::from(prefix);
    for component in rel.components() {
        name.push('/');
        name.push_str(&component_name(component.as_os_str(), entry.path())?);
    }
    if metadata.is_dir() {
        name.push('/');
    }

    Ok(build_entry(name, entry.path(), &metadata))
}

fn build_entry(logical_name: String, path: &Path, metadata: &Metadata) -> ArchiveEntry {
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    ArchiveEntry {
        logical_name,
        kind,
        mode: metadata.permissions().mode() & 0o7777,
        mtime,
        size: if kind == EntryKind::File {
            metadata.len()
        } else {
            0
        },
        path: path.to_path_buf(),
    }
}

fn basename(path: &Path) -> Result<String> {
    let name = path.file_name().ok_or_else(|| CloudArcError::InvalidConfig {
        description: format!("Source path has no base name: {}", path.display()),
    })?;
    component_name(name, path)
}

fn component_name(name: &std::ffi::OsStr, path: &Path) -> Result<String> {
    name.to_str()
        .map(str::to_string)
        .ok_or_else(|| source_io(
            path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "path is not valid UTF-8",
            ),
        ))
}

fn source_io(path: &Path, source: std::io::Error) -> CloudArcError {
    CloudArcError::SourceIo {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn names(walker: &SourceWalker) -> Vec<String> {
        walker
            .entries()
            .map(|e| e.unwrap().logical_name)
            .collect()
    }

    #[test]
    fn test_directory_entries_are_prefixed_and_sorted() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("b.bin"), b"bb").unwrap();
        fs::write(root.join("a.bin"), b"aa").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("c.bin"), b"cc").unwrap();

        let walker = SourceWalker::new(&[root]);
        assert_eq!(
            names(&walker),
            vec!["data/", "data/a.bin", "data/b.bin", "data/sub/", "data/sub/c.bin"]
        );
    }

    #[test]
    fn test_single_file_uses_basename() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, b"abc").unwrap();

        let walker = SourceWalker::new(&[file]);
        let entries: Vec<ArchiveEntry> = walker.entries().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].logical_name, "hello.txt");
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, 3);
    }

    #[test]
    fn test_multiple_sources_in_declared_order() {
        let dir = tempdir().unwrap();
        let one = dir.path().join("one.txt");
        fs::write(&one, b"oneoneone\n").unwrap();
        let two = dir.path().join("two");
        fs::create_dir(&two).unwrap();
        fs::write(two.join("x"), b"x".repeat(20)).unwrap();

        let walker = SourceWalker::new(&[one, two]);
        assert_eq!(names(&walker), vec!["one.txt", "two/", "two/x"]);
    }

    #[test]
    fn test_symlinks_are_recorded_not_followed() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("real.txt"), b"real").unwrap();
        std::os::unix::fs::symlink("real.txt", root.join("link")).unwrap();

        let walker = SourceWalker::new(&[root]);
        let entries: Vec<ArchiveEntry> = walker.entries().map(|e| e.unwrap()).collect();
        let link = entries
            .iter()
            .find(|e| e.logical_name == "tree/link")
            .expect("missing symlink entry");
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(link.size, 0);
    }

    #[test]
    fn test_estimate_total_sums_regular_files_only() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("b"), vec![0u8; 50]).unwrap();

        let walker = SourceWalker::new(&[root]);
        assert_eq!(walker.estimate_total().unwrap(), 150);
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let walker = SourceWalker::new(&[PathBuf::from("/nonexistent/cloudarc-walker")]);
        let result: Result<Vec<ArchiveEntry>> = walker.entries().collect();
        assert!(matches!(result, Err(CloudArcError::SourceIo { .. })));
    }

    #[test]
    fn test_deterministic_across_runs() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        for name in ["z", "m", "a", "q"] {
            fs::write(root.join(name), name).unwrap();
        }

        let walker = SourceWalker::new(&[root]);
        let first = names(&walker);
        let second = names(&walker);
        assert_eq!(first, second);
        assert_eq!(first, vec!["data/", "data/a", "data/m", "data/q", "data/z"]);
    }
}
