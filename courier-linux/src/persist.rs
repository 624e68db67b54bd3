//! File persistence: read source files, write received files into a directory.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Name used when the announced filename has no usable final component.
const FALLBACK_NAME: &str = "received_file";

/// Attempts at finding a free `name-N.ext` before giving up.
const MAX_SUFFIX: u32 = 1000;

/// Destination for received files.
pub trait FileSink: Send + Sync {
    /// Store `data` under (a variant of) `suggested_name`; returns the path written.
    fn save(&self, suggested_name: &str, data: &[u8]) -> io::Result<PathBuf>;
}

/// Writes into one directory. Never overwrites: clashes get a `-1`, `-2`, ... suffix.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FileSink for DirectorySink {
    fn save(&self, suggested_name: &str, data: &[u8]) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let name = sanitize(suggested_name);
        let base = Path::new(&name);
        let stem = base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(FALLBACK_NAME);
        let ext = base.extension().and_then(|s| s.to_str());

        for n in 0..=MAX_SUFFIX {
            let candidate = match (n, ext) {
                (0, _) => name.clone(),
                (n, Some(ext)) => format!("{stem}-{n}.{ext}"),
                (n, None) => format!("{stem}-{n}"),
            };
            let path = self.dir.join(candidate);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(data)?;
                    file.sync_all()?;
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free name for {name:?} in {}", self.dir.display()),
        ))
    }
}

/// Keep only the final path component of a peer-supplied name.
fn sanitize(suggested: &str) -> String {
    let last = suggested.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or_default();
    match last {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        name => name.to_string(),
    }
}

/// Read all bytes of a source file.
pub fn read_source(path: &Path) -> io::Result<Vec<u8>> {
    std::fs::read(path)
}
