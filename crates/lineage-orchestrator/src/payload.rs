//! Payload packaging.
//!
//! A payload is a file or directory, relative to the calling execution's work
//! directory, that is shipped with a start request. Files are sent as-is;
//! directories are zipped in memory.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::{OrchestratorError, Result};

/// Turns a payload path into the bytes of a transportable bundle.
pub trait PayloadPackager: Send + Sync {
    /// Package `path`. Returns [`OrchestratorError::PayloadNotFound`] when the
    /// path does not exist.
    fn package(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Default packager: files pass through, directories become a zip archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipPackager;

impl PayloadPackager for ZipPackager {
    fn package(&self, path: &Path) -> Result<Vec<u8>> {
        if !path.exists() {
            return Err(OrchestratorError::PayloadNotFound {
                path: path.to_path_buf(),
            });
        }

        if path.is_dir() {
            debug!(path = %path.display(), "Archiving payload directory");
            return zip_dir(path).map_err(|reason| OrchestratorError::Payload {
                path: path.to_path_buf(),
                reason,
            });
        }

        std::fs::read(path).map_err(|e| OrchestratorError::Payload {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Resolve a payload path against the execution's work directory.
pub fn resolve(work_dir: &Path, payload: &Path) -> PathBuf {
    work_dir.join(payload)
}

fn zip_dir(root: &Path) -> std::result::Result<Vec<u8>, String> {
    let mut files = Vec::new();
    collect_entries(root, root, &mut files).map_err(|e| e.to_string())?;
    files.sort();

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for (name, is_dir) in files {
        if is_dir {
            zip.add_directory(name, options).map_err(|e| e.to_string())?;
        } else {
            let bytes = std::fs::read(root.join(&name)).map_err(|e| e.to_string())?;
            zip.start_file(name, options).map_err(|e| e.to_string())?;
            zip.write_all(&bytes).map_err(|e| e.to_string())?;
        }
    }

    let cursor = zip.finish().map_err(|e| e.to_string())?;
    Ok(cursor.into_inner())
}

/// Collect `(relative name, is_dir)` for everything under `dir`, using `/`
/// as separator.
fn collect_entries(
    base: &Path,
    dir: &Path,
    entries: &mut Vec<(String, bool)>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(base)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type()?.is_dir() {
            entries.push((format!("{relative}/"), true));
            collect_entries(base, &path, entries)?;
        } else {
            entries.push((relative, false));
        }
    }
    Ok(())
}
