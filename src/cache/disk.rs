//! Blocking filesystem helpers. Callers run these on the blocking pool.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub(crate) struct CachedFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Read a file and stamp its mtime with `now`. `Ok(None)` when absent.
///
/// The file is opened read-only; a failed touch leaves the entry readable and
/// only loses the recency refresh.
pub(crate) fn read_and_touch(path: &Path, now: SystemTime) -> io::Result<Option<Vec<u8>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    if let Err(err) = touch(&file, path, now) {
        debug!(
            target = "cache::disk",
            path = %path.display(),
            error = %err,
            "Failed to refresh mtime of cached file"
        );
    }
    Ok(Some(contents))
}

fn touch(file: &File, path: &Path, now: SystemTime) -> io::Result<()> {
    match file.set_modified(now) {
        Ok(()) => Ok(()),
        Err(_) => OpenOptions::new().write(true).open(path)?.set_modified(now),
    }
}

pub(crate) fn modified(path: &Path) -> io::Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata.modified().map(Some),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Write through a sibling temp file renamed into place, so readers never
/// observe a partial file. The new file's mtime is set to `mtime`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mtime: SystemTime) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "cache path has no parent"))?;
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.as_file().set_modified(mtime)?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Regular files directly inside `dir`. A missing directory is empty.
pub(crate) fn list_files(dir: &Path) -> io::Result<Vec<CachedFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    target = "cache::disk",
                    dir = %dir.display(),
                    error = %err,
                    "Skipping unreadable entry"
                );
                continue;
            }
        };
        let stat = entry
            .metadata()
            .and_then(|metadata| Ok((metadata.is_file(), metadata.len(), metadata.modified()?)));
        match stat {
            Ok((true, size, modified)) => files.push(CachedFile {
                path: entry.path(),
                size,
                modified,
            }),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                target = "cache::disk",
                path = %entry.path().display(),
                error = %err,
                "Skipping file with unreadable metadata"
            ),
        }
    }
    Ok(files)
}

/// Regular files anywhere below `dir`. Entries that vanish mid-walk are skipped.
pub(crate) fn walk_files(dir: &Path) -> Vec<CachedFile> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            Some(CachedFile {
                path: entry.into_path(),
                size: metadata.len(),
                modified: metadata.modified().ok()?,
            })
        })
        .collect()
}

/// First file named `name` below `dir`, depth first.
pub(crate) fn find_file(dir: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == name)
        .map(|entry| entry.into_path())
}

/// Delete a file, treating an already missing file as removed.
pub(crate) fn remove(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub(crate) fn age(now: SystemTime, modified: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}
