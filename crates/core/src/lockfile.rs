use std::fs::File;
use std::io;
use std::path::PathBuf;

use log::warn;

use crate::error::Error;

/// The single-writer lock on a workdir.
///
/// Acquisition creates the `.lock` file with `File::create_new` (`O_EXCL`)
/// and fails with [`Error::LockBusy`] if it already exists. Dropping the
/// guard deletes the file, releasing the lock. Held for the duration of any
/// command that mutates blocks, heads or peers; readers proceed without it.
#[derive(Debug)]
pub struct Lockfile {
    path: PathBuf,
}

impl Lockfile {
    pub fn acquire(path: leech_paths::LockFile) -> Result<Self, Error> {
        match File::create_new(path.as_path()) {
            Ok(_) => Ok(Self { path: path.into() }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::LockBusy),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to release lock {}: {e}", self.path.display());
        }
    }
}
