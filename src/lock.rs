//! Single-instance lock for the daemon.
//!
//! Two bridges racing on one engine socket would fight over the shared
//! infrastructure containers, so startup takes a non-blocking exclusive file
//! lock and refuses to run when it is already held.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Lock guard that unlocks and removes the lock file on drop.
#[derive(Debug)]
pub struct DaemonLock {
    file: File,
    path: PathBuf,
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        // Best-effort unlock; ignore errors
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

fn candidate_lock_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(p) = std::env::var("DOCKERBRIDGE_LOCK_PATH") {
        if !p.trim().is_empty() {
            paths.push(PathBuf::from(p));
        }
    }
    paths.push(PathBuf::from("/run/dockerbridge/dockerbridge.lock"));
    if let Some(home) = home::home_dir() {
        paths.push(
            home.join(".local")
                .join("state")
                .join("dockerbridge")
                .join("dockerbridge.lock"),
        );
    }
    paths.push(std::env::temp_dir().join("dockerbridge.lock"));
    paths
}

/// Acquire a non-blocking exclusive lock at the first usable candidate path.
pub fn acquire_lock() -> io::Result<DaemonLock> {
    let mut last_err: Option<io::Error> = None;
    for p in candidate_lock_paths() {
        match acquire_lock_at(&p) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::Other => return Err(e),
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no usable lock path")))
}

/// Acquire a non-blocking exclusive lock at `path`. A held lock yields
/// `ErrorKind::Other` with a stable "already running" message.
pub fn acquire_lock_at(path: &Path) -> io::Result<DaemonLock> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(DaemonLock {
            file,
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(io::Error::other(
            "another dockerbridge is already running (lock held)",
        )),
        Err(e) => Err(e),
    }
}
