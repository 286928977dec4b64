//! Process-level lock serializing corpus loads.
//!
//! - `confcorpus-load.lock` marks a process that is refreshing a cache file.
//! - The lock is an advisory OS file lock (flock) scoped to the cache path,
//!   held until the guard is dropped.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const LOAD_LOCK_FILE: &str = "confcorpus-load.lock";

/// Held while this process loads into a cache file.
pub struct LoadGuard {
    file: File,
    path: PathBuf,
}

impl LoadGuard {
    /// Lock file backing this guard
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Take the load lock for `cache_path`, failing if another process holds it.
pub fn acquire_load_guard(cache_path: &Path) -> Result<LoadGuard> {
    match try_acquire_load_guard(cache_path)? {
        Some(guard) => Ok(guard),
        None => anyhow::bail!(
            "another confcorpus process is loading into {}",
            cache_path.display()
        ),
    }
}

/// Take the load lock if it is free.
pub fn try_acquire_load_guard(cache_path: &Path) -> Result<Option<LoadGuard>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(LOAD_LOCK_FILE, cache_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // owner info for debugging
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = writeln!(file, "cache={}", cache_path.display());
            let _ = file.flush();

            tracing::debug!(lock = %path.display(), "Acquired load lock");
            Ok(Some(LoadGuard { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("confcorpus");
    dir
}

fn scoped_lock_filename(base_filename: &str, cache_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    cache_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("confcorpus process locks currently require Unix (macOS/Linux)");
