//! Binary storage layer: chunked base + append-only delta.
//!
//! The base is the durable representation of the graph: a `base.bin`
//! manifest (header + fixed-width node index) plus one chunk file per
//! contiguous sender range. The delta is an append-only, CRC-protected log
//! of recent edge mutations that consolidation folds back into the base.
//!
//! Layout on disk:
//!
//! ```text
//! <storage_dir>/
//!   base.bin              manifest (header + node index)
//!   base_<lo>_<hi>.bin    synapse chunks, sender range inclusive
//!   delta.bin             append-only log, zero-length after consolidate
//!   .lock                 process-exclusivity lock file
//! ```

pub(crate) mod base;
pub(crate) mod delta;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::registry::{NodeId, Tick};

/// One outgoing synapse as materialized by the graph view
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SynapseRec {
    /// Receiving node
    pub receiver: NodeId,
    /// Learned weight in `[0, 1]`
    pub weight: f32,
    /// Tick of the last update
    pub tick: Tick,
}

/// Exclusive lock on a storage directory.
///
/// Single-writer-process is assumed; the lock file records the owning pid
/// and is removed on drop. A lock left behind by a dead process is reclaimed.
#[derive(Debug)]
pub(crate) struct DirLock {
    path: PathBuf,
}

impl DirLock {
    pub(crate) fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(".lock");
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let _ = write!(f, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(&path) {
                    let _ = fs::remove_file(&path);
                    return Self::acquire(dir);
                }
                Err(EngineError::io(
                    format!("storage directory {} is locked by another process", dir.display()),
                    e,
                ))
            }
            Err(e) => Err(EngineError::io("creating storage lock file", e)),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn lock_is_stale(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return false;
    };
    pid != std::process::id() && !Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn lock_is_stale(_path: &Path) -> bool {
    false
}

/// fsync the directory entry so renames are durable across power loss.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| EngineError::io(format!("syncing directory {}", dir.display()), e))
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
