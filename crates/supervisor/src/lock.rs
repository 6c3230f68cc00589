//! One-gateway-per-config lock file in the OS temp directory.
//!
//! The path is `<tmp>/<lockDir>/gateway.<hash8>.lock` where `hash8` is the
//! first 8 hex chars of the SHA-256 of the absolute config path. The file
//! holds the owner's pid. Presence is advisory: holders are always checked
//! for liveness.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use {
    sha2::{Digest, Sha256},
    tracing::{debug, info, warn},
};

use crate::{Error, Result, pid::write_atomic, process::ProcessOps};

/// Per-user directory under the temp dir.
#[must_use]
pub fn lock_dir_name() -> String {
    #[cfg(unix)]
    {
        format!("switchboard-{}", nix::unistd::getuid())
    }
    #[cfg(not(unix))]
    {
        "switchboard".to_string()
    }
}

/// Absolute form of `path` without requiring it to exist.
#[must_use]
pub fn absolute_config_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// First 8 hex chars of the SHA-256 of the absolute config path.
#[must_use]
pub fn config_hash8(config_path: &Path) -> String {
    let absolute = absolute_config_path(config_path);
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    digest
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[must_use]
pub fn lock_path(config_path: &Path) -> PathBuf {
    std::env::temp_dir()
        .join(lock_dir_name())
        .join(format!("gateway.{}.lock", config_hash8(config_path)))
}

/// Delete the lock for `config_path` if present. Only call once no live
/// holder can exist (after orphan recovery). Returns whether a file was
/// removed.
pub fn remove_stale_lock(config_path: &Path) -> Result<bool> {
    let path = lock_path(config_path);
    match fs::remove_file(&path) {
        Ok(()) => {
            info!(path = %path.display(), "removed stale gateway lock");
            Ok(true)
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Held by the running gateway; the file is removed on drop.
#[derive(Debug)]
pub struct GatewayLock {
    path: PathBuf,
    pid: u32,
}

impl GatewayLock {
    /// Take the lock for `config_path`, replacing a lock whose holder is
    /// gone. Fails with [`Error::AlreadyLocked`] when a live process holds it.
    pub fn acquire(config_path: &Path, ops: &dyn ProcessOps) -> Result<Self> {
        Self::acquire_at(lock_path(config_path), ops)
    }

    pub fn acquire_at(path: PathBuf, ops: &dyn ProcessOps) -> Result<Self> {
        let own = std::process::id();
        if let Some(holder) = read_holder(&path)
            && holder != own
        {
            if ops.is_alive(holder) {
                return Err(Error::AlreadyLocked { path, pid: holder });
            }
            warn!(path = %path.display(), pid = holder, "replacing lock of dead gateway");
        }
        write_atomic(&path, own.to_string().as_bytes())?;
        debug!(path = %path.display(), pid = own, "acquired gateway lock");
        Ok(Self { path, pid: own })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GatewayLock {
    fn drop(&mut self) {
        // Leave a lock that someone else took over in place.
        if read_holder(&self.path) == Some(self.pid) {
            let _ = fs::remove_file(&self.path);
        }
    }
}
