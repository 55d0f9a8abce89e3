// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-tenant advisory training lock.
//!
//! Bulk training that must not run twice for the same tenant takes a
//! lock file under the configuration directory, named
//! `<tenantId>_training.lock` and containing the holder's decimal PID.
//! Acquisition is non-blocking: a live holder yields a contention
//! error, while a lock whose owner has died is reclaimed in place.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::core::error::{MarkovError, MarkovResult};

/// Held advisory lock; the file is removed on drop.
#[derive(Debug)]
pub struct TrainingLock {
    path: PathBuf,
}

impl TrainingLock {
    /// Try to take the training lock for `tenant_id`.
    ///
    /// # Errors
    /// - [`MarkovError::Contention`] when another live process holds it
    /// - [`MarkovError::Io`] for filesystem failures
    pub fn acquire(config_dir: &Path, tenant_id: &str) -> MarkovResult<Self> {
        fs::create_dir_all(config_dir)?;
        let path = config_dir.join(format!("{tenant_id}_training.lock"));

        match try_create(&path) {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if let Some(pid) = live_holder(&path) {
                    return Err(MarkovError::contention_with_pid(
                        format!("tenant '{tenant_id}' is being trained by pid {pid}"),
                        pid,
                    ));
                }
                // stale: the recorded process is gone (or the file is
                // unreadable garbage), reclaim it
                log::warn!(
                    "reclaiming stale training lock for tenant '{tenant_id}' at {}",
                    path.display()
                );
                fs::remove_file(&path)?;
                match try_create(&path) {
                    Ok(()) => Ok(Self { path }),
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        Err(MarkovError::contention(format!(
                            "tenant '{tenant_id}' lock was re-taken during reclaim"
                        )))
                    }
                    Err(e) => Err(MarkovError::Io(e)),
                }
            }
            Err(e) => Err(MarkovError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TrainingLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!(
                "failed to remove training lock {}: {e}",
                self.path.display()
            );
        }
    }
}

/// Exclusive-create the lock file with our PID as its body.
fn try_create(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(std::process::id().to_string().as_bytes())?;
    file.sync_all()
}

/// PID recorded in the lock file, if that process is still alive.
fn live_holder(path: &Path) -> Option<u32> {
    let body = fs::read_to_string(path).ok()?;
    let pid = body.trim().parse::<u32>().ok()?;
    pid_alive(pid).then_some(pid)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // Signal 0 probes existence without delivering anything. EPERM
    // still means the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
