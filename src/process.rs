//! Host process control: relaunching and the restart mutex.
//!
//! A resolver that asks for a restart launches a fresh copy of the host while
//! holding a named mutex. The new instance waits on that mutex before it
//! starts resolving, so two resolvers never patch the catalog at once.

use std::path::Path;
use std::process::Command;

use tracing::{info, warn};

use crate::error::{Error, Result};

#[cfg(target_os = "windows")]
use windows::{
    core::w,
    Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0},
    Win32::System::Threading::{
        CreateMutexW, OpenMutexW, ReleaseMutex, WaitForSingleObject, INFINITE,
        SYNCHRONIZATION_SYNCHRONIZE,
    },
};

/// Name of the mutex held across a relaunch.
pub const RESTART_MUTEX: &str = "Global\\NoCEG";

/// Start a new copy of `executable` and return without waiting for it.
pub fn relaunch(executable: &Path) -> Result<u32> {
    let child = Command::new(executable)
        .spawn()
        .map_err(|e| Error::RelaunchFailed(format!("{}: {}", executable.display(), e)))?;
    info!(pid = child.id(), path = %executable.display(), "relaunched host");
    Ok(child.id())
}

/// Owned handle to a named mutex; closed on drop.
#[cfg(target_os = "windows")]
pub struct NamedMutex {
    handle: HANDLE,
    held: bool,
}

#[cfg(target_os = "windows")]
impl NamedMutex {
    /// Create (or open) the restart mutex.
    pub fn create() -> Result<Self> {
        let handle = unsafe { CreateMutexW(None, false, w!("Global\\NoCEG")) }?;
        Ok(Self {
            handle,
            held: false,
        })
    }

    /// Open the restart mutex if some instance created it.
    pub fn open() -> Option<Self> {
        unsafe { OpenMutexW(SYNCHRONIZATION_SYNCHRONIZE, false, w!("Global\\NoCEG")) }
            .ok()
            .map(|handle| Self {
                handle,
                held: false,
            })
    }

    /// Take ownership without blocking.
    pub fn try_acquire(&mut self) -> Result<()> {
        if unsafe { WaitForSingleObject(self.handle, 0) } != WAIT_OBJECT_0 {
            return Err(Error::MutexUnavailable);
        }
        self.held = true;
        Ok(())
    }

    /// Block until ownership is granted.
    pub fn acquire(&mut self) {
        unsafe { WaitForSingleObject(self.handle, INFINITE) };
        self.held = true;
    }

    pub fn release(&mut self) {
        if self.held {
            if let Err(e) = unsafe { ReleaseMutex(self.handle) } {
                warn!(error = %e, "failed to release {}", RESTART_MUTEX);
            }
            self.held = false;
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

#[cfg(target_os = "windows")]
impl Drop for NamedMutex {
    fn drop(&mut self) {
        self.release();
        let _ = unsafe { CloseHandle(self.handle) };
    }
}

/// Relaunch the current executable while holding the restart mutex.
#[cfg(target_os = "windows")]
pub fn self_restart() -> Result<()> {
    let mut mutex = NamedMutex::create()?;
    mutex.try_acquire()?;
    let executable = std::env::current_exe()?;
    relaunch(&executable)?;
    mutex.release();
    Ok(())
}

/// Wait for a previous instance to finish relaunching us, if one exists.
#[cfg(target_os = "windows")]
pub fn wait_for_restart_mutex() {
    if let Some(mut mutex) = NamedMutex::open() {
        tracing::debug!("waiting on {}", RESTART_MUTEX);
        mutex.acquire();
        mutex.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relaunch_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let err = relaunch(&dir.path().join("missing.exe")).unwrap_err();
        assert!(matches!(err, Error::RelaunchFailed(ref msg) if msg.contains("missing.exe")));
    }

    #[cfg(target_os = "windows")]
    #[test]
    fn test_restart_mutex_acquire_release() {
        let mut owner = NamedMutex::create().unwrap();
        owner.try_acquire().unwrap();
        assert!(owner.is_held());

        // Another thread cannot take it while it is held.
        let contended = std::thread::spawn(|| {
            let mut other = NamedMutex::open().unwrap();
            other.try_acquire().is_err()
        })
        .join()
        .unwrap();
        assert!(contended);

        owner.release();
        assert!(!owner.is_held());
        // A second release is a no-op.
        owner.release();

        let free = std::thread::spawn(|| {
            let mut other = NamedMutex::open().unwrap();
            let acquired = other.try_acquire().is_ok();
            other.release();
            acquired
        })
        .join()
        .unwrap();
        assert!(free);
    }
}
