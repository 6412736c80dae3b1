//! Control over the store's server process during a migration.
//!
//! The migration must not run while the server is using the database, and
//! no two migrations may run at once. [`LockFileService`] implements both
//! with plain files in the data directory: the server keeps a pid file
//! while it runs and watches for a shutdown request file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use pimstore_core::error::{PimError, Result};

const LOCK_FILE_NAME: &str = "pimstore.lock";
const PID_FILE_NAME: &str = "pimstore.pid";
const SHUTDOWN_REQUEST_FILE_NAME: &str = "pimstore.shutdown";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub trait ServiceControl: Send {
    fn is_running(&self) -> bool;

    /// Ask the service to stop and wait up to `timeout` for it to exit.
    fn stop(&mut self, timeout: Duration) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Take the exclusive migration lock.
    fn acquire_lock(&mut self) -> Result<()>;

    fn release_lock(&mut self);
}

#[derive(Debug)]
pub struct LockFileService {
    dir: PathBuf,
    locked: bool,
}

impl LockFileService {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locked: false,
        }
    }

    pub fn lock_file(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(PID_FILE_NAME)
    }

    pub fn shutdown_request_file(&self) -> PathBuf {
        self.dir.join(SHUTDOWN_REQUEST_FILE_NAME)
    }

    fn remove_if_exists(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ServiceControl for LockFileService {
    fn is_running(&self) -> bool {
        self.pid_file().exists()
    }

    fn stop(&mut self, timeout: Duration) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.shutdown_request_file(), b"")?;
        debug!(dir = %self.dir.display(), "Shutdown requested");

        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return Err(PimError::Timeout(format!(
                    "service still running after {} ms",
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        info!("Service stopped");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Self::remove_if_exists(&self.shutdown_request_file())?;
        info!("Service restart requested");
        Ok(())
    }

    fn acquire_lock(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.lock_file();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                self.locked = true;
                debug!(path = %path.display(), "Migration lock acquired");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(PimError::Config(
                format!("lock file {} is held by another process", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn release_lock(&mut self) {
        if !self.locked {
            return;
        }
        if let Err(e) = Self::remove_if_exists(&self.lock_file()) {
            warn!(error = %e, "Failed to release migration lock");
        }
        self.locked = false;
    }
}

impl Drop for LockFileService {
    fn drop(&mut self) {
        self.release_lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = LockFileService::new(dir.path());
        let mut second = LockFileService::new(dir.path());

        first.acquire_lock().unwrap();
        assert!(second.acquire_lock().is_err());

        first.release_lock();
        second.acquire_lock().unwrap();
    }

    #[test]
    fn test_dropping_holder_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut holder = LockFileService::new(dir.path());
            holder.acquire_lock().unwrap();
        }
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_stop_waits_for_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = LockFileService::new(dir.path());
        std::fs::write(service.pid_file(), b"42").unwrap();
        assert!(service.is_running());

        let pid_file = service.pid_file();
        let server = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            std::fs::remove_file(pid_file).unwrap();
        });

        service.stop(Duration::from_secs(5)).unwrap();
        server.join().unwrap();
        assert!(!service.is_running());
        assert!(service.shutdown_request_file().exists());

        service.start().unwrap();
        assert!(!service.shutdown_request_file().exists());
    }

    #[test]
    fn test_stop_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = LockFileService::new(dir.path());
        std::fs::write(service.pid_file(), b"42").unwrap();

        let err = service.stop(Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, PimError::Timeout(_)));
    }
}
