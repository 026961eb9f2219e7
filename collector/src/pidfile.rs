use ddc_config::ConfigError;
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};

/// Exclusive run lock backed by a file holding the owner's pid.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Takes the lock, replacing a stale one. A live owner is an error.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let own = std::process::id() as i32;
        if let Some(pid) = read_pid(&path) {
            if pid != own && is_alive(pid) {
                return Err(ConfigError::LockHeld { path, pid });
            }
            warn!(path = %path.display(), pid, "replacing stale pid file");
        }
        write_pid(&path, own)?;
        debug!(path = %path.display(), pid = own, "acquired pid lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "released pid lock"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(path = %self.path.display(), "failed to remove pid file: {e}"),
        }
    }
}

pub fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn write_pid(path: &Path, pid: i32) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
    }
    fs::write(path, pid.to_string()).map_err(|e| ConfigError::io(path, e))
}

/// `kill(pid, 0)`: the process exists if the call succeeds or is refused.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ddc.pid");
        // pid_max on Linux never reaches i32::MAX - 1.
        fs::write(&path, (i32::MAX - 1).to_string()).unwrap();
        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn live_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ddc.pid");
        // pid 1 always exists.
        fs::write(&path, "1").unwrap();
        let err = PidLock::acquire(&path).unwrap_err();
        assert!(matches!(err, ConfigError::LockHeld { pid: 1, .. }));
    }

    #[test]
    fn own_lock_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ddc.pid");
        let first = PidLock::acquire(&path).unwrap();
        let second = PidLock::acquire(&path).unwrap();
        assert_eq!(first.path(), second.path());
    }
}
