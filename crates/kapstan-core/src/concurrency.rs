use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// File name of the advisory lock inside the state directory.
pub const LOCK_FILE_NAME: &str = "kapstan.lock";

/// Exclusive lock on the state directory, so two kapstan processes never
/// orchestrate the same guest. The holder's PID is written into the lock
/// file for diagnostics; the lock itself is the flock, not the contents.
pub struct StateLock {
    lock_file: File,
}

impl StateLock {
    /// Takes the lock for `state_dir`, blocking until any current holder
    /// releases it.
    pub fn acquire(state_dir: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(state_dir)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self::stamped(file))
    }

    /// Non-blocking variant. Returns `None` when another kapstan process
    /// holds the lock.
    pub fn try_acquire(state_dir: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(state_dir)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self::stamped(file))),
            Err(_) => Ok(None),
        }
    }

    fn stamped(mut file: File) -> Self {
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        Self { lock_file: file }
    }
}

fn open_lock_file(state_dir: &Path) -> Result<File, CoreError> {
    std::fs::create_dir_all(state_dir)?;
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(state_dir.join(LOCK_FILE_NAME))?)
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks the current operation to finish; the second one exits.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, finishing current operation...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_creates_state_dir_and_stamps_pid() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        let _lock = StateLock::acquire(&state_dir).unwrap();
        let stamped = std::fs::read_to_string(state_dir.join(LOCK_FILE_NAME)).unwrap();
        assert_eq!(stamped.trim(), std::process::id().to_string());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();

        let _lock = StateLock::acquire(dir.path()).unwrap();
        let second = StateLock::try_acquire(dir.path()).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();

        {
            let _lock = StateLock::acquire(dir.path()).unwrap();
        }

        let second = StateLock::try_acquire(dir.path()).unwrap();
        assert!(second.is_some());
    }
}
