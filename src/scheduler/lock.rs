// src/scheduler/lock.rs: the durable mutual-exclusion handle over queue
// transitions. An advisory flock on a file next to the queue directories,
// so a second process (or a restart racing a dying one) serializes too.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;

use crate::config::defs::PipelineError;

const POLL_JITTER_MS: u64 = 250;

/// Holding the guard is holding the lock; dropping the file handle
/// releases the flock.
pub struct QueueLockGuard {
    _lock_file: File,
}

pub struct QueueLock {
    path: PathBuf,
    poll: Duration,
    max_attempts: u64,
}

impl QueueLock {
    pub fn new(path: PathBuf, poll_ms: u64, max_attempts: u64) -> Self {
        QueueLock {
            path,
            poll: Duration::from_millis(poll_ms),
            max_attempts,
        }
    }

    /// Non-blocking acquisition attempt.
    ///
    /// # Returns
    /// Some(guard) when the lock was taken, None when another holder has it.
    pub fn try_acquire(&self) -> io::Result<Option<QueueLockGuard>> {
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        if try_flock_exclusive(&lock_file)? {
            Ok(Some(QueueLockGuard {
                _lock_file: lock_file,
            }))
        } else {
            Ok(None)
        }
    }

    /// Acquires the lock, polling with jitter up to the attempt cap.
    /// Exhausting the cap is fatal for the run: queue transitions must
    /// never proceed unguarded.
    pub async fn acquire(&self) -> Result<QueueLockGuard, PipelineError> {
        for attempt in 1..=self.max_attempts {
            match self.try_acquire() {
                Ok(Some(guard)) => {
                    if attempt > 1 {
                        debug!("Queue lock acquired after {} attempts", attempt);
                    }
                    return Ok(guard);
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(PipelineError::IOError(format!(
                        "Opening queue lock {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            }
            if attempt % 60 == 0 {
                warn!(
                    "Still waiting on queue lock {} ({} attempts)",
                    self.path.display(),
                    attempt
                );
            }
            let jitter = rand::random::<u64>() % (POLL_JITTER_MS + 1);
            sleep(self.poll + Duration::from_millis(jitter)).await;
        }
        Err(PipelineError::LockTimeout {
            attempts: self.max_attempts,
        })
    }
}

/// Non-blocking exclusive flock. Ok(false) when another process holds it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: flock on a valid fd owned by `file`; LOCK_NB keeps this
        // non-blocking.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}
