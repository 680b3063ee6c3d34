//! Single-instance process lock.
//!
//! A lockfile holds the pid of the running server and the time of its last
//! heartbeat. A second instance refuses to start while the recorded process
//! is alive and heartbeating; a live process with a stale heartbeat is
//! assumed wedged and is terminated before the new instance proceeds.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Heartbeats older than this mark the holder as stale.
const HEARTBEAT_WINDOW: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL when taking over a stale pid.
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct LockState {
    pid: u32,
    #[serde(rename = "signaledAt")]
    signaled_at: u64,
}

/// The single-instance lockfile.
///
/// `is_locked` is checked once before startup; `lock` is written right
/// after; `signal` refreshes the heartbeat from a periodic server timer.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The lockfile location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records the current pid and heartbeat time. Called once at startup,
    /// after [`is_locked`](Self::is_locked) reported the lock free.
    pub fn lock(&self) -> std::io::Result<()> {
        self.write_state()
    }

    /// Refreshes the heartbeat time.
    pub fn signal(&self) -> std::io::Result<()> {
        self.write_state()
    }

    /// Removes the lockfile. Missing files are fine.
    pub fn release(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    fn write_state(&self) -> std::io::Result<()> {
        let state = LockState {
            pid: std::process::id(),
            signaled_at: unix_now(),
        };
        let json = serde_json::to_string(&state)?;
        std::fs::write(&self.path, json)
    }

    /// Returns `true` when another live process holds the lock.
    ///
    /// A recorded pid that is alive with a fresh heartbeat holds the lock. A
    /// live pid with a stale heartbeat is sent SIGTERM, given a grace
    /// period, then SIGKILL, after which the lock counts as free.
    #[cfg(unix)]
    pub fn is_locked(&self) -> bool {
        let Some(state) = self.read_state() else {
            return false;
        };
        if state.pid == std::process::id() || !pid_alive(state.pid) {
            return false;
        }

        let age = unix_now().saturating_sub(state.signaled_at);
        if age < HEARTBEAT_WINDOW.as_secs() {
            return true;
        }

        tracing::warn!(pid = state.pid, age, "stale lock holder, terminating it");
        unsafe {
            libc::kill(state.pid as libc::pid_t, libc::SIGTERM);
        }
        std::thread::sleep(TERM_GRACE);
        if pid_alive(state.pid) {
            unsafe {
                libc::kill(state.pid as libc::pid_t, libc::SIGKILL);
            }
        }
        false
    }

    /// Without process signalling there is no reliable liveness probe, so
    /// the lock never reports held.
    #[cfg(not(unix))]
    pub fn is_locked(&self) -> bool {
        false
    }

    fn read_state(&self) -> Option<LockState> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signal 0 probes for existence without delivering anything.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lock(name: &str) -> LockFile {
        let path = std::env::temp_dir().join(format!("crest-lock-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        LockFile::new(path)
    }

    #[test]
    fn test_missing_file_is_unlocked() {
        let lock = temp_lock("missing");
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_own_pid_does_not_lock_out() {
        // The holder being this very process happens on restart-in-place;
        // it must not deadlock startup.
        let lock = temp_lock("own-pid");
        lock.lock().unwrap();
        assert!(!lock.is_locked());
        lock.release();
    }

    #[test]
    fn test_dead_pid_is_unlocked() {
        let lock = temp_lock("dead-pid");
        let state = LockState {
            // pids wrap far below this on every mainstream unix
            pid: 4_000_000,
            signaled_at: unix_now(),
        };
        std::fs::write(lock.path(), serde_json::to_string(&state).unwrap()).unwrap();
        assert!(!lock.is_locked());
        lock.release();
    }

    #[test]
    fn test_garbage_file_is_unlocked() {
        let lock = temp_lock("garbage");
        std::fs::write(lock.path(), b"not json").unwrap();
        assert!(!lock.is_locked());
        lock.release();
    }

    #[test]
    fn test_state_round_trip() {
        let lock = temp_lock("round-trip");
        lock.lock().unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        let state: LockState = serde_json::from_str(&content).unwrap();
        assert_eq!(state.pid, std::process::id());
        assert!(state.signaled_at > 0);
        assert!(content.contains("signaledAt"));
        lock.release();
    }
}
