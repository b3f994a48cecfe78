//! Thread identity and enumeration.

use std::fs;
use std::sync::OnceLock;

use nix::unistd::{getpid, gettid};

use crate::error::{CaptureError, Result};

/// A schedulable thread of this process, identified by its kernel tid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    pub tid: i32,
    pub name: String,
}

impl ThreadHandle {
    pub fn new(tid: i32, name: impl Into<String>) -> Self {
        ThreadHandle { tid, name: name.into() }
    }

    /// Handle for a tid, with the name looked up from procfs.
    pub fn from_tid(tid: i32) -> Self {
        ThreadHandle::new(tid, thread_name(tid))
    }

    pub fn is_current(&self) -> bool {
        self.tid == current_tid()
    }
}

pub fn current_tid() -> i32 {
    gettid().as_raw()
}

/// The calling thread.
pub fn current_thread() -> ThreadHandle {
    ThreadHandle::from_tid(current_tid())
}

static MAIN_THREAD: OnceLock<ThreadHandle> = OnceLock::new();

/// The main thread, resolved once and read-only afterwards.
///
/// On Linux the initial thread's tid equals the pid, so this is correct no
/// matter which thread first asks.
pub fn main_thread() -> &'static ThreadHandle {
    MAIN_THREAD.get_or_init(|| ThreadHandle::from_tid(getpid().as_raw()))
}

fn thread_name(tid: i32) -> String {
    let comm_path = format!("/proc/self/task/{tid}/comm");
    match fs::read_to_string(&comm_path) {
        Ok(name) => name.trim().to_string(),
        Err(_) => "<unknown>".to_string(),
    }
}

/// Lists the live threads of this process.
///
/// The listing is a best-effort snapshot: a thread may exit right after it
/// was reported, so every consumer must tolerate stale handles.
pub trait ThreadEnumerator {
    fn list_threads(&self) -> Result<Vec<ThreadHandle>>;
}

/// Enumerates threads through `/proc/self/task`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcThreads;

impl ThreadEnumerator for ProcThreads {
    fn list_threads(&self) -> Result<Vec<ThreadHandle>> {
        let entries = fs::read_dir("/proc/self/task")
            .map_err(|e| CaptureError::EnumerationUnavailable(e.to_string()))?;

        let mut thread_ids = Vec::new();
        for entry in entries.flatten() {
            if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
                thread_ids.push(tid);
            }
        }
        if thread_ids.is_empty() {
            return Err(CaptureError::EnumerationUnavailable(
                "no entries under /proc/self/task".to_string(),
            ));
        }

        thread_ids.sort_unstable();
        Ok(thread_ids.into_iter().map(ThreadHandle::from_tid).collect())
    }
}
