//! Obtaining a stable register context for a thread.

use std::time::{Duration, Instant};

use crate::context::{RegisterContext, current_context};
use crate::error::{CaptureError, Result};
use crate::suspend::Suspender;
use crate::thread::ThreadHandle;

/// Hands out register contexts that stay valid for the duration of a
/// closure.
///
/// For the calling thread the registers are read in place and the closure
/// runs in a frame below the captured one, so the captured frames cannot be
/// overwritten. For any other thread the target is suspended first and
/// resumed when the closure returns or unwinds.
pub struct Snapshotter<S> {
    suspender: S,
    attempts: u32,
    timeout: Duration,
}

/// Resumes a suspended thread on drop, so every exit path resumes exactly once.
struct ResumeGuard<'a, S: Suspender> {
    suspender: &'a S,
    thread: &'a ThreadHandle,
}

impl<S: Suspender> Drop for ResumeGuard<'_, S> {
    fn drop(&mut self) {
        self.suspender.resume(self.thread);
    }
}

/// What a snapshot closure produced, plus how long the target was paused.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: T,
    pub paused_for: Option<Duration>,
}

impl<S: Suspender> Snapshotter<S> {
    pub fn new(suspender: S, attempts: u32, timeout: Duration) -> Self {
        Snapshotter { suspender, attempts: attempts.max(1), timeout }
    }

    pub fn suspender(&self) -> &S {
        &self.suspender
    }

    /// Run `f` against `thread`'s registers.
    ///
    /// While `f` runs on behalf of another thread, that thread is stopped:
    /// `f` must not allocate, lock, or log.
    #[inline(never)]
    pub fn with_snapshot<T, F>(&self, thread: &ThreadHandle, f: F) -> Result<Snapshot<T>>
    where
        F: FnOnce(&RegisterContext) -> T,
    {
        if thread.is_current() {
            let ctx = current_context!();
            let value = f(&ctx);
            return Ok(Snapshot { value, paused_for: None });
        }

        let ctx = self.suspend_with_retries(thread)?;
        let paused_at = Instant::now();
        let value = {
            let _resume = ResumeGuard { suspender: &self.suspender, thread };
            f(&ctx)
        };
        Ok(Snapshot { value, paused_for: Some(paused_at.elapsed()) })
    }

    fn suspend_with_retries(&self, thread: &ThreadHandle) -> Result<RegisterContext> {
        let tid = thread.tid;
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.suspender.suspend(thread, self.timeout) {
                Ok(ctx) => return Ok(ctx),
                Err(CaptureError::ThreadGone { tid }) => return Err(CaptureError::ThreadGone { tid }),
                Err(err) => {
                    tracing::debug!(tid, attempt, %err, "suspension attempt failed");
                    last_error = Some(err);
                }
            }
        }
        tracing::warn!(
            tid,
            attempts = self.attempts,
            error = ?last_error,
            "could not suspend thread, treating it as gone"
        );
        Err(CaptureError::ThreadGone { tid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[derive(Default)]
    struct ScriptedSuspender {
        script: RefCell<VecDeque<Result<RegisterContext>>>,
        suspends: Cell<usize>,
        resumes: Cell<usize>,
    }

    impl ScriptedSuspender {
        fn with_script(script: Vec<Result<RegisterContext>>) -> Self {
            ScriptedSuspender { script: RefCell::new(script.into()), ..Default::default() }
        }
    }

    impl Suspender for ScriptedSuspender {
        fn suspend(&self, thread: &ThreadHandle, _timeout: Duration) -> Result<RegisterContext> {
            self.suspends.set(self.suspends.get() + 1);
            self.script
                .borrow_mut()
                .pop_front()
                .unwrap_or(Err(CaptureError::ThreadGone { tid: thread.tid }))
        }

        fn resume(&self, _thread: &ThreadHandle) {
            self.resumes.set(self.resumes.get() + 1);
        }
    }

    fn transient(tid: i32) -> Result<RegisterContext> {
        Err(CaptureError::SuspendFailed { tid, reason: "busy".to_string() })
    }

    fn other_thread() -> ThreadHandle {
        ThreadHandle::new(i32::MAX - 1, "other")
    }

    const CTX: RegisterContext = RegisterContext::new(0x1000, 0x2000, 0, None);

    #[test]
    fn test_current_thread_never_suspends() {
        let snapshotter = Snapshotter::new(ScriptedSuspender::default(), 3, Duration::from_millis(1));
        let me = crate::thread::current_thread();
        let snapshot = snapshotter.with_snapshot(&me, |ctx| ctx.fp).unwrap();
        assert_ne!(snapshot.value, 0);
        assert!(snapshot.paused_for.is_none());
        assert_eq!(snapshotter.suspender().suspends.get(), 0);
        assert_eq!(snapshotter.suspender().resumes.get(), 0);
    }

    #[test]
    fn test_retries_then_succeeds() {
        let tid = other_thread().tid;
        let suspender = ScriptedSuspender::with_script(vec![transient(tid), transient(tid), Ok(CTX)]);
        let snapshotter = Snapshotter::new(suspender, 3, Duration::from_millis(1));
        let snapshot = snapshotter.with_snapshot(&other_thread(), |ctx| *ctx).unwrap();
        assert_eq!(snapshot.value, CTX);
        assert!(snapshot.paused_for.is_some());
        assert_eq!(snapshotter.suspender().suspends.get(), 3);
        assert_eq!(snapshotter.suspender().resumes.get(), 1);
    }

    #[test]
    fn test_exhausted_retries_become_thread_gone() {
        let tid = other_thread().tid;
        let suspender = ScriptedSuspender::with_script(vec![transient(tid), transient(tid), transient(tid), Ok(CTX)]);
        let snapshotter = Snapshotter::new(suspender, 3, Duration::from_millis(1));
        let err = snapshotter.with_snapshot(&other_thread(), |_| ()).unwrap_err();
        assert_eq!(err, CaptureError::ThreadGone { tid });
        assert_eq!(snapshotter.suspender().suspends.get(), 3);
        assert_eq!(snapshotter.suspender().resumes.get(), 0);
    }

    #[test]
    fn test_thread_gone_is_not_retried() {
        let tid = other_thread().tid;
        let suspender = ScriptedSuspender::with_script(vec![Err(CaptureError::ThreadGone { tid }), Ok(CTX)]);
        let snapshotter = Snapshotter::new(suspender, 3, Duration::from_millis(1));
        let err = snapshotter.with_snapshot(&other_thread(), |_| ()).unwrap_err();
        assert_eq!(err, CaptureError::ThreadGone { tid });
        assert_eq!(snapshotter.suspender().suspends.get(), 1);
    }

    #[test]
    fn test_resume_runs_when_closure_panics() {
        let snapshotter = Snapshotter::new(ScriptedSuspender::with_script(vec![Ok(CTX)]), 1, Duration::from_millis(1));
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            snapshotter.with_snapshot(&other_thread(), |_| -> u64 { panic!("walk blew up") }).ok();
        }));
        assert!(outcome.is_err());
        assert_eq!(snapshotter.suspender().resumes.get(), 1);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let snapshotter = Snapshotter::new(ScriptedSuspender::with_script(vec![Ok(CTX)]), 0, Duration::from_millis(1));
        assert!(snapshotter.with_snapshot(&other_thread(), |_| ()).is_ok());
        assert_eq!(snapshotter.suspender().suspends.get(), 1);
    }
}
