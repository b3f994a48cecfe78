//! Cross-thread suspension.
//!
//! Linux has no `thread_suspend`, so a thread is paused by signalling it: the
//! handler runs on the target, copies its interrupted registers into a static
//! mailbox, and parks until the requester says resume. Returning from the
//! handler is the resume.
//!
//! Mailbox protocol (one request in flight process-wide, guarded by the
//! claim flag; the `request` word packs the target tid with a state so every
//! transition is a single compare-and-swap):
//!
//! ```text
//!   requester                          handler (on target)
//!   IDLE -> REQUESTED, tgkill
//!                                      REQUESTED -> CAPTURING
//!                                      write registers
//!                                      CAPTURING -> SUSPENDED, park
//!   read registers, walk
//!   SUSPENDED -> RESUME
//!                                      RESUME -> RESUMED, return
//!   RESUMED -> IDLE, release claim
//! ```
//!
//! A request nobody answered is withdrawn with `REQUESTED -> IDLE`; a parked
//! handler gives up after [`MAX_SUSPENSION`] with `SUSPENDED -> RESUMED`.
//! The handler only touches atomics and async-signal-safe syscalls.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use libc::{c_int, c_void};
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::time::{ClockId, clock_gettime};
use nix::unistd::{getpid, gettid};

use crate::context::RegisterContext;
use crate::error::{CaptureError, Result};
use crate::thread::ThreadHandle;

/// Signal used to park a target thread. Its default action is to ignore, so
/// a late delivery after a withdrawn request is harmless.
pub const SUSPEND_SIGNAL: Signal = Signal::SIGURG;

/// Longest a thread stays parked if its requester never resumes it.
pub const MAX_SUSPENSION: Duration = Duration::from_secs(1);

/// Host capability to stop another thread of this process and read its
/// registers.
pub trait Suspender {
    /// Stop `thread` and return its registers. On `Ok` the thread stays
    /// stopped until [`Suspender::resume`] is called for it.
    fn suspend(&self, thread: &ThreadHandle, timeout: Duration) -> Result<RegisterContext>;

    /// Let a thread stopped by [`Suspender::suspend`] run again.
    fn resume(&self, thread: &ThreadHandle);
}

const IDLE: u64 = 0;
const REQUESTED: u64 = 1;
const CAPTURING: u64 = 2;
const SUSPENDED: u64 = 3;
const RESUME: u64 = 4;
const RESUMED: u64 = 5;

const fn pack(tid: i32, state: u64) -> u64 {
    ((tid as u32 as u64) << 8) | state
}

struct Mailbox {
    claimed: AtomicBool,
    request: AtomicU64,
    pc: AtomicU64,
    sp: AtomicU64,
    fp: AtomicU64,
    lr: AtomicU64,
    has_lr: AtomicBool,
}

impl Mailbox {
    const fn new() -> Self {
        Mailbox {
            claimed: AtomicBool::new(false),
            request: AtomicU64::new(IDLE),
            pc: AtomicU64::new(0),
            sp: AtomicU64::new(0),
            fp: AtomicU64::new(0),
            lr: AtomicU64::new(0),
            has_lr: AtomicBool::new(false),
        }
    }

    fn claim(&self) {
        while self
            .claimed
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
    }

    fn release(&self) {
        self.request.store(IDLE, Ordering::Release);
        self.claimed.store(false, Ordering::Release);
    }

    fn store_context(&self, ctx: &RegisterContext) {
        self.pc.store(ctx.pc, Ordering::Relaxed);
        self.sp.store(ctx.sp, Ordering::Relaxed);
        self.fp.store(ctx.fp, Ordering::Relaxed);
        self.lr.store(ctx.lr.unwrap_or(0), Ordering::Relaxed);
        self.has_lr.store(ctx.lr.is_some(), Ordering::Relaxed);
    }

    fn load_context(&self) -> RegisterContext {
        let lr = self.has_lr.load(Ordering::Relaxed).then(|| self.lr.load(Ordering::Relaxed));
        RegisterContext::new(
            self.pc.load(Ordering::Relaxed),
            self.sp.load(Ordering::Relaxed),
            self.fp.load(Ordering::Relaxed),
            lr,
        )
    }
}

static MAILBOX: Mailbox = Mailbox::new();
static PREVIOUS_ACTION: OnceLock<SigAction> = OnceLock::new();
static INSTALLED: OnceLock<std::result::Result<(), Errno>> = OnceLock::new();

fn monotonic_nanos() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64).saturating_mul(1_000_000_000) + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

extern "C" fn handle_suspend_signal(signum: c_int, info: *mut libc::siginfo_t, uc: *mut c_void) {
    let saved_errno = Errno::last_raw();
    let me = gettid().as_raw();

    if uc.is_null()
        || MAILBOX
            .request
            .compare_exchange(pack(me, REQUESTED), pack(me, CAPTURING), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    {
        forward_to_previous(signum, info, uc);
        Errno::set_raw(saved_errno);
        return;
    }

    // SAFETY: non-null ucontext handed to this SA_SIGINFO handler.
    let ctx = unsafe { RegisterContext::from_ucontext(uc as *const libc::ucontext_t) };
    MAILBOX.store_context(&ctx);
    MAILBOX.request.store(pack(me, SUSPENDED), Ordering::Release);

    let parked_at = monotonic_nanos();
    let limit = MAX_SUSPENSION.as_nanos() as u64;
    loop {
        if MAILBOX.request.load(Ordering::Acquire) == pack(me, RESUME) {
            MAILBOX.request.store(pack(me, RESUMED), Ordering::Release);
            break;
        }
        if monotonic_nanos().saturating_sub(parked_at) > limit
            && MAILBOX
                .request
                .compare_exchange(pack(me, SUSPENDED), pack(me, RESUMED), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            break;
        }
        std::hint::spin_loop();
        // SAFETY: plain syscall, async-signal-safe.
        unsafe { libc::sched_yield() };
    }

    Errno::set_raw(saved_errno);
}

fn forward_to_previous(signum: c_int, info: *mut libc::siginfo_t, uc: *mut c_void) {
    let Some(previous) = PREVIOUS_ACTION.get() else {
        return;
    };
    match previous.handler() {
        SigHandler::SigAction(handler) => handler(signum, info, uc),
        SigHandler::Handler(handler) => handler(signum),
        SigHandler::SigDfl | SigHandler::SigIgn => {}
    }
}

/// Install the suspension handler once per process.
pub fn install_handler() -> Result<()> {
    let outcome = INSTALLED.get_or_init(|| {
        let action = SigAction::new(
            SigHandler::SigAction(handle_suspend_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART | SaFlags::SA_ONSTACK,
            SigSet::empty(),
        );
        // SAFETY: the handler is async-signal-safe (atomics and syscalls only).
        match unsafe { sigaction(SUSPEND_SIGNAL, &action) } {
            Ok(previous) => {
                let _ = PREVIOUS_ACTION.set(previous);
                tracing::debug!(signal = ?SUSPEND_SIGNAL, "installed thread suspension handler");
                Ok(())
            }
            Err(errno) => {
                tracing::warn!(signal = ?SUSPEND_SIGNAL, %errno, "failed to install thread suspension handler");
                Err(errno)
            }
        }
    });
    (*outcome).map_err(|errno| CaptureError::SuspendFailed {
        tid: 0,
        reason: format!("signal handler unavailable: {errno}"),
    })
}

fn tgkill(tid: i32, signal: Signal) -> std::result::Result<(), Errno> {
    // SAFETY: raw syscall with plain integer arguments.
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, getpid().as_raw(), tid, signal as c_int) };
    Errno::result(ret).map(drop)
}

/// Suspends threads by signalling them; see the module docs for the
/// handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalSuspender;

impl SignalSuspender {
    pub fn new() -> Self {
        SignalSuspender
    }
}

impl Suspender for SignalSuspender {
    fn suspend(&self, thread: &ThreadHandle, timeout: Duration) -> Result<RegisterContext> {
        let tid = thread.tid;
        if thread.is_current() {
            return Err(CaptureError::SuspendFailed {
                tid,
                reason: "cannot suspend the calling thread".to_string(),
            });
        }
        install_handler()?;

        MAILBOX.claim();
        MAILBOX.request.store(pack(tid, REQUESTED), Ordering::Release);

        if let Err(errno) = tgkill(tid, SUSPEND_SIGNAL) {
            MAILBOX.release();
            return Err(match errno {
                Errno::ESRCH => CaptureError::ThreadGone { tid },
                other => CaptureError::SuspendFailed { tid, reason: other.to_string() },
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            let current = MAILBOX.request.load(Ordering::Acquire);
            if current == pack(tid, SUSPENDED) {
                // The claim stays held until resume.
                return Ok(MAILBOX.load_context());
            }
            if current == pack(tid, RESUMED) {
                MAILBOX.release();
                return Err(CaptureError::SuspendFailed {
                    tid,
                    reason: "thread resumed itself before the capture finished".to_string(),
                });
            }
            if current == pack(tid, REQUESTED)
                && Instant::now() >= deadline
                && MAILBOX
                    .request
                    .compare_exchange(current, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                MAILBOX.release();
                return Err(CaptureError::SuspendFailed {
                    tid,
                    reason: format!("no acknowledgement within {timeout:?}"),
                });
            }
            std::thread::yield_now();
        }
    }

    fn resume(&self, thread: &ThreadHandle) {
        let tid = thread.tid;
        if MAILBOX
            .request
            .compare_exchange(pack(tid, SUSPENDED), pack(tid, RESUME), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            while MAILBOX.request.load(Ordering::Acquire) != pack(tid, RESUMED) {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
        MAILBOX.release();
    }
}
