//! Backtrack - call-stack backtraces of the running process
//!
//! Captures human-readable backtraces of the main thread, the calling
//! thread, or every live thread, without stopping the process:
//!
//! - the calling thread is walked in place;
//! - any other thread is parked with a signal for just as long as it takes to
//!   copy its frame-pointer chain, then released;
//! - addresses are symbolized afterwards, against the images listed in
//!   `/proc/self/maps`.
//!
//! ```no_run
//! backtrack::init();
//! eprintln!("{}", backtrack::stack_backtrace_of_all_threads());
//! ```
//!
//! The three free functions never fail: a thread that cannot be captured is
//! omitted (all-threads mode) or reported as unavailable, and a corrupted
//! stack ends its thread's block with a truncation marker.

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("backtrack currently supports only Linux on x86_64 and aarch64");

pub mod config;
pub mod context;
pub mod error;
pub mod lines;
pub mod maps;
pub mod report;
pub mod snapshot;
pub mod suspend;
pub mod symbolizer;
pub mod thread;
pub mod walker;

use std::hint::black_box;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;

pub use config::CaptureConfig;
pub use context::RegisterContext;
pub use error::{CaptureError, Result};
pub use report::{BacktraceReport, Frame, ThreadBacktrace, ThreadRole, ThreadStatus};
pub use suspend::{SignalSuspender, Suspender};
pub use symbolizer::{SymbolInfo, SymbolResolver, Symbolize};
pub use thread::{ProcThreads, ThreadEnumerator, ThreadHandle};
pub use walker::{FrameWalker, Termination, Walk};

use context::current_context;
use lines::LineResolver;
use maps::MemoryMap;
use snapshot::Snapshotter;
use walker::ProcessStack;

/// Composes enumeration, snapshotting, walking and symbolization into
/// reports.
///
/// The type parameters are the host capabilities; [`Backtracer::new`] wires
/// up the Linux ones.
pub struct Backtracer<E = ProcThreads, S = SignalSuspender, R = SymbolResolver> {
    config: CaptureConfig,
    enumerator: E,
    snapshotter: Snapshotter<S>,
    resolver: R,
}

impl Backtracer {
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_parts(config, ProcThreads, SignalSuspender::new(), SymbolResolver::new())
    }
}

impl Default for Backtracer {
    fn default() -> Self {
        Self::new(CaptureConfig::default())
    }
}

impl<E, S, R> Backtracer<E, S, R>
where
    E: ThreadEnumerator,
    S: Suspender,
    R: Symbolize,
{
    pub fn with_parts(config: CaptureConfig, enumerator: E, suspender: S, resolver: R) -> Self {
        let snapshotter = Snapshotter::new(suspender, config.suspend_attempts, config.suspend_timeout);
        Backtracer { config, enumerator, snapshotter, resolver }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn suspender(&self) -> &S {
        self.snapshotter.suspender()
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    // The public capture entry points record their own frame pointer. An
    // in-place walk starts at that frame's caller, so the report opens with
    // the caller's code rather than ours. `black_box` keeps the inner call out
    // of tail position: the recorded frame must outlive the capture.

    #[inline(never)]
    pub fn capture_main_thread(&self) -> BacktraceReport {
        let entry_frame = current_context!().fp;
        black_box(self.capture_single(thread::main_thread(), ThreadRole::Main, entry_frame))
    }

    #[inline(never)]
    pub fn capture_current_thread(&self) -> BacktraceReport {
        let entry_frame = current_context!().fp;
        black_box(self.capture_single(&thread::current_thread(), ThreadRole::Current, entry_frame))
    }

    /// Capture every thread the enumerator lists, one at a time, in listing
    /// order. Threads that vanish before they can be captured are omitted.
    #[inline(never)]
    pub fn capture_all_threads(&self) -> BacktraceReport {
        let entry_frame = current_context!().fp;
        black_box(self.capture_all(entry_frame))
    }

    fn capture_all(&self, entry_frame: u64) -> BacktraceReport {
        let threads = match self.enumerator.list_threads() {
            Ok(threads) => threads,
            Err(err) => {
                tracing::warn!(%err, "falling back to the current thread");
                let mut report = self.capture_single(&thread::current_thread(), ThreadRole::Current, entry_frame);
                report.enumeration_failed = true;
                return report;
            }
        };

        let walker = stack_walker();
        let mut lines = self.line_resolver();
        let main_tid = thread::main_thread().tid;
        let current_tid = thread::current_tid();

        let mut entries = Vec::with_capacity(threads.len());
        for (ordinal, handle) in threads.iter().enumerate() {
            let role = if handle.tid == main_tid {
                ThreadRole::Main
            } else if handle.tid == current_tid {
                ThreadRole::Current
            } else {
                ThreadRole::Other(ordinal)
            };
            match self.capture_thread(handle, role, entry_frame, &walker, &mut lines) {
                Ok(entry) => entries.push(entry),
                Err(err) => tracing::debug!(tid = handle.tid, %err, "omitting thread from report"),
            }
        }
        tracing::debug!(listed = threads.len(), captured = entries.len(), "captured all threads");
        self.finish(entries)
    }

    fn capture_single(&self, handle: &ThreadHandle, role: ThreadRole, entry_frame: u64) -> BacktraceReport {
        let walker = stack_walker();
        let mut lines = self.line_resolver();
        let entry = match self.capture_thread(handle, role, entry_frame, &walker, &mut lines) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(tid = handle.tid, %err, "thread unavailable");
                ThreadBacktrace::unavailable(handle.clone(), role, err.to_string())
            }
        };
        self.finish(vec![entry])
    }

    /// Snapshot and walk one thread, then symbolize its frames.
    ///
    /// The frame buffer is reserved before the snapshot: for another thread
    /// the walk runs while that thread is stopped and must not allocate.
    /// For the calling thread the walk starts at the caller of `entry_frame`.
    fn capture_thread(
        &self,
        handle: &ThreadHandle,
        role: ThreadRole,
        entry_frame: u64,
        walker: &FrameWalker<ProcessStack>,
        lines: &mut Option<LineResolver>,
    ) -> Result<ThreadBacktrace> {
        let max_depth = self.config.max_depth;
        let in_place = handle.is_current();
        let mut addresses = Vec::with_capacity(max_depth);
        let snapshot = self.snapshotter.with_snapshot(handle, |ctx| {
            let (start, from_caller) = match in_place.then(|| walker.caller_context(entry_frame)).flatten() {
                Some(caller) => (caller, true),
                None => (*ctx, false),
            };
            let termination = walker.walk_into(&start, max_depth, &mut addresses);
            (start, from_caller, termination)
        })?;
        let (registers, from_caller, mut termination) = snapshot.value;

        if let Some(paused_for) = snapshot.paused_for {
            tracing::debug!(tid = handle.tid, ?paused_for, frames = addresses.len(), "thread resumed");
        }

        let frames = self.symbolicate(&addresses, from_caller, lines);
        if matches!(termination, Termination::InvalidFrame { .. }) && reaches_runtime_entry(&frames) {
            termination = Termination::Complete;
        }
        if let Some(err) = termination.error() {
            tracing::debug!(tid = handle.tid, %err, "walk truncated");
        }

        Ok(ThreadBacktrace {
            thread: handle.clone(),
            role,
            registers: self.config.include_registers.then_some(registers),
            frames,
            status: ThreadStatus::Walked(termination),
        })
    }

    /// Resolve each address. All but the first are return addresses, and so
    /// is the first when the walk started from a caller's saved record.
    fn symbolicate(&self, addresses: &[u64], first_is_return: bool, lines: &mut Option<LineResolver>) -> Vec<Frame> {
        addresses
            .iter()
            .enumerate()
            .map(|(index, &address)| {
                if !self.config.symbolicate {
                    return Frame::unresolved(address);
                }
                // Return addresses point past the call; look up the call itself.
                let lookup = if index == 0 && !first_is_return { address } else { address.saturating_sub(1) };
                let symbol = self.resolver.resolve(lookup).map(|mut info| {
                    info.offset += address - lookup;
                    info
                });
                let location = match (lines.as_mut(), symbol.as_ref()) {
                    (Some(lines), Some(info)) => lines.locate(info),
                    _ => None,
                };
                Frame { address, symbol, location }
            })
            .collect()
    }

    fn line_resolver(&self) -> Option<LineResolver> {
        (self.config.symbolicate && self.config.source_locations).then(LineResolver::new)
    }

    fn finish(&self, threads: Vec<ThreadBacktrace>) -> BacktraceReport {
        let images = if self.config.include_images { self.resolver.images() } else { Vec::new() };
        BacktraceReport { threads, enumeration_failed: false, images }
    }
}

/// C runtime routines that start the process or a thread. They are built
/// without frame pointers, so whatever the chain links to above them is not
/// a frame record.
const RUNTIME_ENTRY_SYMBOLS: &[&str] = &[
    "__libc_start_call_main",
    "__libc_start_main_impl",
    "__libc_start_main",
    "_start",
    "start_thread",
    "thread_start",
    "clone3",
    "clone",
];

fn symbol_name(frame: &Frame) -> Option<&str> {
    frame.symbol.as_ref()?.name.as_deref()
}

/// Whether a walk got as far as the C runtime: its last frame is a runtime
/// entry routine, or the one before it is the program's `main`.
fn reaches_runtime_entry(frames: &[Frame]) -> bool {
    let in_entry = frames
        .last()
        .and_then(symbol_name)
        .is_some_and(|name| RUNTIME_ENTRY_SYMBOLS.contains(&name));
    let above_main = frames.len() >= 2 && symbol_name(&frames[frames.len() - 2]) == Some("main");
    in_entry || above_main
}

/// A walker over this process's memory, bounded by the mappings as they are
/// now. Taken before any thread is stopped.
fn stack_walker() -> FrameWalker<ProcessStack> {
    let map = MemoryMap::load_self().unwrap_or_else(|err| {
        tracing::warn!(%err, "memory map unavailable, walks will stop at the first frame");
        MemoryMap::default()
    });
    FrameWalker::new(ProcessStack::new(map))
}

static DEFAULT_BACKTRACER: OnceLock<Backtracer> = OnceLock::new();

/// Record the main thread and install the suspension handler.
///
/// Call once early from `main`; the capture functions call it lazily
/// otherwise.
pub fn init() {
    let main = thread::main_thread();
    tracing::debug!(tid = main.tid, name = %main.name, "recorded main thread");
    // Failures are logged by the installer; captures then omit other threads.
    let _ = suspend::install_handler();
}

fn default_backtracer() -> &'static Backtracer {
    DEFAULT_BACKTRACER.get_or_init(|| {
        init();
        Backtracer::new(CaptureConfig::from_env())
    })
}

fn render(capture: impl FnOnce(&Backtracer) -> BacktraceReport) -> String {
    catch_unwind(AssertUnwindSafe(|| capture(default_backtracer()).to_string()))
        .unwrap_or_else(|_| "-- backtrace capture failed\n".to_string())
}

/// Backtrace of the process's main thread.
#[inline(never)]
pub fn stack_backtrace_of_main_thread() -> String {
    let entry_frame = current_context!().fp;
    black_box(render(|bt| bt.capture_single(thread::main_thread(), ThreadRole::Main, entry_frame)))
}

/// Backtrace of the calling thread. Never suspends anything.
#[inline(never)]
pub fn stack_backtrace_of_current_thread() -> String {
    let entry_frame = current_context!().fp;
    black_box(render(|bt| bt.capture_single(&thread::current_thread(), ThreadRole::Current, entry_frame)))
}

/// Backtraces of every live thread, in `/proc/self/task` order.
#[inline(never)]
pub fn stack_backtrace_of_all_threads() -> String {
    let entry_frame = current_context!().fp;
    black_box(render(|bt| bt.capture_all(entry_frame)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: Option<&str>) -> Frame {
        Frame {
            address: 0x1000,
            symbol: Some(SymbolInfo {
                module: "libc.so.6".to_string(),
                path: "/usr/lib/libc.so.6".to_string(),
                name: name.map(str::to_string),
                offset: 0,
                file_address: 0x1000,
            }),
            location: None,
        }
    }

    #[test]
    fn test_runtime_entry_by_last_symbol() {
        assert!(reaches_runtime_entry(&[frame(Some("app::run")), frame(Some("__libc_start_call_main"))]));
        assert!(reaches_runtime_entry(&[frame(Some("start_thread"))]));
        assert!(!reaches_runtime_entry(&[frame(Some("app::run")), frame(Some("app::start"))]));
        assert!(!reaches_runtime_entry(&[]));
    }

    #[test]
    fn test_runtime_entry_above_main() {
        // Stripped libc: the caller of `main` has no name of its own.
        assert!(reaches_runtime_entry(&[frame(Some("main")), frame(None)]));
        assert!(!reaches_runtime_entry(&[frame(Some("app::main")), frame(None)]));
        assert!(!reaches_runtime_entry(&[frame(None), Frame::unresolved(0x10)]));
    }
}
