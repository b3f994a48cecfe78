//! Captured backtraces and their text rendering.
//!
//! The text layout is stable within a build:
//!
//! ```text
//! Backtrace of thread 4242 [main] "backtrack":
//! 0   backtrack                       0x000055d5c0a1b2c3 backtrack::worker::spin + 21
//! 1   libc.so.6                       0x00007f1a2b3c4d5e
//! 2   ???                             0x0000000000401000
//!     -- truncated: invalid frame pointer 0x0000000000000013
//! ```
//!
//! Frames are innermost first and numbered from 0. Thread blocks are
//! separated by one blank line.
//!
//! A walk that reaches the C runtime's process or thread entry ends without
//! a marker, even though the runtime leaves no valid frame record there.
//! In-place captures start at the caller of the capture entry point, so
//! frame 0 is a return address there too.

use std::fmt;

use crate::context::RegisterContext;
use crate::lines::SourceLocation;
use crate::symbolizer::{ImageSummary, SymbolInfo};
use crate::thread::ThreadHandle;
use crate::walker::Termination;

/// How a thread is labelled in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Main,
    Current,
    /// Position in enumeration order.
    Other(usize),
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadRole::Main => f.write_str("main"),
            ThreadRole::Current => f.write_str("current"),
            ThreadRole::Other(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Program counter for frame 0, return address for the others.
    pub address: u64,
    pub symbol: Option<SymbolInfo>,
    pub location: Option<SourceLocation>,
}

impl Frame {
    pub fn unresolved(address: u64) -> Self {
        Frame { address, symbol: None, location: None }
    }
}

/// How a thread's entry ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadStatus {
    Walked(Termination),
    /// No context could be captured at all.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadBacktrace {
    pub thread: ThreadHandle,
    pub role: ThreadRole,
    /// Present only when the capture was asked to include registers.
    pub registers: Option<RegisterContext>,
    pub frames: Vec<Frame>,
    pub status: ThreadStatus,
}

impl ThreadBacktrace {
    pub fn unavailable(thread: ThreadHandle, role: ThreadRole, reason: impl Into<String>) -> Self {
        ThreadBacktrace {
            thread,
            role,
            registers: None,
            frames: Vec::new(),
            status: ThreadStatus::Unavailable(reason.into()),
        }
    }

    pub fn is_truncated(&self) -> bool {
        match &self.status {
            ThreadStatus::Walked(termination) => termination.is_truncated(),
            ThreadStatus::Unavailable(_) => true,
        }
    }
}

/// The final artifact of one capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacktraceReport {
    pub threads: Vec<ThreadBacktrace>,
    /// All-threads capture fell back to the calling thread alone.
    pub enumeration_failed: bool,
    pub images: Vec<ImageSummary>,
}

/// Render a report with the stable layout described in the module docs.
pub fn format(report: &BacktraceReport) -> String {
    report.to_string()
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let module = self.symbol.as_ref().map_or("???", |s| s.module.as_str());
        write!(f, "{module:<31} 0x{:016x}", self.address)?;
        if let Some(SymbolInfo { name: Some(name), offset, .. }) = &self.symbol {
            write!(f, " {name} + {offset}")?;
        }
        if let Some(location) = &self.location {
            write!(f, " at {}:{}", location.file, location.line)?;
        }
        Ok(())
    }
}

impl fmt::Display for ThreadBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Backtrace of thread {} [{}] \"{}\":",
            self.thread.tid, self.role, self.thread.name
        )?;
        if let Some(registers) = &self.registers {
            writeln!(f, "    {registers}")?;
        }
        for (index, frame) in self.frames.iter().enumerate() {
            writeln!(f, "{index:<4}{frame}")?;
        }
        match &self.status {
            ThreadStatus::Walked(Termination::Complete) => Ok(()),
            ThreadStatus::Walked(Termination::DepthLimit(depth)) => {
                writeln!(f, "    -- truncated: depth limit {depth} reached")
            }
            ThreadStatus::Walked(Termination::InvalidFrame { fp }) => {
                writeln!(f, "    -- truncated: invalid frame pointer 0x{fp:016x}")
            }
            ThreadStatus::Walked(Termination::UnreadableMemory { addr }) => {
                writeln!(f, "    -- truncated: unreadable memory at 0x{addr:016x}")
            }
            ThreadStatus::Unavailable(reason) => writeln!(f, "    -- unavailable: {reason}"),
        }
    }
}

impl fmt::Display for BacktraceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.enumeration_failed {
            writeln!(f, "-- thread enumeration unavailable, showing current thread only")?;
            writeln!(f)?;
        }
        for (i, thread) in self.threads.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{thread}")?;
        }
        if !self.images.is_empty() {
            writeln!(f)?;
            writeln!(f, "Binary images:")?;
            for image in &self.images {
                writeln!(f, "0x{:016x}-0x{:016x} {} {}", image.start, image.end, image.name, image.path)?;
            }
        }
        Ok(())
    }
}
