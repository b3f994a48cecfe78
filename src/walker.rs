//! Frame-pointer stack walking.
//!
//! Both supported architectures keep a two-word frame record at the frame
//! pointer:
//!
//! ```text
//!   [fp + 0]: caller's saved frame pointer
//!   [fp + 8]: return address into the caller
//! ```
//!
//! so one walker serves x86_64 (RBP) and aarch64 (X29). Every step is
//! validated against the stack range of the thread before anything is read,
//! and every read goes through a [`StackMemory`] that reports bad addresses
//! instead of faulting.

use std::io::IoSliceMut;
use std::ops::Range;

use nix::errno::Errno;
use nix::sys::uio::{RemoteIoVec, process_vm_readv};
use nix::unistd::Pid;

use crate::context::RegisterContext;
use crate::error::CaptureError;
use crate::maps::MemoryMap;

const WORD: u64 = 8;

/// Guarded access to the memory a walk reads.
pub trait StackMemory {
    /// Read one native-endian word, or `None` if `addr` is not readable.
    fn read_word(&self, addr: u64) -> Option<u64>;

    /// The range a stack whose current pointer is `sp` may occupy.
    fn stack_range(&self, sp: u64) -> Option<Range<u64>>;
}

/// Why a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Reached the end-of-stack sentinel (null frame pointer or null return
    /// address).
    Complete,
    /// Collected the maximum number of frames while more remained.
    DepthLimit(usize),
    /// The frame pointer was misaligned, left the stack, or failed to move
    /// towards the stack base.
    InvalidFrame { fp: u64 },
    /// A frame record inside the stack range could not be read.
    UnreadableMemory { addr: u64 },
}

impl Termination {
    pub fn is_truncated(&self) -> bool {
        !matches!(self, Termination::Complete)
    }

    /// The corruption this termination stands for, if any.
    pub fn error(&self) -> Option<CaptureError> {
        match *self {
            Termination::InvalidFrame { fp } => Some(CaptureError::InvalidFrame { fp }),
            Termination::UnreadableMemory { addr } => Some(CaptureError::InvalidFrame { fp: addr }),
            Termination::Complete | Termination::DepthLimit(_) => None,
        }
    }
}

/// Raw result of walking one thread: addresses innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Walk {
    pub addresses: Vec<u64>,
    pub termination: Termination,
}

pub struct FrameWalker<M> {
    memory: M,
}

impl<M: StackMemory> FrameWalker<M> {
    pub fn new(memory: M) -> Self {
        FrameWalker { memory }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn walk(&self, ctx: &RegisterContext, max_depth: usize) -> Walk {
        let mut addresses = Vec::with_capacity(max_depth);
        let termination = self.walk_into(ctx, max_depth, &mut addresses);
        Walk { addresses, termination }
    }

    /// Context of the caller of the frame whose record sits at `frame`.
    ///
    /// The caller's pc is the return address saved in that record, so a walk
    /// from the result starts with a return address rather than an exact pc.
    pub fn caller_context(&self, frame: u64) -> Option<RegisterContext> {
        let return_addr = self.memory.read_word(frame.checked_add(WORD)?)?;
        if return_addr == 0 {
            return None;
        }
        let caller_fp = self.memory.read_word(frame)?;
        Some(RegisterContext::new(return_addr, frame + 2 * WORD, caller_fp, None))
    }

    /// Walk into a caller-provided buffer without ever growing it.
    ///
    /// At most `min(max_depth, out.capacity())` addresses are written. This
    /// is the variant used while another thread is suspended: allocating
    /// there could block on a heap lock the suspended thread holds.
    pub fn walk_into(&self, ctx: &RegisterContext, max_depth: usize, out: &mut Vec<u64>) -> Termination {
        out.clear();
        let limit = max_depth.min(out.capacity());
        if limit == 0 {
            return Termination::DepthLimit(0);
        }
        out.push(ctx.pc);

        let mut fp = ctx.fp;
        if fp == 0 {
            return Termination::Complete;
        }
        let Some(stack) = self.memory.stack_range(ctx.sp) else {
            return Termination::InvalidFrame { fp };
        };

        // A thread stopped in a leaf (or in its prologue) has not saved its
        // return address yet; the link register is the only record of its
        // caller.
        if let Some(lr) = ctx.lr.filter(|&lr| lr != 0) {
            let saved = if frame_is_plausible(fp, None, &stack) { self.memory.read_word(fp + WORD) } else { None };
            if saved != Some(lr) {
                if out.len() >= limit {
                    return Termination::DepthLimit(limit);
                }
                out.push(lr);
            }
        }

        let mut previous: Option<u64> = None;
        loop {
            if fp == 0 {
                return Termination::Complete;
            }
            if !frame_is_plausible(fp, previous, &stack) {
                return Termination::InvalidFrame { fp };
            }
            if out.len() >= limit {
                return Termination::DepthLimit(limit);
            }

            let Some(return_addr) = self.memory.read_word(fp + WORD) else {
                return Termination::UnreadableMemory { addr: fp + WORD };
            };
            if return_addr == 0 {
                return Termination::Complete;
            }
            let Some(caller_fp) = self.memory.read_word(fp) else {
                return Termination::UnreadableMemory { addr: fp };
            };

            out.push(return_addr);
            previous = Some(fp);
            fp = caller_fp;
        }
    }
}

/// A frame record must be word aligned, lie entirely inside the stack, and
/// sit strictly above the previous one. The last rule doubles as the cycle
/// guard: a repeated or backwards link can never pass it.
fn frame_is_plausible(fp: u64, previous: Option<u64>, stack: &Range<u64>) -> bool {
    if fp % WORD != 0 || fp < stack.start {
        return false;
    }
    match fp.checked_add(2 * WORD) {
        Some(record_end) if record_end <= stack.end => {}
        _ => return false,
    }
    match previous {
        Some(prev) => fp > prev,
        None => true,
    }
}

/// This process's own memory, bounded by a [`MemoryMap`] taken before the
/// walk.
///
/// Reads use `process_vm_readv` on our own pid so an address that vanished
/// since the map was taken yields `EFAULT` instead of a fault. If the
/// syscall is unavailable (seccomp, old kernels) reads fall back to plain
/// loads, still restricted to readable mappings.
pub struct ProcessStack {
    pid: Pid,
    map: MemoryMap,
}

impl ProcessStack {
    pub fn new(map: MemoryMap) -> Self {
        ProcessStack { pid: Pid::this(), map }
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }
}

impl StackMemory for ProcessStack {
    fn read_word(&self, addr: u64) -> Option<u64> {
        if addr % WORD != 0 {
            return None;
        }
        let mapping = self.map.find(addr)?;
        if !mapping.is_readable() || addr + WORD > mapping.end {
            return None;
        }

        let mut buffer = [0u8; 8];
        let mut local_iov = [IoSliceMut::new(&mut buffer)];
        let remote_iov = [RemoteIoVec { base: addr as usize, len: WORD as usize }];
        match process_vm_readv(self.pid, &mut local_iov, &remote_iov) {
            Ok(n) if n == WORD as usize => Some(u64::from_ne_bytes(buffer)),
            Ok(_) => None,
            Err(Errno::ENOSYS) | Err(Errno::EPERM) => {
                // SAFETY: aligned, inside a readable mapping of this process.
                Some(unsafe { std::ptr::read_volatile(addr as *const u64) })
            }
            Err(_) => None,
        }
    }

    fn stack_range(&self, sp: u64) -> Option<Range<u64>> {
        self.map.stack_range(sp)
    }
}
