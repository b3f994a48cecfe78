use std::fmt;

/// Register state of one thread at one instant: enough to start a
/// frame-pointer walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterContext {
    /// Program counter (RIP on x86_64, PC on aarch64)
    pub pc: u64,
    /// Stack pointer (RSP on x86_64, SP on aarch64)
    pub sp: u64,
    /// Frame pointer (RBP on x86_64, X29 on aarch64)
    pub fp: u64,
    /// Link register (X30 on aarch64), absent on x86_64
    pub lr: Option<u64>,
}

impl RegisterContext {
    pub const fn new(pc: u64, sp: u64, fp: u64, lr: Option<u64>) -> Self {
        RegisterContext { pc, sp, fp, lr }
    }

    /// Decode the interrupted register state handed to an `SA_SIGINFO`
    /// signal handler.
    ///
    /// # Safety
    ///
    /// `uc` must be the (non-null) `ucontext_t` pointer the kernel passed to
    /// the currently running handler.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn from_ucontext(uc: *const libc::ucontext_t) -> Self {
        let gregs = unsafe { &(*uc).uc_mcontext.gregs };
        RegisterContext::new(
            gregs[libc::REG_RIP as usize] as u64,
            gregs[libc::REG_RSP as usize] as u64,
            gregs[libc::REG_RBP as usize] as u64,
            None,
        )
    }

    /// Decode the interrupted register state handed to an `SA_SIGINFO`
    /// signal handler.
    ///
    /// # Safety
    ///
    /// `uc` must be the (non-null) `ucontext_t` pointer the kernel passed to
    /// the currently running handler.
    #[cfg(target_arch = "aarch64")]
    pub unsafe fn from_ucontext(uc: *const libc::ucontext_t) -> Self {
        let mcontext = unsafe { &(*uc).uc_mcontext };
        RegisterContext::new(mcontext.pc, mcontext.sp, mcontext.regs[29], Some(mcontext.regs[30]))
    }
}

impl fmt::Display for RegisterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc 0x{:016x} sp 0x{:016x} fp 0x{:016x}", self.pc, self.sp, self.fp)?;
        if let Some(lr) = self.lr {
            write!(f, " lr 0x{lr:016x}")?;
        }
        Ok(())
    }
}

/// Read the calling frame's own registers.
///
/// This is a macro rather than a function so the captured frame pointer
/// belongs to the frame that expands it: that frame must stay live for as
/// long as the context is walked.
#[cfg(target_arch = "x86_64")]
macro_rules! current_context {
    () => {{
        let pc: u64;
        let sp: u64;
        let fp: u64;
        // SAFETY: only copies registers into outputs.
        unsafe {
            ::core::arch::asm!(
                "lea {pc}, [rip]",
                "mov {stack}, rsp",
                "mov {frame}, rbp",
                pc = out(reg) pc,
                stack = out(reg) sp,
                frame = out(reg) fp,
                options(nomem, nostack, preserves_flags),
            );
        }
        $crate::context::RegisterContext::new(pc, sp, fp, None)
    }};
}

#[cfg(target_arch = "aarch64")]
macro_rules! current_context {
    () => {{
        let pc: u64;
        let sp: u64;
        let fp: u64;
        let lr: u64;
        // SAFETY: only copies registers into outputs.
        unsafe {
            ::core::arch::asm!(
                "adr {pc}, .",
                "mov {stack}, sp",
                "mov {frame}, x29",
                "mov {link}, x30",
                pc = out(reg) pc,
                stack = out(reg) sp,
                frame = out(reg) fp,
                link = out(reg) lr,
                options(nomem, nostack, preserves_flags),
            );
        }
        $crate::context::RegisterContext::new(pc, sp, fp, Some(lr))
    }};
}

pub(crate) use current_context;
