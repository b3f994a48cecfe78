//! Capture configuration.
//!
//! Defaults are tuned for crash reporting: a bounded walk, a short suspension
//! budget, and symbol names but no DWARF line lookups. Every field can be
//! overridden from the environment through [`CaptureConfig::from_env`].

use std::str::FromStr;
use std::time::Duration;

/// Maximum number of frames collected per thread by default.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// How many times a transient suspension failure is retried by default.
pub const DEFAULT_SUSPEND_ATTEMPTS: u32 = 3;

/// How long the requester waits for a target thread to acknowledge suspension.
pub const DEFAULT_SUSPEND_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Upper bound on frames per thread, the program counter included.
    pub max_depth: usize,
    /// Suspension attempts before a thread is treated as gone.
    pub suspend_attempts: u32,
    /// Per-attempt wait for the target to park itself.
    pub suspend_timeout: Duration,
    /// Resolve frame addresses to module and symbol names.
    pub symbolicate: bool,
    /// Append `file:line` from DWARF when available.
    pub source_locations: bool,
    /// Print the captured pc/sp/fp/lr under each thread header.
    pub include_registers: bool,
    /// Append the list of loaded images to the report.
    pub include_images: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            max_depth: DEFAULT_MAX_DEPTH,
            suspend_attempts: DEFAULT_SUSPEND_ATTEMPTS,
            suspend_timeout: DEFAULT_SUSPEND_TIMEOUT,
            symbolicate: true,
            source_locations: false,
            include_registers: false,
            include_images: false,
        }
    }
}

impl CaptureConfig {
    /// Defaults overlaid with `BACKTRACK_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are
    /// ignored and logged.
    pub fn overlay<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(depth) = parse_var::<usize>(&lookup, "BACKTRACK_MAX_DEPTH") {
            self = self.with_max_depth(depth);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "BACKTRACK_SUSPEND_ATTEMPTS") {
            self.suspend_attempts = attempts.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "BACKTRACK_SUSPEND_TIMEOUT_MS") {
            self.suspend_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = parse_flag(&lookup, "BACKTRACK_SYMBOLICATE") {
            self.symbolicate = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "BACKTRACK_SOURCE_LINES") {
            self.source_locations = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "BACKTRACK_REGISTERS") {
            self.include_registers = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "BACKTRACK_IMAGES") {
            self.include_images = flag;
        }
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    pub fn with_suspend_attempts(mut self, attempts: u32) -> Self {
        self.suspend_attempts = attempts.max(1);
        self
    }

    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    pub fn with_symbolicate(mut self, symbolicate: bool) -> Self {
        self.symbolicate = symbolicate;
        self
    }

    pub fn with_source_locations(mut self, source_locations: bool) -> Self {
        self.source_locations = source_locations;
        self
    }

    pub fn with_registers(mut self, include_registers: bool) -> Self {
        self.include_registers = include_registers;
        self
    }

    pub fn with_images(mut self, include_images: bool) -> Self {
        self.include_images = include_images;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unparseable configuration flag");
            None
        }
    }
}
