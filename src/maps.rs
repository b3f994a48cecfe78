//! `/proc/self/maps` parsing.
//!
//! The walker uses the writable mappings to bound a thread's stack, and the
//! symbolizer uses the executable ones to find which image owns an address.

use std::fs;
use std::ops::Range;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub permissions: String,
    pub offset: u64,
    pub pathname: String,
}

impl MemoryMapping {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn is_readable(&self) -> bool {
        self.permissions.starts_with('r')
    }

    pub fn is_writable(&self) -> bool {
        self.permissions.as_bytes().get(1) == Some(&b'w')
    }

    pub fn is_executable(&self) -> bool {
        self.permissions.as_bytes().get(2) == Some(&b'x')
    }

    /// Backed by a file on disk rather than anonymous memory or a
    /// pseudo-mapping such as `[vdso]`.
    pub fn is_file_backed(&self) -> bool {
        self.pathname.starts_with('/')
    }
}

/// Parse one line of a maps file.
///
/// Format: `address perms offset dev inode pathname`, e.g.
/// `559a9c400000-559a9c401000 r--p 00000000 103:02 2621487 /path/to/exe`.
/// The pathname is optional (anonymous mappings).
pub fn parse_memory_mapping(line: &str) -> Option<MemoryMapping> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }

    let (start, end) = parts[0].split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(parts[2], 16).ok()?;
    parts[4].parse::<u64>().ok()?;

    Some(MemoryMapping {
        start,
        end,
        permissions: parts[1].to_string(),
        offset,
        pathname: parts[5..].join(" "),
    })
}

/// A point-in-time copy of the process's mappings, sorted by start address.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    mappings: Vec<MemoryMapping>,
}

impl MemoryMap {
    pub fn load_self() -> Result<Self> {
        let contents = fs::read_to_string("/proc/self/maps")?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut mappings: Vec<MemoryMapping> =
            contents.lines().filter_map(parse_memory_mapping).collect();
        mappings.sort_by_key(|m| m.start);
        MemoryMap { mappings }
    }

    pub fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }

    /// The mapping containing `addr`, found without allocating.
    pub fn find(&self, addr: u64) -> Option<&MemoryMapping> {
        let idx = self.mappings.partition_point(|m| m.start <= addr);
        let candidate = self.mappings.get(idx.checked_sub(1)?)?;
        candidate.contains(addr).then_some(candidate)
    }

    /// Address range a stack whose pointer is `sp` can plausibly span:
    /// from `sp` up to the end of the readable, writable mapping holding it.
    pub fn stack_range(&self, sp: u64) -> Option<Range<u64>> {
        let mapping = self.find(sp)?;
        (mapping.is_readable() && mapping.is_writable()).then_some(sp..mapping.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
559a9c400000-559a9c401000 r--p 00000000 103:02 2621487 /usr/bin/demo
559a9c401000-559a9c405000 r-xp 00001000 103:02 2621487 /usr/bin/demo
7f0000000000-7f0000021000 rw-p 00000000 00:00 0
7f1a2b000000-7f1a2b028000 r--p 00000000 103:02 131 /usr/lib/libc.so.6
7f1a2b028000-7f1a2b1bd000 r-xp 00028000 103:02 131 /usr/lib/libc.so.6
7ffc00000000-7ffc00021000 rw-p 00000000 00:00 0                          [stack]
7ffc001fe000-7ffc00200000 r-xp 00000000 00:00 0                          [vdso]
";

    #[test]
    fn test_parse_file_backed_line() {
        let mapping =
            parse_memory_mapping("559a9c401000-559a9c405000 r-xp 00001000 103:02 2621487 /usr/bin/demo")
                .expect("valid line");
        assert_eq!(mapping.start, 0x559a9c401000);
        assert_eq!(mapping.end, 0x559a9c405000);
        assert_eq!(mapping.offset, 0x1000);
        assert_eq!(mapping.pathname, "/usr/bin/demo");
        assert!(mapping.is_executable());
        assert!(!mapping.is_writable());
        assert!(mapping.is_file_backed());
    }

    #[test]
    fn test_parse_anonymous_line() {
        let mapping = parse_memory_mapping("7f0000000000-7f0000021000 rw-p 00000000 00:00 0")
            .expect("valid line");
        assert!(mapping.pathname.is_empty());
        assert!(mapping.is_writable());
        assert!(!mapping.is_file_backed());
    }

    #[test]
    fn test_parse_path_with_spaces() {
        let mapping =
            parse_memory_mapping("1000-2000 r-xp 00000000 08:01 42 /opt/my app/lib.so").unwrap();
        assert_eq!(mapping.pathname, "/opt/my app/lib.so");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_memory_mapping("").is_none());
        assert!(parse_memory_mapping("nothex-2000 r-xp 0 08:01 1").is_none());
        assert!(parse_memory_mapping("1000 r-xp 0 08:01 1").is_none());
    }

    #[test]
    fn test_find() {
        let map = MemoryMap::parse(SAMPLE);
        assert_eq!(map.mappings().len(), 7);
        let found = map.find(0x7f1a2b030000).unwrap();
        assert_eq!(found.pathname, "/usr/lib/libc.so.6");
        assert!(found.is_executable());
        assert!(map.find(0x1000).is_none());
        assert!(map.find(0x559a9c405000).is_none());
    }

    #[test]
    fn test_stack_range() {
        let map = MemoryMap::parse(SAMPLE);
        assert_eq!(map.stack_range(0x7ffc00010000), Some(0x7ffc00010000..0x7ffc00021000));
        // Text is not a plausible stack.
        assert_eq!(map.stack_range(0x559a9c402000), None);
        assert_eq!(map.stack_range(0x10), None);
    }

    #[test]
    fn test_load_self_contains_own_code() {
        let map = MemoryMap::load_self().unwrap();
        let here = test_load_self_contains_own_code as usize as u64;
        let mapping = map.find(here).expect("own code is mapped");
        assert!(mapping.is_executable());
    }
}
