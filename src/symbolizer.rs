//! Address to module/symbol resolution.
//!
//! Modules are discovered from the executable mappings in `/proc/self/maps`.
//! Each module's symbol table is read from disk the first time one of its
//! addresses is resolved, and every answer (including "unknown") is cached by
//! address. Nothing here ever suspends a thread, and I/O failures only ever
//! degrade a frame to module-only or unknown.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use anyhow::{Context, Result};
use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};

use crate::maps::MemoryMap;

/// Best-effort description of a code address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Short image name, e.g. `libc.so.6`.
    pub module: String,
    /// Full image path as mapped.
    pub path: String,
    /// Demangled function name, absent when the image has no usable symbol.
    pub name: Option<String>,
    /// Bytes from the symbol start, or from the image base when `name` is
    /// absent.
    pub offset: u64,
    /// The address translated into the image's own (link-time) address space.
    pub file_address: u64,
}

/// Summary of one loaded image, for the report's image list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub start: u64,
    pub end: u64,
    pub name: String,
    pub path: String,
}

/// Anything that can turn a code address into a [`SymbolInfo`].
pub trait Symbolize {
    fn resolve(&self, address: u64) -> Option<SymbolInfo>;

    fn images(&self) -> Vec<ImageSummary> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableSymbol {
    address: u64,
    size: u64,
    name: String,
}

/// Function symbols of one image, sorted by link-time address.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    bias: u64,
    symbols: Vec<TableSymbol>,
}

impl SymbolTable {
    /// Build a table from `(address, size, raw name)` triples. `bias` is the
    /// difference between runtime and link-time addresses.
    pub fn new<I, S>(bias: u64, symbols: I) -> Self
    where
        I: IntoIterator<Item = (u64, u64, S)>,
        S: Into<String>,
    {
        let mut symbols: Vec<TableSymbol> = symbols
            .into_iter()
            .map(|(address, size, name)| TableSymbol { address, size, name: name.into() })
            .filter(|s| s.address != 0 && !s.name.is_empty())
            .collect();
        // Prefer the sized entry when aliases share an address.
        symbols.sort_by(|a, b| a.address.cmp(&b.address).then(b.size.cmp(&a.size)));
        symbols.dedup_by_key(|s| s.address);
        SymbolTable { bias, symbols }
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Nearest symbol at or before the runtime `address`, with the offset
    /// into it. Addresses past the end of a sized symbol fall in a gap.
    pub fn lookup(&self, address: u64) -> Option<(Cow<'_, str>, u64)> {
        let file_address = address.checked_sub(self.bias)?;
        let idx = self.symbols.partition_point(|s| s.address <= file_address);
        let symbol = self.symbols.get(idx.checked_sub(1)?)?;
        let offset = file_address - symbol.address;
        if symbol.size != 0 && offset >= symbol.size {
            return None;
        }
        Some((addr2line::demangle_auto(Cow::Borrowed(symbol.name.as_str()), None), offset))
    }

    /// Read the function symbols of the image at `path`, which is mapped at
    /// `mapped_start` from file offset `mapped_offset`.
    pub fn load(path: &Path, mapped_start: u64, mapped_offset: u64) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open image: {}", path.display()))?;
        // SAFETY: read-only mapping of an image the loader has mapped too.
        let mmap = unsafe { memmap2::Mmap::map(&file) }.context("Failed to memory-map image")?;
        let object = object::File::parse(&*mmap).context("Failed to parse image")?;

        let bias = load_bias(&object, mapped_start, mapped_offset);
        let mut symbols = function_symbols(object.symbols());
        if symbols.is_empty() {
            symbols = function_symbols(object.dynamic_symbols());
        }
        if symbols.is_empty() {
            anyhow::bail!("No function symbols in {}", path.display());
        }
        Ok(SymbolTable::new(bias, symbols))
    }
}

fn function_symbols<'data, S: ObjectSymbol<'data>>(symbols: impl Iterator<Item = S>) -> Vec<(u64, u64, String)> {
    symbols
        .filter(|s| s.kind() == SymbolKind::Text && s.is_definition())
        .filter_map(|s| Some((s.address(), s.size(), s.name().ok()?.to_string())))
        .collect()
}

/// Runtime minus link-time address, derived from the load segment that
/// covers the first mapped file offset.
fn load_bias(object: &object::File<'_>, mapped_start: u64, mapped_offset: u64) -> u64 {
    for segment in object.segments() {
        let (file_offset, file_size) = segment.file_range();
        let covers = file_offset <= mapped_offset && mapped_offset < file_offset + file_size.max(1);
        let page_aligned_start = file_offset & !0xfff;
        if covers || page_aligned_start == mapped_offset {
            let link_address = segment.address().wrapping_sub(file_offset).wrapping_add(mapped_offset);
            return mapped_start.wrapping_sub(link_address);
        }
    }
    mapped_start.wrapping_sub(mapped_offset)
}

struct Module {
    name: String,
    path: String,
    ranges: Vec<Range<u64>>,
    first_start: u64,
    first_offset: u64,
    table: OnceLock<Option<Arc<SymbolTable>>>,
}

impl Module {
    fn contains(&self, address: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(&address))
    }

    fn table(&self) -> Option<Arc<SymbolTable>> {
        self.table
            .get_or_init(|| {
                if !self.path.starts_with('/') {
                    return None;
                }
                match SymbolTable::load(Path::new(&self.path), self.first_start, self.first_offset) {
                    Ok(table) => {
                        tracing::debug!(module = %self.name, symbols = table.len(), "loaded symbol table");
                        Some(Arc::new(table))
                    }
                    Err(err) => {
                        tracing::debug!(module = %self.name, error = %err, "symbols unavailable");
                        None
                    }
                }
            })
            .clone()
    }
}

fn short_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Group the executable mappings of `map` into modules, one per image.
fn modules_from_map(map: &MemoryMap) -> Vec<Module> {
    let mut modules: Vec<Module> = Vec::new();
    for mapping in map.mappings() {
        if mapping.pathname.is_empty() {
            continue;
        }
        let idx = match modules.iter().position(|m| m.path == mapping.pathname) {
            Some(idx) => idx,
            None => {
                // Mappings are sorted, so the first one seen is the lowest.
                modules.push(Module {
                    name: short_name(&mapping.pathname),
                    path: mapping.pathname.clone(),
                    ranges: Vec::new(),
                    first_start: mapping.start,
                    first_offset: mapping.offset,
                    table: OnceLock::new(),
                });
                modules.len() - 1
            }
        };
        if mapping.is_executable() {
            modules[idx].ranges.push(mapping.start..mapping.end);
        }
    }
    modules.retain(|m| !m.ranges.is_empty());
    modules
}

/// Process-wide resolver over the images mapped into this process.
///
/// Both the module list and the address cache only ever grow: a loaded
/// image's addresses keep their meaning for the life of the process.
pub struct SymbolResolver {
    modules: RwLock<Vec<Arc<Module>>>,
    cache: RwLock<HashMap<u64, Option<SymbolInfo>>>,
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver {
    /// A resolver that discovers modules on first use.
    pub fn new() -> Self {
        SymbolResolver { modules: RwLock::new(Vec::new()), cache: RwLock::new(HashMap::new()) }
    }

    /// A resolver seeded from an existing memory map.
    pub fn from_map(map: &MemoryMap) -> Self {
        let resolver = Self::new();
        resolver.merge(map);
        resolver
    }

    /// Re-read `/proc/self/maps` and append images loaded since last time.
    pub fn refresh(&self) {
        match MemoryMap::load_self() {
            Ok(map) => self.merge(&map),
            Err(err) => tracing::debug!(error = %err, "could not refresh module list"),
        }
    }

    fn merge(&self, map: &MemoryMap) {
        let discovered = modules_from_map(map);
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        for module in discovered {
            if !modules.iter().any(|m| m.path == module.path && m.first_start == module.first_start) {
                modules.push(Arc::new(module));
            }
        }
    }

    fn find_module(&self, address: u64) -> Option<Arc<Module>> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        modules.iter().find(|m| m.contains(address)).cloned()
    }

    fn resolve_uncached(&self, address: u64) -> Option<SymbolInfo> {
        let module = match self.find_module(address) {
            Some(module) => module,
            None => {
                self.refresh();
                self.find_module(address)?
            }
        };

        let table = module.table();
        let bias = table.as_ref().map_or(module.first_start.wrapping_sub(module.first_offset), |t| t.bias());
        let file_address = address.wrapping_sub(bias);
        let (name, offset) = match table.as_ref().and_then(|t| t.lookup(address)) {
            Some((name, offset)) => (Some(name.into_owned()), offset),
            None => (None, address.wrapping_sub(module.first_start)),
        };

        Some(SymbolInfo { module: module.name.clone(), path: module.path.clone(), name, offset, file_address })
    }
}

impl Symbolize for SymbolResolver {
    fn resolve(&self, address: u64) -> Option<SymbolInfo> {
        if let Some(hit) = self.cache.read().unwrap_or_else(PoisonError::into_inner).get(&address) {
            return hit.clone();
        }
        let info = self.resolve_uncached(address);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, info.clone());
        info
    }

    fn images(&self) -> Vec<ImageSummary> {
        if self.modules.read().unwrap_or_else(PoisonError::into_inner).is_empty() {
            self.refresh();
        }
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        let mut images: Vec<ImageSummary> = modules
            .iter()
            .map(|m| ImageSummary {
                start: m.ranges.iter().map(|r| r.start).min().unwrap_or(m.first_start),
                end: m.ranges.iter().map(|r| r.end).max().unwrap_or(m.first_start),
                name: m.name.clone(),
                path: m.path.clone(),
            })
            .collect();
        images.sort_by_key(|i| i.start);
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SymbolTable {
        SymbolTable::new(
            0x5000_0000,
            vec![
                (0x1000, 0x40, "first"),
                (0x1100, 0, "unsized"),
                (0x1040, 0x20, "_ZN4demo6worker4spin17h0123456789abcdefE"),
                (0x1000, 0, "first_alias"),
                (0, 0x10, "null"),
            ],
        )
    }

    #[test]
    fn test_lookup_exact_and_offset() {
        let table = table();
        assert_eq!(table.len(), 3);
        let (name, offset) = table.lookup(0x5000_1000).unwrap();
        assert_eq!(name, "first");
        assert_eq!(offset, 0);
        let (name, offset) = table.lookup(0x5000_1010).unwrap();
        assert_eq!(name, "first");
        assert_eq!(offset, 0x10);
    }

    #[test]
    fn test_lookup_demangles() {
        let table = table();
        let (name, offset) = table.lookup(0x5000_1045).unwrap();
        assert!(name.starts_with("demo::worker::spin"), "{name}");
        assert_eq!(offset, 5);
    }

    #[test]
    fn test_lookup_gap_and_before_first() {
        let table = table();
        assert!(table.lookup(0x5000_1060).is_none());
        assert!(table.lookup(0x5000_0fff).is_none());
        assert!(table.lookup(0x10).is_none());
    }

    #[test]
    fn test_unsized_symbol_extends() {
        let table = table();
        let (name, offset) = table.lookup(0x5000_1900).unwrap();
        assert_eq!(name, "unsized");
        assert_eq!(offset, 0x800);
    }

    #[test]
    fn test_modules_from_map_groups_by_path() {
        let map = MemoryMap::parse(
            "\
559a9c400000-559a9c401000 r--p 00000000 103:02 2621487 /usr/bin/demo
559a9c401000-559a9c405000 r-xp 00001000 103:02 2621487 /usr/bin/demo
559a9c405000-559a9c406000 rw-p 00005000 103:02 2621487 /usr/bin/demo
7f0000000000-7f0000021000 rw-p 00000000 00:00 0
7f1a2b000000-7f1a2b028000 r--p 00000000 103:02 131 /usr/lib/libc.so.6
7f1a2b028000-7f1a2b1bd000 r-xp 00028000 103:02 131 /usr/lib/libc.so.6
7ffc00000000-7ffc00021000 rw-p 00000000 00:00 0 [stack]
7ffc001fe000-7ffc00200000 r-xp 00000000 00:00 0 [vdso]
",
        );
        let modules = modules_from_map(&map);
        let names: Vec<&str> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["demo", "libc.so.6", "[vdso]"]);
        assert_eq!(modules[0].first_start, 0x559a9c400000);
        assert_eq!(modules[0].ranges, vec![0x559a9c401000..0x559a9c405000]);
        assert!(modules[2].table().is_none());
    }

    #[inline(never)]
    fn resolvable_marker() -> u64 {
        std::hint::black_box(7)
    }

    #[test]
    fn test_resolves_own_function() {
        let resolver = SymbolResolver::new();
        let address = resolvable_marker as usize as u64;
        let info = resolver.resolve(address).expect("own code belongs to a module");
        let name = info.name.expect("test binaries keep their symbol table");
        assert!(name.contains("resolvable_marker"), "{name}");
        assert_eq!(info.offset, 0);
        assert!(!info.module.is_empty());
        assert!(info.path.starts_with('/'));

        let inside = resolver.resolve(address + 1).unwrap();
        assert_eq!(inside.offset, 1);
    }

    #[test]
    fn test_unknown_address_is_none_and_cached() {
        let resolver = SymbolResolver::new();
        assert!(resolver.resolve(0x10).is_none());
        assert!(resolver.cache.read().unwrap().contains_key(&0x10));
        assert!(resolver.resolve(0x10).is_none());
    }

    #[test]
    fn test_images_are_sorted_and_include_self() {
        let resolver = SymbolResolver::new();
        resolver.refresh();
        let images = resolver.images();
        assert!(!images.is_empty());
        assert!(images.windows(2).all(|w| w[0].start <= w[1].start));
        let here = test_images_are_sorted_and_include_self as usize as u64;
        assert!(images.iter().any(|i| i.start <= here && here < i.end));
    }
}
