//! DWARF source locations for resolved frames.
//!
//! Built per capture and dropped with it: DWARF contexts are large and not
//! shareable across threads, so they never join the process-wide symbol
//! cache.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use object::{Object, ObjectSection};

use crate::symbolizer::SymbolInfo;

/// Source file and line of a code address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

type DwarfReader = gimli::EndianRcSlice<gimli::RunTimeEndian>;

/// Lazily loads one DWARF context per image path.
#[derive(Default)]
pub struct LineResolver {
    contexts: HashMap<String, Option<addr2line::Context<DwarfReader>>>,
}

impl LineResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source location of a resolved frame, if the image carries line
    /// tables for it.
    pub fn locate(&mut self, info: &SymbolInfo) -> Option<SourceLocation> {
        let context = self
            .contexts
            .entry(info.path.clone())
            .or_insert_with(|| match load_dwarf(Path::new(&info.path)) {
                Ok(context) => Some(context),
                Err(err) => {
                    tracing::debug!(module = %info.module, error = %err, "no DWARF line info");
                    None
                }
            })
            .as_ref()?;

        let location = context.find_location(info.file_address).ok()??;
        let line = location.line.filter(|&line| line != 0)?;
        Some(SourceLocation { file: location.file?.to_string(), line })
    }
}

fn load_dwarf(binary_path: &Path) -> Result<addr2line::Context<DwarfReader>> {
    let file = File::open(binary_path)
        .with_context(|| format!("Failed to open binary: {}", binary_path.display()))?;
    // SAFETY: read-only mapping of an image the loader has mapped too.
    let mmap = unsafe { memmap2::Mmap::map(&file) }.context("Failed to memory-map binary")?;
    let object = object::File::parse(&*mmap).context("Failed to parse binary")?;

    let endian = if object.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> std::result::Result<DwarfReader, gimli::Error> {
        let data = object
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(std::borrow::Cow::Borrowed(&[]));
        let bytes: std::rc::Rc<[u8]> = std::rc::Rc::from(data.into_owned());
        Ok(gimli::EndianRcSlice::new(bytes, endian))
    };

    let dwarf = gimli::Dwarf::load(&load_section).context("Failed to load DWARF sections")?;
    addr2line::Context::from_dwarf(dwarf).context("Failed to create DWARF context")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolizer::{SymbolResolver, Symbolize};

    #[inline(never)]
    fn located_marker() -> u64 {
        std::hint::black_box(11)
    }

    #[test]
    fn test_locates_own_function() {
        let info = SymbolResolver::new()
            .resolve(located_marker as usize as u64)
            .expect("own code resolves");
        let location = LineResolver::new().locate(&info).expect("test binaries carry DWARF");
        assert!(location.file.ends_with("lines.rs"), "{location:?}");
        assert!(location.line > 0);
    }

    #[test]
    fn test_missing_image_degrades() {
        let info = SymbolInfo {
            module: "gone.so".to_string(),
            path: "/nonexistent/gone.so".to_string(),
            name: None,
            offset: 0,
            file_address: 0x1000,
        };
        let mut lines = LineResolver::new();
        assert!(lines.locate(&info).is_none());
        // The failed load is remembered rather than retried.
        assert!(lines.contexts.contains_key("/nonexistent/gone.so"));
        assert!(lines.locate(&info).is_none());
    }
}
