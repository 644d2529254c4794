// This module loads the code of an executable into a CodeImage using the object crate. Every
// text section becomes a mapped segment at its virtual address, and every defined text symbol
// with a non-zero size becomes a routine. Aliases (several symbols at one address) collapse to
// the first one seen. Only x86-64 files are accepted.

//! Executable image loading.

use crate::core::error::{ImageError, RunError};
use crate::core::query::RoutineInfo;
use crate::x64::decoder::CodeImage;
use object::{Architecture, Object, ObjectSection, ObjectSymbol, SectionKind, SymbolKind};
use std::fs;
use std::path::Path;

/// Build a [`CodeImage`] from the bytes of an object file or executable.
pub fn image_from_bytes(data: &[u8]) -> Result<CodeImage, ImageError> {
    let file = object::File::parse(data)?;
    if file.architecture() != Architecture::X86_64 {
        return Err(ImageError::Architecture(file.architecture()));
    }

    let mut image = CodeImage::new();
    let mut segments = 0;
    for section in file.sections() {
        if section.kind() != SectionKind::Text {
            continue;
        }
        let bytes = section.data()?;
        if bytes.is_empty() {
            continue;
        }
        image.add_segment(section.address(), bytes.to_vec());
        segments += 1;
    }
    if segments == 0 {
        return Err(ImageError::NoCode);
    }

    for symbol in file.symbols() {
        if symbol.kind() != SymbolKind::Text || !symbol.is_definition() || symbol.size() == 0 {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        image.add_routine(RoutineInfo::new(name, symbol.address(), symbol.size()));
    }
    log::debug!(
        "loaded {segments} code segments and {} routines",
        image.routine_count()
    );
    Ok(image)
}

/// Load the executable at `path`.
pub fn load_elf(path: &Path) -> Result<CodeImage, RunError> {
    let data = fs::read(path).map_err(|source| RunError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    image_from_bytes(&data).map_err(|source| RunError::Image {
        path: path.to_path_buf(),
        source,
    })
}
