use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use thiserror::Error;

use crate::ram::Ram;

/// Host-side errors from guest image loading.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("binary file ({image} bytes) is larger than memory ({ram} bytes)")]
    TooLarge { image: usize, ram: usize },

    #[error("failed to parse ELF image: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("ELF segment exceeds file bounds (offset {0:#x})")]
    SegmentOutOfFile(usize),

    #[error("ELF segment at {addr:#010x} (+{size:#x} bytes) lies outside RAM")]
    SegmentOutOfRange { addr: u64, size: u64 },
}

/// Load a guest image into RAM.
///
/// Flat binaries land at RAM offset 0 and return `None` (the platform
/// reset vector applies). Images with an ELF magic are loaded segment-wise
/// at their physical addresses instead, returning the entry point.
pub fn load_image(ram: &mut Ram, image: &[u8]) -> Result<Option<u32>, LoadError> {
    if image.starts_with(b"\x7fELF") {
        load_elf(ram, image).map(Some)
    } else {
        load_flat(ram, image)?;
        Ok(None)
    }
}

fn load_flat(ram: &mut Ram, image: &[u8]) -> Result<(), LoadError> {
    if image.len() > ram.size() as usize {
        return Err(LoadError::TooLarge {
            image: image.len(),
            ram: ram.size() as usize,
        });
    }
    ram.write_bytes(ram.base(), image);
    log::debug!("loaded {} byte flat image at {:#010x}", image.len(), ram.base());
    Ok(())
}

fn load_elf(ram: &mut Ram, image: &[u8]) -> Result<u32, LoadError> {
    let elf = Elf::parse(image)?;
    let ram_base = u64::from(ram.base());
    let ram_end = ram_base + u64::from(ram.size());

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let file_offset = ph.p_offset as usize;
        if file_offset + file_size > image.len() {
            return Err(LoadError::SegmentOutOfFile(file_offset));
        }

        let target = if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr };
        let seg_end = target
            .checked_add(ph.p_memsz)
            .ok_or(LoadError::SegmentOutOfRange {
                addr: target,
                size: ph.p_memsz,
            })?;
        if target < ram_base || seg_end > ram_end {
            return Err(LoadError::SegmentOutOfRange {
                addr: target,
                size: ph.p_memsz,
            });
        }

        ram.write_bytes(target as u32, &image[file_offset..file_offset + file_size]);
        // RAM starts zeroed, so only re-zero bss when segments overlap.
        if ph.p_memsz > ph.p_filesz {
            let zeroes = vec![0u8; (ph.p_memsz - ph.p_filesz) as usize];
            ram.write_bytes(target as u32 + ph.p_filesz as u32, &zeroes);
        }
        log::debug!(
            "loaded segment: addr={:#x}, filesz={:#x}, memsz={:#x}",
            target,
            ph.p_filesz,
            ph.p_memsz
        );
    }

    Ok(elf.entry as u32)
}
