//! Loading of the guest kernel image. ELF32 and ELF64 little-endian
//! executables are accepted.

/// ELF magic number: \x7fELF
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

/// Program header type: loadable segment
pub(crate) const PT_LOAD: u32 = 1;
/// Program header flags: executable
pub(crate) const PF_X: u32 = 1;
/// Program header flags: writable
pub(crate) const PF_W: u32 = 2;
/// Program header flags: readable
pub(crate) const PF_R: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ElfError {
    #[error("invalid ELF magic number")]
    InvalidMagic,
    #[error("unsupported ELF class {0}")]
    InvalidClass(u8),
    #[error("not a little-endian ELF")]
    InvalidEndianness,
    #[error("image too small to contain the ELF header")]
    FileTooSmall,
    #[error("program header {index} out of bounds")]
    ProgramHeaderOutOfBounds { index: u16 },
    #[error("segment {index} has a memory size smaller than its file size")]
    InvalidSegmentSize { index: u16 },
    #[error("segment {index} lies outside the image")]
    SegmentOutOfImage { index: u16 },
    #[error("segment {index} lies outside guest memory")]
    SegmentOutOfGuestMemory { index: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Elf32,
    Elf64,
}

/// The fields of a program header the loader uses, widened to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProgramHeader {
    pub(crate) p_type: u32,
    pub(crate) p_flags: u32,
    pub(crate) p_offset: u64,
    pub(crate) p_paddr: u64,
    pub(crate) p_filesz: u64,
    pub(crate) p_memsz: u64,
}

impl ProgramHeader {
    /// Returns whether the segment is copied into guest memory. Segments that
    /// are neither writable nor executable are skipped.
    pub(crate) fn is_loadable(&self) -> bool {
        self.p_type == PT_LOAD && self.p_flags & (PF_W | PF_X) != 0
    }
}

/// A validated view of an ELF image.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElfImage<'a> {
    data: &'a [u8],
    class: Class,
    entry: u64,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
}

impl<'a> ElfImage<'a> {
    pub(crate) fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let ident = data.get(..16).ok_or(ElfError::FileTooSmall)?;
        if ident[..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }
        let class = match ident[EI_CLASS] {
            ELFCLASS32 => Class::Elf32,
            ELFCLASS64 => Class::Elf64,
            other => return Err(ElfError::InvalidClass(other)),
        };
        if ident[EI_DATA] != ELFDATA2LSB {
            return Err(ElfError::InvalidEndianness);
        }

        let image = match class {
            Class::Elf32 => Self {
                data,
                class,
                entry: read_u32(data, 0x18).ok_or(ElfError::FileTooSmall)?.into(),
                phoff: read_u32(data, 0x1c).ok_or(ElfError::FileTooSmall)?.into(),
                phentsize: read_u16(data, 0x2a).ok_or(ElfError::FileTooSmall)?,
                phnum: read_u16(data, 0x2c).ok_or(ElfError::FileTooSmall)?,
            },
            Class::Elf64 => Self {
                data,
                class,
                entry: read_u64(data, 0x18).ok_or(ElfError::FileTooSmall)?,
                phoff: read_u64(data, 0x20).ok_or(ElfError::FileTooSmall)?,
                phentsize: read_u16(data, 0x36).ok_or(ElfError::FileTooSmall)?,
                phnum: read_u16(data, 0x38).ok_or(ElfError::FileTooSmall)?,
            },
        };
        Ok(image)
    }

    /// The address the guest starts executing at.
    pub(crate) fn entry(&self) -> u64 {
        self.entry
    }

    pub(crate) fn program_header(&self, index: u16) -> Result<ProgramHeader, ElfError> {
        let out_of_bounds = ElfError::ProgramHeaderOutOfBounds { index };
        let offset = u64::from(index)
            .checked_mul(self.phentsize.into())
            .and_then(|offset| offset.checked_add(self.phoff))
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or(out_of_bounds)?;
        let data = self.data;
        let header = match self.class {
            Class::Elf32 => ProgramHeader {
                p_type: read_u32(data, offset).ok_or(out_of_bounds)?,
                p_offset: read_u32(data, offset + 0x04).ok_or(out_of_bounds)?.into(),
                p_paddr: read_u32(data, offset + 0x0c).ok_or(out_of_bounds)?.into(),
                p_filesz: read_u32(data, offset + 0x10).ok_or(out_of_bounds)?.into(),
                p_memsz: read_u32(data, offset + 0x14).ok_or(out_of_bounds)?.into(),
                p_flags: read_u32(data, offset + 0x18).ok_or(out_of_bounds)?,
            },
            Class::Elf64 => ProgramHeader {
                p_type: read_u32(data, offset).ok_or(out_of_bounds)?,
                p_flags: read_u32(data, offset + 0x04).ok_or(out_of_bounds)?,
                p_offset: read_u64(data, offset + 0x08).ok_or(out_of_bounds)?,
                p_paddr: read_u64(data, offset + 0x18).ok_or(out_of_bounds)?,
                p_filesz: read_u64(data, offset + 0x20).ok_or(out_of_bounds)?,
                p_memsz: read_u64(data, offset + 0x28).ok_or(out_of_bounds)?,
            },
        };
        Ok(header)
    }

    pub(crate) fn program_headers(&self) -> impl Iterator<Item = Result<ProgramHeader, ElfError>> + '_ {
        (0..self.phnum).map(|index| self.program_header(index))
    }
}

/// Copies the loadable segments of `image` to `guest_memory` at their physical
/// addresses and zero-fills the rest of each segment. Returns the entry point.
pub(crate) fn load(image: &[u8], guest_memory: &mut [u8]) -> Result<u64, ElfError> {
    let elf = ElfImage::parse(image)?;
    for (index, header) in (0..).zip(elf.program_headers()) {
        let header = header?;
        if !header.is_loadable() {
            log::debug!("Skipping segment {index}: {header:x?}");
            continue;
        }
        if header.p_filesz > header.p_memsz {
            return Err(ElfError::InvalidSegmentSize { index });
        }

        let file = range(header.p_offset, header.p_filesz)
            .filter(|file| file.end <= image.len())
            .ok_or(ElfError::SegmentOutOfImage { index })?;
        let memory = range(header.p_paddr, header.p_memsz)
            .filter(|memory| memory.end <= guest_memory.len())
            .ok_or(ElfError::SegmentOutOfGuestMemory { index })?;

        let (bss_start, bss_len) = (memory.start + file.len(), memory.len() - file.len());
        guest_memory[memory.start..bss_start].copy_from_slice(&image[file]);
        guest_memory[bss_start..bss_start + bss_len].fill(0);
        log::debug!(
            "Loaded segment {index} ({}{}{}): paddr={:#x}, filesz={:#x}, memsz={:#x}",
            flag(header.p_flags, PF_R, 'R'),
            flag(header.p_flags, PF_W, 'W'),
            flag(header.p_flags, PF_X, 'E'),
            header.p_paddr,
            header.p_filesz,
            header.p_memsz
        );
    }

    log::info!("ELF image loaded. Entry point {:#x}", elf.entry());
    Ok(elf.entry())
}

fn flag(flags: u32, bit: u32, letter: char) -> char {
    if flags & bit == 0 { ' ' } else { letter }
}

fn range(start: u64, len: u64) -> Option<core::ops::Range<usize>> {
    let start = usize::try_from(start).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    Some(start..end)
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(offset..offset + 2)?.try_into().ok()?))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(offset..offset + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(offset..offset + 8)?.try_into().ok()?))
}
