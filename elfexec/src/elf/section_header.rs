use scroll::{
    Pread,
    Pwrite,
    SizeWith,
};

use crate::elf::bytes;

/// `e_phnum` value that says the real number of program headers lives in the first section header
pub const PN_XNUM: u16 = 0xffff;

/// A 64-bit section header. Core files only ever carry the single
/// `SHT_NULL` entry needed for extended program header numbering.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl SectionHeader {
    /// The entry that carries the real segment count of a core file in `sh_info`.
    /// `sh_size` holds the number of section headers, which is always one.
    pub fn extended_numbering(segments: u32) -> Self {
        Self {
            sh_type: goblin::elf::section_header::SHT_NULL,
            sh_size: 1,
            sh_info: segments,
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytes::encode(*self)
    }
}
