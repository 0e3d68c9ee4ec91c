use goblin::elf::header::{
    EI_CLASS,
    EI_DATA,
    EI_VERSION,
    ELFCLASS64,
    ELFDATA2LSB,
    ELFMAG,
    ET_CORE,
    ET_DYN,
    ET_EXEC,
    EV_CURRENT,
    SELFMAG,
};

use scroll::{
    Pread,
    Pwrite,
    SizeWith,
};

use crate::elf::{
    bytes,
    Arch,
    EHDR_SIZE,
    PHDR_SIZE,
    SHDR_SIZE,
};

const EI_OSABI: usize = 7;
const ELFOSABI_NONE: u8 = 0;

/// The type of an ELF file as stored in `e_type`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfType {
    Exec,
    Dyn,
    Core,
    Other(u16),
}

impl From<u16> for ElfType {
    fn from(value: u16) -> Self {
        match value {
            ET_EXEC => ElfType::Exec,
            ET_DYN => ElfType::Dyn,
            ET_CORE => ElfType::Core,
            other => ElfType::Other(other),
        }
    }
}

impl From<ElfType> for u16 {
    fn from(value: ElfType) -> Self {
        match value {
            ElfType::Exec => ET_EXEC,
            ElfType::Dyn => ET_DYN,
            ElfType::Core => ET_CORE,
            ElfType::Other(other) => other,
        }
    }
}

/// A 64-bit ELF file header. Parsing does not validate anything, that is the loader's job.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct ElfHeader {
    pub ident: [u8; 16],
    pub e_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

impl ElfHeader {
    /// Decode the first [`EHDR_SIZE`] bytes of `bytes`. Returns `None` if there are not enough bytes.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        bytes::decode(bytes)
    }

    /// The header of a core file for `arch` with `phnum` program headers directly following it.
    /// Extended numbering is the caller's business.
    pub fn core(arch: &Arch, phnum: u16) -> Self {
        let mut ident = [0u8; 16];
        ident[..SELFMAG].copy_from_slice(ELFMAG);
        ident[EI_CLASS] = ELFCLASS64;
        ident[EI_DATA] = ELFDATA2LSB;
        ident[EI_VERSION] = EV_CURRENT;
        ident[EI_OSABI] = ELFOSABI_NONE;

        Self {
            ident,
            e_type: ET_CORE,
            machine: arch.machine(),
            version: EV_CURRENT as u32,
            entry: 0,
            phoff: EHDR_SIZE as u64,
            shoff: 0,
            flags: arch.core_flags(),
            ehsize: EHDR_SIZE as u16,
            phentsize: PHDR_SIZE as u16,
            phnum,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        }
    }

    /// Make the header point to a single section header at `shoff`
    pub fn set_extended_numbering(&mut self, shoff: u64) {
        self.shoff = shoff;
        self.shentsize = SHDR_SIZE as u16;
        self.shnum = 1;
        self.shstrndx = 0;
    }

    pub fn has_magic(&self) -> bool {
        &self.ident[..SELFMAG] == ELFMAG
    }

    pub fn class(&self) -> u8 {
        self.ident[EI_CLASS]
    }

    pub fn data(&self) -> u8 {
        self.ident[EI_DATA]
    }

    pub fn elf_type(&self) -> ElfType {
        ElfType::from(self.e_type)
    }

    /// Whether the header describes a 64-bit little-endian binary for `arch`
    pub fn matches_arch(&self, arch: &Arch) -> bool {
        self.class() == ELFCLASS64 && self.data() == ELFDATA2LSB && self.machine == arch.machine()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytes::encode(*self)
    }
}
