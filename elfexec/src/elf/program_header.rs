use goblin::elf::program_header::{
    PF_R,
    PF_W,
    PF_X,
    PT_GNU_STACK,
    PT_INTERP,
    PT_LOAD,
    PT_NOTE,
};

use scroll::{
    Pread,
    Pwrite,
    SizeWith,
    LE,
};

use crate::elf::{
    bytes,
    Arch,
    Perms,
};

/// Segment types the loader and the dumper care about
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SegmentType {
    Load,
    Interp,
    Note,
    GnuStack,
    Other(u32),
}

impl From<u32> for SegmentType {
    fn from(value: u32) -> Self {
        match value {
            PT_LOAD => SegmentType::Load,
            PT_INTERP => SegmentType::Interp,
            PT_NOTE => SegmentType::Note,
            PT_GNU_STACK => SegmentType::GnuStack,
            other => SegmentType::Other(other),
        }
    }
}

impl From<SegmentType> for u32 {
    fn from(value: SegmentType) -> Self {
        match value {
            SegmentType::Load => PT_LOAD,
            SegmentType::Interp => PT_INTERP,
            SegmentType::Note => PT_NOTE,
            SegmentType::GnuStack => PT_GNU_STACK,
            SegmentType::Other(other) => other,
        }
    }
}

/// A 64-bit program header
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl ProgramHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        bytes::decode(bytes)
    }

    /// Decode a whole program header table. `None` if `bytes` holds fewer than `count` entries.
    pub fn parse_table(bytes: &[u8], count: usize) -> Option<Vec<Self>> {
        let mut offset = 0;
        (0..count).map(|_| bytes.gread_with::<Self>(&mut offset, LE).ok()).collect()
    }

    /// A NOTE header for `filesz` bytes of notes at `offset`
    pub fn note(offset: u64, filesz: u64) -> Self {
        Self {
            p_type: PT_NOTE,
            p_offset: offset,
            p_filesz: filesz,
            ..Default::default()
        }
    }

    /// A LOAD header as it appears in a core file
    pub fn core_load(offset: u64, vaddr: u64, filesz: u64, memsz: u64, perms: Perms, align: u64) -> Self {
        Self {
            p_type: PT_LOAD,
            p_flags: perms.to_segment_flags(),
            p_offset: offset,
            p_vaddr: vaddr,
            p_paddr: 0,
            p_filesz: filesz,
            p_memsz: memsz,
            p_align: align,
        }
    }

    pub fn segment_type(&self) -> SegmentType {
        SegmentType::from(self.p_type)
    }

    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    pub fn perms(&self) -> Perms {
        Perms::from_segment_flags(self.p_flags)
    }

    #[allow(missing_docs)]
    pub fn is_executable(&self) -> bool {
        (self.p_flags & PF_X) != 0
    }

    #[allow(missing_docs)]
    pub fn is_writable(&self) -> bool {
        (self.p_flags & PF_W) != 0
    }

    #[allow(missing_docs)]
    pub fn is_readable(&self) -> bool {
        (self.p_flags & PF_R) != 0
    }

    /// Check that a segment placed at `k` fits into the user address space of `arch`.
    /// The subtraction form keeps the check from overflowing.
    pub fn fits_below_task_size(&self, arch: &Arch, k: u64) -> bool {
        let task_size = arch.task_size();

        !(arch.is_bad_addr(k) || self.p_filesz > self.p_memsz || self.p_memsz > task_size || task_size - self.p_memsz < k)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytes::encode(*self)
    }
}

/// The span of memory all LOAD segments of an image occupy, starting at the page of the first one.
/// Returns 0 if there are no LOAD segments and `None` if the span does not fit into 64 bits.
pub fn total_mapping_size(arch: &Arch, phdrs: &[ProgramHeader]) -> Option<u64> {
    let mut loads = phdrs.iter().filter(|phdr| phdr.is_load());

    let Some(first) = loads.next() else {
        return Some(0);
    };
    let last = loads.last().unwrap_or(first);

    last.p_vaddr.checked_add(last.p_memsz)?.checked_sub(arch.page_start(first.p_vaddr))
}
