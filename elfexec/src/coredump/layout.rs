use crate::{
    coredump::process::MemoryRegion,
    elf::{
        bytes,
        round_up,
        Arch,
        ElfHeader,
        ProgramHeader,
        SectionHeader,
        EHDR_SIZE,
        PHDR_SIZE,
        PN_XNUM,
        SHDR_SIZE,
    },
};

/// Where a region's content ends up in the core file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    pub start: u64,
    pub end: u64,
    /// Number of bytes from `start` that are stored in the file
    pub dump_size: u64,
    pub offset: u64,
}

/// The complete structure of a core file, computed before anything is written.
///
/// The file consists of the ELF header, the NOTE program header, one LOAD program
/// header per region, the notes, padding up to the next page and the region contents.
/// When extended numbering is needed a single section header follows the contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreDumpLayout {
    pub header: ElfHeader,
    pub note: ProgramHeader,
    pub loads: Vec<ProgramHeader>,
    pub extnum: Option<SectionHeader>,
    pub regions: Vec<RegionLayout>,
    /// Offset of the first note
    pub notes_offset: u64,
    /// Offset of the first region content, page aligned
    pub data_offset: u64,
    /// Offset of the extended numbering section header, or the end of the region contents
    pub shoff: u64,
}

impl CoreDumpLayout {
    /// Lay out a dump of `regions` where `dump_sizes[i]` bytes of `regions[i]` are stored
    pub fn new(arch: &Arch, machine: u16, flags: u32, regions: &[MemoryRegion], dump_sizes: &[u64], notes_size: u64) -> Self {
        debug_assert_eq!(regions.len(), dump_sizes.len());

        let page_size = arch.page_size();
        let segs = regions.len() as u64 + 1;
        let e_phnum = segs.min(PN_XNUM as u64) as u16;

        let notes_offset = (EHDR_SIZE as u64) + segs * PHDR_SIZE as u64;
        let data_offset = round_up(notes_offset + notes_size, page_size);

        let mut header = ElfHeader::core(arch, e_phnum);
        header.machine = machine;
        header.flags = flags;

        let note = ProgramHeader::note(notes_offset, notes_size);

        let mut offset = data_offset;
        let mut loads = Vec::with_capacity(regions.len());
        let mut layouts = Vec::with_capacity(regions.len());

        for (region, dump_size) in regions.iter().zip(dump_sizes) {
            loads.push(ProgramHeader::core_load(offset, region.start, *dump_size, region.len(), region.flags.perms(), page_size));
            layouts.push(RegionLayout {
                start: region.start,
                end: region.end,
                dump_size: *dump_size,
                offset,
            });
            offset += dump_size;
        }

        let shoff = offset;
        let extnum = if e_phnum == PN_XNUM {
            header.set_extended_numbering(shoff);
            Some(SectionHeader::extended_numbering(segs as u32))
        } else {
            None
        };

        Self {
            header,
            note,
            loads,
            extnum,
            regions: layouts,
            notes_offset,
            data_offset,
            shoff,
        }
    }

    /// Number of program headers including the NOTE header
    pub fn segments(&self) -> usize {
        self.loads.len() + 1
    }

    /// ELF header and all program headers
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.notes_offset as usize);
        bytes::append(&mut out, self.header);
        bytes::append(&mut out, self.note);

        for load in &self.loads {
            bytes::append(&mut out, *load);
        }

        debug_assert_eq!(out.len() as u64, self.notes_offset);
        out
    }

    /// The size of the complete file
    pub fn total_size(&self) -> u64 {
        match self.extnum {
            Some(_) => self.shoff + SHDR_SIZE as u64,
            None => self.shoff,
        }
    }
}
