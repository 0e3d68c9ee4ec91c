use bitflags::bitflags;

use crate::coredump::process::{
    MemoryRegion,
    ProcessView,
    VmFlags,
};

bitflags! {
    /// Which kinds of mappings are written to a core dump, like `/proc/<pid>/coredump_filter`
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct DumpFilter: u32 {
        const ANON_PRIVATE = 1 << 0;
        const ANON_SHARED = 1 << 1;
        const MAPPED_PRIVATE = 1 << 2;
        const MAPPED_SHARED = 1 << 3;
        /// The first page of file mappings that start with an ELF header
        const ELF_HEADERS = 1 << 4;
        const HUGETLB_PRIVATE = 1 << 5;
        const HUGETLB_SHARED = 1 << 6;
    }
}

impl Default for DumpFilter {
    fn default() -> Self {
        DumpFilter::ANON_PRIVATE | DumpFilter::ANON_SHARED | DumpFilter::ELF_HEADERS | DumpFilter::HUGETLB_PRIVATE
    }
}

/// Decides how many bytes of every region go into the dump
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DumpPolicy {
    pub filter: DumpFilter,
    /// Dump shared mappings completely regardless of the filter
    pub dump_whole_shared: bool,
}

impl DumpPolicy {
    pub fn new(filter: DumpFilter, dump_whole_shared: bool) -> Self {
        Self {
            filter,
            dump_whole_shared,
        }
    }

    /// The number of bytes of `region` that are written, starting at its first byte.
    /// Regions that are omitted still get a LOAD header with a file size of 0.
    pub fn dump_size(&self, region: &MemoryRegion, process: &dyn ProcessView, page_size: u64) -> u64 {
        let whole = region.len();

        if region.is_special() {
            return whole;
        }

        if region.flags.contains(VmFlags::DONTDUMP) {
            return 0;
        }

        if region.flags.contains(VmFlags::HUGETLB) {
            let bit = if region.is_shared() { DumpFilter::HUGETLB_SHARED } else { DumpFilter::HUGETLB_PRIVATE };
            return if self.filter.contains(bit) { whole } else { 0 };
        }

        if region.flags.contains(VmFlags::IO) {
            return 0;
        }

        if region.is_shared() {
            if self.dump_whole_shared {
                return whole;
            }

            let bit = if region.file.is_none() { DumpFilter::ANON_SHARED } else { DumpFilter::MAPPED_SHARED };
            return if self.filter.contains(bit) { whole } else { 0 };
        }

        if region.anonymous_pages && self.filter.contains(DumpFilter::ANON_PRIVATE) {
            return whole;
        }

        if region.file.is_none() {
            return 0;
        }

        if self.filter.contains(DumpFilter::MAPPED_PRIVATE) {
            return whole;
        }

        if self.filter.contains(DumpFilter::ELF_HEADERS) && region.pgoff == 0 && region.flags.contains(VmFlags::READ) && starts_with_elf_magic(region, process) {
            return page_size.min(whole);
        }

        0
    }
}

fn starts_with_elf_magic(region: &MemoryRegion, process: &dyn ProcessView) -> bool {
    let mut magic = [0u8; 4];

    match process.read_memory(region.start, &mut magic) {
        Ok(()) => magic == *goblin::elf::header::ELFMAG,
        Err(_) => false,
    }
}
