use crate::{
    elf::{
        Arch,
        ProgramHeader,
    },
    kernel::{
        AddressSpace,
        ExecFile,
        MapError,
        MapFlags,
    },
};

/// Map the file content of a single LOAD segment.
///
/// A non-zero `total_size` reserves the span of the whole image with the first mapping so that
/// later segments cannot collide with other mappings. Everything beyond the segment itself is unmapped again.
/// Segments without file content are not mapped at all and the requested address is returned.
pub(crate) fn elf_map(mm: &mut dyn AddressSpace, file: &dyn ExecFile, arch: &Arch, addr: u64, phdr: &ProgramHeader, flags: MapFlags, total_size: u64) -> Result<u64, MapError> {
    let page_offset = arch.page_offset(phdr.p_vaddr);
    let addr = arch.page_start(addr);
    let invalid = MapError::InvalidRange {
        addr,
        len: phdr.p_filesz,
    };
    let size = match phdr.p_filesz.checked_add(page_offset) {
        Some(size) if size <= arch.task_size() => arch.page_align(size),
        _ => return Err(invalid),
    };
    let off = phdr.p_offset.checked_sub(page_offset).ok_or(invalid)?;

    if size == 0 {
        return Ok(addr);
    }

    if total_size != 0 {
        if total_size > arch.task_size() {
            return Err(MapError::InvalidRange {
                addr,
                len: total_size,
            });
        }

        let total_size = arch.page_align(total_size).max(size);
        let map_addr = mm.map_file_region(file, addr, total_size, phdr.perms(), flags, off)?;

        if total_size > size {
            mm.unmap_region(map_addr + size, total_size - size)?;
        }

        Ok(map_addr)
    } else {
        mm.map_file_region(file, addr, size, phdr.perms(), flags, off)
    }
}

/// Establish the heap between `start` and `end` and return the new break
pub(crate) fn set_brk(mm: &mut dyn AddressSpace, arch: &Arch, start: u64, end: u64) -> Result<u64, MapError> {
    let start = arch.page_align(start);
    let end = arch.page_align(end);

    if end > start {
        mm.extend_break(start, end - start)?;
    }

    Ok(end)
}

/// Zero the rest of the page that `elf_bss` points into.
/// That part of the page was mapped from the file and contains whatever follows the segment there.
pub(crate) fn padzero(mm: &mut dyn AddressSpace, arch: &Arch, elf_bss: u64) -> Result<(), MapError> {
    let nbyte = arch.page_offset(elf_bss);

    if nbyte != 0 {
        mm.clear_user(elf_bss, arch.page_size() - nbyte)?;
    }

    Ok(())
}
