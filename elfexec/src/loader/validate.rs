use goblin::elf::header::{
    ET_DYN,
    ET_EXEC,
};

use crate::{
    elf::{
        total_mapping_size,
        Arch,
        ElfHeader,
        LoaderError,
        ProgramHeader,
        EHDR_SIZE,
        PHDR_SIZE,
    },
    kernel::ExecFile,
    Logger,
};

/// How many bytes of a file are inspected before deciding whether it is an ELF file
pub const BINPRM_BUF_SIZE: usize = 128;

/// Upper bound on the program header table size. Keeps `phnum * phentsize` from overflowing.
pub(crate) const MAX_PHDR_TABLE: usize = 65536;

/// An ELF header that passed validation together with its program header table
#[derive(Clone, Debug)]
pub struct ValidatedElf {
    pub header: ElfHeader,
    pub phdrs: Vec<ProgramHeader>,
}

impl ValidatedElf {
    pub fn is_dyn(&self) -> bool {
        self.header.e_type == ET_DYN
    }

    pub fn loads(&self) -> impl Iterator<Item = &ProgramHeader> {
        self.phdrs.iter().filter(|phdr| phdr.is_load())
    }
}

/// Read exactly `len` bytes at `offset`. Anything less is an I/O error.
pub(crate) fn read_exact_at(file: &dyn ExecFile, offset: u64, len: usize) -> Result<Vec<u8>, LoaderError> {
    let mut buf = vec![0u8; len];
    let mut done = 0;

    if offset.checked_add(len as u64).is_none() {
        return Err(LoaderError::IOError(format!("Read of {} bytes at offset {:#x} is out of range", len, offset)));
    }

    while done < len {
        let count = file.read_at(offset + done as u64, &mut buf[done..]).map_err(|err| LoaderError::IOError(err.to_string()))?;

        if count == 0 {
            return Err(LoaderError::IOError(format!("Short read of {} at offset {:#x}: got {} of {} bytes", file.path().display(), offset, done, len)));
        }

        done += count;
    }

    Ok(buf)
}

/// Read the first [`BINPRM_BUF_SIZE`] bytes of `file` and decode the ELF header in them.
/// Files that are too short to hold a header are not ELF files.
pub(crate) fn read_header(file: &dyn ExecFile) -> Result<ElfHeader, LoaderError> {
    let mut buf = [0u8; BINPRM_BUF_SIZE];
    let mut done = 0;

    while done < BINPRM_BUF_SIZE {
        match file.read_at(done as u64, &mut buf[done..]).map_err(|err| LoaderError::IOError(err.to_string()))? {
            0 => break,
            count => done += count,
        }
    }

    if done < EHDR_SIZE {
        return Err(LoaderError::NotElf);
    }

    ElfHeader::parse(&buf[..done]).ok_or(LoaderError::NotElf)
}

/// Run the header checks in the order the kernel does. Each failing check has its own error.
pub fn check_header(header: &ElfHeader, arch: &Arch) -> Result<(), LoaderError> {
    if !header.has_magic() {
        return Err(LoaderError::NotElf);
    }

    if header.e_type != ET_EXEC && header.e_type != ET_DYN {
        return Err(LoaderError::NotExecutable(header.e_type));
    }

    if !header.matches_arch(arch) {
        return Err(LoaderError::WrongArchitecture {
            expected: arch.machine(),
            found: header.machine,
        });
    }

    check_phdr_table(header, MAX_PHDR_TABLE)
}

/// Check the entry size and count of the program header table. The table may occupy at most `max_size` bytes.
pub(crate) fn check_phdr_table(header: &ElfHeader, max_size: usize) -> Result<(), LoaderError> {
    if header.phentsize as usize != PHDR_SIZE {
        return Err(LoaderError::VersionMismatch(header.phentsize));
    }

    if header.phnum == 0 || header.phnum as usize * PHDR_SIZE > max_size {
        return Err(LoaderError::Malformed(format!("Invalid number of program headers: {}", header.phnum)));
    }

    Ok(())
}

/// Check the extent of every LOAD segment. Mapping relies on these bounds for its address arithmetic.
pub(crate) fn check_load_segments(phdrs: &[ProgramHeader], arch: &Arch) -> Result<(), LoaderError> {
    for phdr in phdrs.iter().filter(|phdr| phdr.is_load()) {
        if phdr.p_filesz > phdr.p_memsz {
            return Err(LoaderError::Malformed(format!("Segment at {:#x} has file size {:#x} above its memory size {:#x}", phdr.p_vaddr, phdr.p_filesz, phdr.p_memsz)));
        }

        if phdr.p_offset.checked_add(phdr.p_filesz).is_none() {
            return Err(LoaderError::Malformed(format!("Segment at {:#x} has file range {:#x}+{:#x}", phdr.p_vaddr, phdr.p_offset, phdr.p_filesz)));
        }

        match phdr.p_vaddr.checked_add(phdr.p_memsz) {
            Some(end) if end <= arch.task_size() => {},
            _ => return Err(LoaderError::AddressError(format!("Segment at {:#x} with size {:#x} exceeds the address space", phdr.p_vaddr, phdr.p_memsz))),
        }
    }

    if total_mapping_size(arch, phdrs).is_none() {
        return Err(LoaderError::Malformed("LOAD segments are not in ascending order".to_string()));
    }

    Ok(())
}

/// Read the complete program header table that `header` announces
pub(crate) fn read_program_headers(file: &dyn ExecFile, header: &ElfHeader) -> Result<Vec<ProgramHeader>, LoaderError> {
    let count = header.phnum as usize;
    let bytes = read_exact_at(file, header.phoff, count * PHDR_SIZE)?;
    ProgramHeader::parse_table(&bytes, count).ok_or_else(|| LoaderError::Malformed("Truncated program header table".to_string()))
}

/// Parse and check the main executable
pub fn validate(file: &dyn ExecFile, arch: &Arch, logger: &Logger) -> Result<ValidatedElf, LoaderError> {
    let header = read_header(file)?;
    check_header(&header, arch)?;

    let phdrs = read_program_headers(file, &header)?;
    check_load_segments(&phdrs, arch)?;
    logger.debug(format!("{}: type={} entry={:#x} phnum={}", file.path().display(), header.e_type, header.entry, header.phnum));

    Ok(ValidatedElf {
        header,
        phdrs,
    })
}
