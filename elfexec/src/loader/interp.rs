use std::path::PathBuf;

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
    },
    kernel::{
        AddressSpace,
        ExecFile,
        MapFlags,
    },
    loader::{
        mapper::{
            elf_map,
            padzero,
        },
        validate::{
            check_load_segments,
            check_phdr_table,
            read_exact_at,
            read_program_headers,
            BINPRM_BUF_SIZE,
            MAX_PHDR_TABLE,
        },
        ValidatedElf,
    },
    Logger,
};

const PATH_MAX: u64 = 4096;

/// Read the path in a PT_INTERP segment
pub(crate) fn read_interp_path(file: &dyn ExecFile, phdr: &ProgramHeader) -> Result<PathBuf, LoaderError> {
    if phdr.p_filesz > PATH_MAX || phdr.p_filesz < 2 {
        return Err(LoaderError::Malformed(format!("Invalid interpreter path length {}", phdr.p_filesz)));
    }

    let mut path = read_exact_at(file, phdr.p_offset, phdr.p_filesz as usize)?;

    if path.pop() != Some(0) {
        return Err(LoaderError::Malformed("Interpreter path is not NUL terminated".to_string()));
    }

    /* Everything after an embedded NUL is ignored */
    if let Some(nul) = path.iter().position(|b| *b == 0) {
        path.truncate(nul);
    }

    if path.is_empty() {
        return Err(LoaderError::Malformed("Empty interpreter path".to_string()));
    }

    Ok(PathBuf::from(String::from_utf8_lossy(&path).into_owned()))
}

/// Read the header of an interpreter and check that it is an ELF file for this machine
pub(crate) fn read_interp_header(file: &dyn ExecFile, arch: &Arch) -> Result<ElfHeader, LoaderError> {
    let buf = read_exact_at(file, 0, BINPRM_BUF_SIZE)?;
    let header = ElfHeader::parse(&buf).ok_or_else(|| LoaderError::BadInterpreter("Header too short".to_string()))?;

    if !header.has_magic() {
        return Err(LoaderError::BadInterpreter(format!("{} is not an ELF file", file.path().display())));
    }

    if !header.matches_arch(arch) {
        return Err(LoaderError::BadInterpreter(format!("{} is for machine {}", file.path().display(), header.machine)));
    }

    Ok(header)
}

/// Where an interpreter ended up
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InterpLoad {
    /// The relocation bias. Added to the interpreter's entry point and passed as `AT_BASE`.
    pub load_addr: u64,
    /// Address of the first mapping that was created for it
    pub map_addr: u64,
}

/// Check the remaining header fields of an interpreter and read its program headers.
/// The program header table of an interpreter has to fit into a single page.
fn validate_interp(file: &dyn ExecFile, header: ElfHeader, arch: &Arch) -> Result<ValidatedElf, LoaderError> {
    if header.e_type != ET_EXEC && header.e_type != ET_DYN {
        return Err(LoaderError::BadInterpreter(format!("Interpreter of type {} is not executable", header.e_type)));
    }

    check_phdr_table(&header, (arch.page_size() as usize).min(MAX_PHDR_TABLE))?;

    let phdrs = read_program_headers(file, &header)?;
    check_load_segments(&phdrs, arch)?;

    Ok(ValidatedElf {
        header,
        phdrs,
    })
}

/// Map an interpreter. DYN interpreters with `no_base` set are placed wherever the address space has room.
///
/// Unlike the main executable a failure to zero the partial BSS page is an error here.
pub(crate) fn load_elf_interp(mm: &mut dyn AddressSpace, file: &dyn ExecFile, header: ElfHeader, arch: &Arch, no_base: bool, logger: &Logger) -> Result<InterpLoad, LoaderError> {
    let interp = validate_interp(file, header, arch)?;

    let mut total_size = total_mapping_size(arch, &interp.phdrs).ok_or_else(|| LoaderError::AddressError("Interpreter does not fit into the address space".to_string()))?;

    if total_size == 0 {
        return Err(LoaderError::InvalidArgument("Interpreter has nothing to load".to_string()));
    }

    let mut load_addr = 0u64;
    let mut load_addr_set = false;
    let mut map_addr_first = None;
    let mut elf_bss = 0u64;
    let mut last_bss = 0u64;

    for phdr in interp.loads() {
        let vaddr = phdr.p_vaddr;
        let mut flags = MapFlags::PRIVATE | MapFlags::DENYWRITE;

        if !interp.is_dyn() || load_addr_set {
            flags |= MapFlags::FIXED;
        } else if no_base {
            load_addr = 0u64.wrapping_sub(vaddr);
        }

        let map_addr = elf_map(mm, file, arch, load_addr.wrapping_add(vaddr), phdr, flags, total_size)?;
        total_size = 0;
        map_addr_first.get_or_insert(map_addr);

        if arch.is_bad_addr(map_addr) {
            return Err(LoaderError::AddressError(format!("Interpreter mapped at {:#x}", map_addr)));
        }

        if !load_addr_set && interp.is_dyn() {
            load_addr = map_addr.wrapping_sub(arch.page_start(vaddr));
            load_addr_set = true;
        }

        let k = load_addr.wrapping_add(vaddr);

        if !phdr.fits_below_task_size(arch, k) {
            return Err(LoaderError::OutOfMemory(format!("Interpreter segment at {:#x} does not fit", k)));
        }

        logger.debug(format!("Mapped interpreter segment {:#x}..{:#x}", k, k + phdr.p_memsz));

        elf_bss = elf_bss.max(k + phdr.p_filesz);
        last_bss = last_bss.max(k + phdr.p_memsz);
    }

    if last_bss > elf_bss {
        padzero(mm, arch, elf_bss)?;

        let elf_bss = arch.page_align(elf_bss);

        if last_bss > elf_bss {
            mm.extend_break(elf_bss, arch.page_align(last_bss - elf_bss))?;
        }
    }

    Ok(InterpLoad {
        load_addr,
        map_addr: map_addr_first.unwrap_or(load_addr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemFile;

    fn interp_phdr(filesz: u64) -> ProgramHeader {
        ProgramHeader {
            p_type: goblin::elf::program_header::PT_INTERP,
            p_offset: 0,
            p_filesz: filesz,
            ..Default::default()
        }
    }

    #[test]
    fn interp_path() {
        let file = MemFile::new("/bin/a", b"/lib/ld.so\0");
        assert_eq!(read_interp_path(&file, &interp_phdr(11)).unwrap(), PathBuf::from("/lib/ld.so"));
        assert!(matches!(read_interp_path(&file, &interp_phdr(10)), Err(LoaderError::Malformed(_))));
        assert!(matches!(read_interp_path(&file, &interp_phdr(1)), Err(LoaderError::Malformed(_))));
        assert!(matches!(read_interp_path(&file, &interp_phdr(PATH_MAX + 1)), Err(LoaderError::Malformed(_))));
        assert!(matches!(read_interp_path(&file, &interp_phdr(12)), Err(LoaderError::IOError(_))));

        let file = MemFile::new("/bin/a", b"\0\0");
        assert!(matches!(read_interp_path(&file, &interp_phdr(2)), Err(LoaderError::Malformed(_))));
    }

    #[test]
    fn interp_header() {
        let arch = Arch::riscv64();
        let mut bytes = ElfHeader::core(&arch, 1).to_bytes();
        bytes.resize(BINPRM_BUF_SIZE, 0);

        let header = read_interp_header(&MemFile::new("/lib/ld.so", &bytes), &arch).unwrap();
        assert!(matches!(validate_interp(&MemFile::new("/lib/ld.so", &bytes), header, &arch), Err(LoaderError::BadInterpreter(_))));

        assert!(matches!(read_interp_header(&MemFile::new("/lib/ld.so", &bytes), &Arch::x86_64()), Err(LoaderError::BadInterpreter(_))));
        assert!(matches!(read_interp_header(&MemFile::new("/lib/ld.so", &bytes[..100]), &arch), Err(LoaderError::IOError(_))));

        bytes[0] = b'#';
        assert!(matches!(read_interp_header(&MemFile::new("/lib/ld.so", &bytes), &arch), Err(LoaderError::BadInterpreter(_))));
    }

    #[test]
    fn interp_table_and_segments() {
        let arch = Arch::riscv64();
        let mut header = ElfHeader::core(&arch, 74);
        header.e_type = ET_DYN;
        assert!(matches!(validate_interp(&MemFile::new("/lib/ld.so", &[]), header, &arch), Err(LoaderError::Malformed(_))));

        header.phnum = 1;
        let mut bytes = header.to_bytes();
        bytes.extend(
            ProgramHeader {
                p_type: goblin::elf::program_header::PT_LOAD,
                p_vaddr: 0x1000,
                p_filesz: 0x20,
                p_memsz: 0x10,
                ..Default::default()
            }
            .to_bytes(),
        );
        assert!(matches!(validate_interp(&MemFile::new("/lib/ld.so", &bytes), header, &arch), Err(LoaderError::Malformed(_))));
    }
}
