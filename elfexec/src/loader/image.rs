use std::path::PathBuf;

use crate::{
    elf::{
        Arch,
        LoaderError,
        ProgramHeader,
        SegmentType,
        Signal,
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
            set_brk,
        },
        AuxVector,
        StackLayout,
        ValidatedElf,
    },
    Logger,
};

/// Whether the program asked for an executable stack via `PT_GNU_STACK`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ExecStack {
    /// No `PT_GNU_STACK` header, the architecture default applies
    #[default]
    Default,
    Enabled,
    Disabled,
}

impl ExecStack {
    pub fn from_program_headers(phdrs: &[ProgramHeader]) -> Self {
        match phdrs.iter().find(|phdr| phdr.segment_type() == SegmentType::GnuStack) {
            Some(phdr) if phdr.is_executable() => ExecStack::Enabled,
            Some(_) => ExecStack::Disabled,
            None => ExecStack::Default,
        }
    }
}

/// The layout of a freshly loaded process
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessImage {
    /// Difference between the link-time and the runtime addresses of the executable
    pub load_bias: u64,
    /// Address where the start of the file would be in memory. Used for `AT_PHDR`.
    pub load_addr: u64,
    /// Where execution starts. This is inside the interpreter if there is one.
    pub entry: u64,
    /// The entry point of the executable itself
    pub exec_entry: u64,
    pub interpreter: Option<PathBuf>,
    /// Load bias of the interpreter or 0
    pub interp_load_addr: u64,
    pub start_code: u64,
    pub end_code: u64,
    pub start_data: u64,
    pub end_data: u64,
    /// End of the file-backed part of the last segment
    pub elf_bss: u64,
    /// End of the memory image of the last segment
    pub elf_brk: u64,
    pub start_brk: u64,
    pub brk: u64,
    pub start_stack: u64,
    pub arg_start: u64,
    pub arg_end: u64,
    pub env_start: u64,
    pub env_end: u64,
    pub exec_stack: ExecStack,
    pub stack: StackLayout,
    /// A copy of the auxiliary vector for core dumps
    pub saved_auxv: AuxVector,
}

/// Best-effort zeroing of a partial BSS page. Odd segment protections can make this fail.
fn clear_partial_page(mm: &mut dyn AddressSpace, arch: &Arch, elf_bss: u64, limit: u64, logger: &Logger) {
    let nbyte = arch.page_offset(elf_bss);

    if nbyte == 0 {
        return;
    }

    let nbyte = (arch.page_size() - nbyte).min(limit);

    if let Err(err) = mm.clear_user(elf_bss, nbyte) {
        logger.warning(format!("Could not clear bss at {:#x}: {}", elf_bss, err));
    }
}

/// Map all LOAD segments of the main executable and compute the image bounds.
///
/// This runs after the point of no return, so every failure carries the signal that kills the process.
pub(crate) fn map_main_image(mm: &mut dyn AddressSpace, file: &dyn ExecFile, elf: &ValidatedElf, arch: &Arch, randomize: bool, logger: &Logger) -> Result<ProcessImage, LoaderError> {
    let mut load_addr = 0u64;
    let mut load_bias = 0u64;
    let mut load_addr_set = false;
    let mut elf_bss = 0u64;
    let mut elf_brk = 0u64;
    let mut start_code = u64::MAX;
    let mut end_code = 0u64;
    let mut start_data = 0u64;
    let mut end_data = 0u64;

    let total_size = crate::elf::total_mapping_size(arch, &elf.phdrs).ok_or_else(|| LoaderError::AddressError("Image does not fit into the address space".to_string()).terminate(Signal::Kill))?;
    let mut first = true;

    for phdr in elf.loads() {
        if elf_brk > elf_bss {
            /* A previous segment had bss. Map it before the next segment goes in. */
            set_brk(mm, arch, elf_bss.wrapping_add(load_bias), elf_brk.wrapping_add(load_bias)).map_err(|err| LoaderError::from(err).terminate(Signal::Kill))?;
            clear_partial_page(mm, arch, elf_bss.wrapping_add(load_bias), elf_brk - elf_bss, logger);
        }

        let vaddr = phdr.p_vaddr;
        let mut flags = MapFlags::PRIVATE | MapFlags::DENYWRITE;

        if !elf.is_dyn() || load_addr_set {
            flags |= MapFlags::FIXED;
        } else if randomize {
            load_bias = 0;
        } else {
            load_bias = arch.page_start(arch.et_dyn_base().wrapping_sub(vaddr));
        }

        let map_addr = elf_map(mm, file, arch, load_bias.wrapping_add(vaddr), phdr, flags, if first { total_size } else { 0 }).map_err(|err| LoaderError::from(err).terminate(Signal::Kill))?;
        first = false;

        if arch.is_bad_addr(map_addr) {
            return Err(LoaderError::AddressError(format!("Segment mapped at {:#x}", map_addr)).terminate(Signal::Kill));
        }

        if !load_addr_set {
            load_addr_set = true;
            load_addr = phdr.p_vaddr.wrapping_sub(phdr.p_offset);

            if elf.is_dyn() {
                load_bias = load_bias.wrapping_add(map_addr.wrapping_sub(arch.page_start(load_bias.wrapping_add(vaddr))));
                load_addr = load_addr.wrapping_add(load_bias);
            }
        }

        let k = phdr.p_vaddr;

        if !phdr.fits_below_task_size(arch, k) {
            return Err(LoaderError::InvalidArgument(format!("Segment at {:#x} with size {:#x} does not fit", k, phdr.p_memsz)).terminate(Signal::Kill));
        }

        logger.debug(format!("Mapped segment {:#x}..{:#x} at bias {:#x}", k, k + phdr.p_memsz, load_bias));

        start_code = start_code.min(k);
        start_data = start_data.max(k);

        let k = phdr.p_vaddr + phdr.p_filesz;
        elf_bss = elf_bss.max(k);

        if phdr.is_executable() {
            end_code = end_code.max(k);
        }

        end_data = end_data.max(k);
        elf_brk = elf_brk.max(phdr.p_vaddr + phdr.p_memsz);
    }

    if !load_addr_set {
        return Err(LoaderError::Malformed("No loadable segments".to_string()).terminate(Signal::Kill));
    }

    Ok(ProcessImage {
        load_bias,
        load_addr,
        entry: elf.header.entry.wrapping_add(load_bias),
        exec_entry: elf.header.entry.wrapping_add(load_bias),
        start_code: start_code.wrapping_add(load_bias),
        end_code: end_code.wrapping_add(load_bias),
        start_data: start_data.wrapping_add(load_bias),
        end_data: end_data.wrapping_add(load_bias),
        elf_bss: elf_bss.wrapping_add(load_bias),
        elf_brk: elf_brk.wrapping_add(load_bias),
        exec_stack: ExecStack::from_program_headers(&elf.phdrs),
        ..Default::default()
    })
}

/// Create the heap and zero the rest of the last file-backed page.
/// This must happen before the interpreter is mapped so that it cannot take the place of the bss.
pub(crate) fn finalize_break(mm: &mut dyn AddressSpace, arch: &Arch, image: &mut ProcessImage, logger: &Logger) -> Result<(), LoaderError> {
    let brk = set_brk(mm, arch, image.elf_bss, image.elf_brk).map_err(|err| LoaderError::from(err).terminate(Signal::Kill))?;
    image.start_brk = brk;
    image.brk = brk;

    if image.elf_bss != image.elf_brk {
        if let Err(err) = padzero(mm, arch, image.elf_bss) {
            logger.warning(format!("Could not clear bss at {:#x}: {}", image.elf_bss, err));
        }
    }

    logger.debug(format!("Break starts at {:#x}", brk));
    Ok(())
}
