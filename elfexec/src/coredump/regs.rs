use goblin::elf::header::{
    EM_RISCV,
    EM_X86_64,
};

use crate::{
    coredump::{
        note::{
            MemElfNote,
            NOTE_NAME_CORE,
            NOTE_NAME_LINUX,
            NT_PRFPREG,
            NT_PRSTATUS,
            NT_PRXFPREG,
        },
        process::ProcessView,
        DumpError,
    },
    elf::Arch,
};

/// One group of registers that can be read from a thread
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Regset {
    /// Note type of the group in a core dump. 0 means the group is never dumped.
    pub note_type: u32,
    /// Size of the group in bytes
    pub size: usize,
}

/// Describes the register file as a list of groups. The first group must be the general purpose registers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenericRegisterView {
    pub machine: u16,
    pub flags: u32,
    pub regsets: Vec<Regset>,
}

/// General purpose registers plus optional FP and extended FP registers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedRegisterPair {
    pub machine: u16,
    pub flags: u32,
    pub gp_size: usize,
    pub fp_size: Option<usize>,
    /// Size of the extended FP state, dumped as `NT_PRXFPREG`
    pub xfp_size: Option<usize>,
}

/// How the dumper obtains the registers of a thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterView {
    Generic(GenericRegisterView),
    FixedPair(FixedRegisterPair),
}

/// The register notes of one thread. `fpvalid` goes into the PRSTATUS note.
pub(crate) struct ThreadRegisters {
    pub(crate) gp: Vec<u8>,
    pub(crate) fpvalid: bool,
    pub(crate) extra: Vec<MemElfNote>,
}

/// Bring register content to exactly `size` bytes
fn fit(mut data: Vec<u8>, size: usize) -> Vec<u8> {
    data.resize(size, 0);
    data
}

impl RegisterView {
    /// The usual view for `arch`: riscv64 exports a generic list, x86_64 the fixed pair with FXSAVE state
    pub fn for_arch(arch: &Arch) -> Self {
        match arch.machine() {
            EM_X86_64 => RegisterView::FixedPair(FixedRegisterPair {
                machine: EM_X86_64,
                flags: arch.core_flags(),
                gp_size: 27 * 8,
                fp_size: Some(512),
                xfp_size: None,
            }),
            machine => RegisterView::Generic(GenericRegisterView {
                machine,
                flags: arch.core_flags(),
                regsets: vec![
                    Regset {
                        note_type: NT_PRSTATUS,
                        size: 32 * 8,
                    },
                    Regset {
                        note_type: if machine == EM_RISCV { NT_PRFPREG } else { 0 },
                        size: 33 * 8,
                    },
                ],
            }),
        }
    }

    pub fn machine(&self) -> u16 {
        match self {
            RegisterView::Generic(view) => view.machine,
            RegisterView::FixedPair(view) => view.machine,
        }
    }

    pub fn flags(&self) -> u32 {
        match self {
            RegisterView::Generic(view) => view.flags,
            RegisterView::FixedPair(view) => view.flags,
        }
    }

    /// Size of `pr_reg` in the PRSTATUS note
    pub fn gp_size(&self) -> usize {
        match self {
            RegisterView::Generic(view) => view.regsets.first().map(|regset| regset.size).unwrap_or(0),
            RegisterView::FixedPair(view) => view.gp_size,
        }
    }

    pub(crate) fn check(&self) -> Result<(), DumpError> {
        match self {
            RegisterView::Generic(view) => match view.regsets.first() {
                Some(regset) if regset.note_type == NT_PRSTATUS => Ok(()),
                _ => Err(DumpError::MissingPrStatusRegset),
            },
            RegisterView::FixedPair(_) => Ok(()),
        }
    }

    /// Read all register groups of a thread that end up in the dump
    pub(crate) fn read_thread(&self, process: &dyn ProcessView, tid: u32) -> ThreadRegisters {
        let gp = fit(process.register_group(tid, NT_PRSTATUS).unwrap_or_default(), self.gp_size());
        let mut fpvalid = false;
        let mut extra = Vec::new();

        match self {
            RegisterView::Generic(view) => {
                for regset in view.regsets.iter().skip(1) {
                    if regset.note_type == 0 {
                        continue;
                    }

                    let Some(data) = process.register_group(tid, regset.note_type) else {
                        continue;
                    };
                    let data = fit(data, regset.size);

                    if regset.note_type == NT_PRFPREG {
                        fpvalid = true;
                        extra.push(MemElfNote::new(NOTE_NAME_CORE, NT_PRFPREG, data));
                    } else {
                        extra.push(MemElfNote::new(NOTE_NAME_LINUX, regset.note_type, data));
                    }
                }
            },
            RegisterView::FixedPair(view) => {
                if let Some(size) = view.fp_size {
                    if let Some(data) = process.register_group(tid, NT_PRFPREG) {
                        fpvalid = true;
                        extra.push(MemElfNote::new(NOTE_NAME_CORE, NT_PRFPREG, fit(data, size)));
                    }
                }

                if let Some(size) = view.xfp_size {
                    if let Some(data) = process.register_group(tid, NT_PRXFPREG) {
                        extra.push(MemElfNote::new(NOTE_NAME_LINUX, NT_PRXFPREG, fit(data, size)));
                    }
                }
            },
        }

        ThreadRegisters {
            gp,
            fpvalid,
            extra,
        }
    }
}
