use std::time::Duration;

use scroll::{
    Pwrite,
    SizeWith,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pwrite, SizeWith)]
#[repr(C)]
pub struct Timeval {
    pub tv_sec: u64,
    pub tv_usec: u64,
}

impl From<Duration> for Timeval {
    fn from(time: Duration) -> Self {
        Self {
            tv_sec: time.as_secs(),
            tv_usec: time.subsec_micros() as u64,
        }
    }
}

/// `Elf64_Nhdr`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pwrite, SizeWith)]
#[repr(C)]
pub struct NoteHeader {
    pub n_namesz: u32,
    pub n_descsz: u32,
    pub n_type: u32,
}

/// `elf_prstatus` up to `pr_reg`. The register set and `pr_fpvalid` depend on the architecture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pwrite, SizeWith)]
#[repr(C)]
pub struct PrStatusHead {
    pub si_signo: i32,
    pub si_code: i32,
    pub si_errno: i32,
    pub pr_cursig: i16,
    pub pad0: u16,
    pub pr_sigpend: u64,
    pub pr_sighold: u64,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_utime: Timeval,
    pub pr_stime: Timeval,
    pub pr_cutime: Timeval,
    pub pr_cstime: Timeval,
}

/// `elf_prpsinfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pwrite, SizeWith)]
#[repr(C)]
pub struct PrPsInfo {
    pub pr_state: u8,
    pub pr_sname: u8,
    pub pr_zomb: u8,
    pub pr_nice: u8,
    pub pad0: u32,
    pub pr_flag: u64,
    pub pr_uid: u32,
    pub pr_gid: u32,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_fname: [u8; 16],
    pub pr_psargs: [u8; 80],
}

/// The part of `siginfo_t` that memory faults fill in, padded to the full 128 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pwrite, SizeWith)]
#[repr(C)]
pub struct RawSigInfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    pub pad0: u32,
    pub si_addr: u64,
    pub pad1: [u8; 104],
}

/// Leading counts of the NT_FILE payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pwrite, SizeWith)]
#[repr(C)]
pub struct FileNoteHead {
    pub count: u64,
    pub page_size: u64,
}

/// One mapped file range of the NT_FILE payload. `pgoff` counts pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pwrite, SizeWith)]
#[repr(C)]
pub struct FileNoteEntry {
    pub start: u64,
    pub end: u64,
    pub pgoff: u64,
}
