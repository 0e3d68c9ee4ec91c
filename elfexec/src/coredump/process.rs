use std::{
    path::PathBuf,
    time::Duration,
};

use bitflags::bitflags;
use rustc_hash::FxHashMap as HashMap;

use crate::{
    coredump::structs::RawSigInfo,
    elf::{
        bytes,
        Perms,
    },
    kernel::{
        AddressSpace,
        MapError,
        MappingKind,
        SimAddressSpace,
    },
    loader::AuxVector,
};

bitflags! {
    /// Properties of a memory region that influence what ends up in a core dump
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const SHARED = 1 << 3;
        /// Device memory. Never read by the dumper.
        const IO = 1 << 4;
        /// `MADV_DONTDUMP`
        const DONTDUMP = 1 << 5;
        const HUGETLB = 1 << 6;
    }
}

impl VmFlags {
    pub fn from_perms(perms: Perms) -> Self {
        let mut flags = VmFlags::empty();
        flags.set(VmFlags::READ, perms.is_readable());
        flags.set(VmFlags::WRITE, perms.is_writable());
        flags.set(VmFlags::EXEC, perms.is_executable());
        flags
    }

    pub fn perms(&self) -> Perms {
        let mut perms = Perms::default();

        if self.contains(VmFlags::READ) {
            perms.make_readable();
        }

        if self.contains(VmFlags::WRITE) {
            perms.make_writable();
        }

        if self.contains(VmFlags::EXEC) {
            perms.make_executable();
        }

        perms
    }
}

/// One mapping of the process that is dumped
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub flags: VmFlags,
    /// Offset into the backing file in pages
    pub pgoff: u64,
    pub file: Option<PathBuf>,
    /// Private pages were written to, so the region has content of its own
    pub anonymous_pages: bool,
    /// Kernel provided mappings like the vDSO. Always dumped.
    pub special: Option<String>,
}

impl MemoryRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(VmFlags::SHARED)
    }

    pub fn is_special(&self) -> bool {
        self.special.is_some()
    }
}

/// The scheduler state of a task as a bit mask, like `task_struct::state`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskState(pub u64);

impl TaskState {
    pub const RUNNING: TaskState = TaskState(0);
    pub const INTERRUPTIBLE: TaskState = TaskState(1);
    pub const UNINTERRUPTIBLE: TaskState = TaskState(2);
    pub const STOPPED: TaskState = TaskState(4);
    pub const TRACED: TaskState = TaskState(8);
    pub const ZOMBIE: TaskState = TaskState(16);

    /// Index of the lowest set bit plus one, or 0 when running
    pub fn number(&self) -> u8 {
        if self.0 == 0 {
            0
        } else {
            self.0.trailing_zeros() as u8 + 1
        }
    }

    pub fn letter(&self) -> u8 {
        match self.number() {
            n @ 0..=5 => b"RSDTZW"[n as usize],
            _ => b'.',
        }
    }
}

/// CPU time consumed by a task or by its reaped children
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: Duration,
    pub system: Duration,
}

/// What is known about the signal that caused the dump
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: i32,
    pub errno: i32,
    pub code: i32,
    /// Faulting address for memory errors
    pub addr: u64,
}

/// Size of `siginfo_t`
pub const SIGINFO_SIZE: usize = 128;

impl SigInfo {
    pub fn to_bytes(&self) -> Vec<u8> {
        bytes::encode(RawSigInfo {
            si_signo: self.signo,
            si_errno: self.errno,
            si_code: self.code,
            pad0: 0,
            si_addr: self.addr,
            pad1: [0; 104],
        })
    }
}

/// Process wide information for the PRPSINFO note
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub pgrp: u32,
    pub sid: u32,
    pub uid: u32,
    pub gid: u32,
    /// Command name, at most 16 bytes are kept
    pub comm: String,
    /// State of the thread group leader
    pub state: TaskState,
    pub nice: i8,
    pub flags: u64,
    pub arg_start: u64,
    pub arg_end: u64,
    /// Times of children that were waited for
    pub children: CpuTimes,
}

/// A thread that takes part in the dump
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: u32,
    /// Signals pending for this thread
    pub pending: u64,
    /// Signals blocked by this thread
    pub blocked: u64,
    /// For the thread group leader this is the total of the whole group
    pub times: CpuTimes,
}

/// The process that is being dumped.
///
/// The other threads are parked by the caller while the dump runs, so the view is stable.
pub trait ProcessView {
    fn info(&self) -> &ProcessInfo;

    /// All live threads. The order is the order in which the threads joined the dump.
    fn threads(&self) -> &[ThreadInfo];

    /// The thread that triggered the dump
    fn dumper(&self) -> u32;

    fn siginfo(&self) -> SigInfo;

    /// The auxiliary vector the process was started with
    fn saved_auxv(&self) -> &AuxVector;

    /// All mappings in ascending address order, including special mappings
    fn regions(&self) -> Vec<MemoryRegion>;

    /// Raw content of the register group with the given note type. `None` if the group is inactive.
    fn register_group(&self, tid: u32, note_type: u32) -> Option<Vec<u8>>;

    /// The content of the page at `addr`, or `None` if the page was never populated
    fn dump_page(&self, addr: u64) -> Option<&[u8]>;

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), MapError>;
}

/// A [`ProcessView`] over a [`SimAddressSpace`]
pub struct SimProcess<'a> {
    mm: &'a SimAddressSpace,
    info: ProcessInfo,
    threads: Vec<ThreadInfo>,
    dumper: u32,
    siginfo: SigInfo,
    auxv: AuxVector,
    registers: HashMap<(u32, u32), Vec<u8>>,
    dontdump: Vec<(u64, u64)>,
}

impl<'a> SimProcess<'a> {
    pub fn new(mm: &'a SimAddressSpace, info: ProcessInfo, auxv: AuxVector) -> Self {
        Self {
            mm,
            info,
            threads: Vec::new(),
            dumper: 0,
            siginfo: SigInfo::default(),
            auxv,
            registers: HashMap::default(),
            dontdump: Vec::new(),
        }
    }

    /// Add a thread. The first thread becomes the dumping thread unless [`set_dumper`](Self::set_dumper) says otherwise.
    pub fn add_thread(&mut self, thread: ThreadInfo) {
        if self.threads.is_empty() {
            self.dumper = thread.tid;
        }

        self.threads.push(thread);
    }

    pub fn set_dumper(&mut self, tid: u32) {
        self.dumper = tid;
    }

    pub fn set_siginfo(&mut self, siginfo: SigInfo) {
        self.siginfo = siginfo;
    }

    pub fn set_registers(&mut self, tid: u32, note_type: u32, content: Vec<u8>) {
        self.registers.insert((tid, note_type), content);
    }

    /// Exclude every mapping that overlaps `[start, end)` like `MADV_DONTDUMP` would
    pub fn dont_dump(&mut self, start: u64, end: u64) {
        self.dontdump.push((start, end));
    }
}

impl ProcessView for SimProcess<'_> {
    fn info(&self) -> &ProcessInfo {
        &self.info
    }

    fn threads(&self) -> &[ThreadInfo] {
        &self.threads
    }

    fn dumper(&self) -> u32 {
        self.dumper
    }

    fn siginfo(&self) -> SigInfo {
        self.siginfo
    }

    fn saved_auxv(&self) -> &AuxVector {
        &self.auxv
    }

    fn regions(&self) -> Vec<MemoryRegion> {
        let page_size = self.mm.arch().page_size();

        self.mm
            .mappings()
            .map(|mapping| {
                let mut flags = VmFlags::from_perms(mapping.perms);
                flags.set(VmFlags::SHARED, mapping.shared);

                if self.dontdump.iter().any(|(start, end)| *start < mapping.end && mapping.start < *end) {
                    flags |= VmFlags::DONTDUMP;
                }

                let (file, pgoff) = match &mapping.kind {
                    MappingKind::File {
                        path,
                        offset,
                    } => (Some(path.clone()), offset / page_size),
                    _ => (None, 0),
                };

                let special = match &mapping.kind {
                    MappingKind::Special(name) => Some(name.clone()),
                    _ => None,
                };

                MemoryRegion {
                    start: mapping.start,
                    end: mapping.end,
                    flags,
                    pgoff,
                    file,
                    anonymous_pages: mapping.written,
                    special,
                }
            })
            .collect()
    }

    fn register_group(&self, tid: u32, note_type: u32) -> Option<Vec<u8>> {
        self.registers.get(&(tid, note_type)).cloned()
    }

    fn dump_page(&self, addr: u64) -> Option<&[u8]> {
        self.mm.page(addr)
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), MapError> {
        self.mm.read_user(addr, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        elf::Arch,
        kernel::{
            MapFlags,
            MemFile,
        },
    };

    #[test]
    fn state_letters() {
        assert_eq!(TaskState::RUNNING.letter(), b'R');
        assert_eq!(TaskState::INTERRUPTIBLE.letter(), b'S');
        assert_eq!(TaskState::STOPPED.number(), 3);
        assert_eq!(TaskState::ZOMBIE.letter(), b'W');
        assert_eq!(TaskState(64).letter(), b'.');
    }

    #[test]
    fn siginfo_layout() {
        let bytes = SigInfo {
            signo: 11,
            code: 1,
            addr: 0xdead,
            ..Default::default()
        }
        .to_bytes();
        assert_eq!(bytes.len(), SIGINFO_SIZE);
        assert_eq!(&bytes[0..4], &11i32.to_le_bytes());
        assert_eq!(&bytes[16..24], &0xdeadu64.to_le_bytes());
    }

    #[test]
    fn regions_from_mappings() {
        let arch = Arch::riscv64();
        let mut mm = SimAddressSpace::new(arch);
        let content = vec![0u8; 0x3000];
        let file = MemFile::new("/lib/libc.so", &content);

        mm.map_file_region(&file, 0x10000, 0x1000, Perms::from_prot(libc::PROT_READ), MapFlags::FIXED, 0x2000).unwrap();
        mm.map_anonymous(0x20000, 0x1000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();
        mm.write_user(0x20000, b"x").unwrap();

        let mut process = SimProcess::new(&mm, ProcessInfo::default(), AuxVector::new());
        process.dont_dump(0x20000, 0x21000);

        let regions = process.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].file.as_deref(), Some(std::path::Path::new("/lib/libc.so")));
        assert_eq!(regions[0].pgoff, 2);
        assert!(regions[0].is_shared());
        assert_eq!(regions[0].flags.perms(), Perms::from_prot(libc::PROT_READ));
        assert!(regions[1].anonymous_pages);
        assert!(regions[1].flags.contains(VmFlags::DONTDUMP));
    }
}
