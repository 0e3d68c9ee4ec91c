use crate::{
    coredump::{
        files::fill_files_note,
        note::{
            MemElfNote,
            NT_AUXV,
            NT_PRPSINFO,
            NT_PRSTATUS,
            NT_SIGINFO,
        },
        process::{
            MemoryRegion,
            ProcessView,
            ThreadInfo,
        },
        regs::RegisterView,
        structs::{
            PrPsInfo,
            PrStatusHead,
        },
        DumpError,
    },
    elf::bytes,
    Logger,
};

/// Size of `pr_fname`
pub const PR_FNAME_SIZE: usize = 16;
/// Size of `pr_psargs`
pub const ELF_PRARGSZ: usize = 80;
/// Size of `elf_prpsinfo`
pub const PRPSINFO_SIZE: usize = 136;

/// Offset of `pr_reg` inside `elf_prstatus`
const PR_REG_OFFSET: usize = 112;

/// Size of `elf_prstatus` for a general purpose register set of `gp_size` bytes
pub fn prstatus_size(gp_size: usize) -> usize {
    (PR_REG_OFFSET + gp_size + 4 + 7) & !7
}

/// Encode `elf_prstatus` for one thread
pub(crate) fn prstatus_bytes(process: &dyn ProcessView, thread: &ThreadInfo, signo: i32, gp: &[u8], fpvalid: bool) -> Vec<u8> {
    let info = process.info();
    let mut out = Vec::with_capacity(prstatus_size(gp.len()));

    /* pr_info only carries the signal number */
    bytes::append(&mut out, PrStatusHead {
        si_signo: signo,
        pr_cursig: signo as i16,
        pr_sigpend: thread.pending,
        pr_sighold: thread.blocked,
        pr_pid: thread.tid,
        pr_ppid: info.ppid,
        pr_pgrp: info.pgrp,
        pr_sid: info.sid,
        pr_utime: thread.times.user.into(),
        pr_stime: thread.times.system.into(),
        pr_cutime: info.children.user.into(),
        pr_cstime: info.children.system.into(),
        ..Default::default()
    });

    debug_assert_eq!(out.len(), PR_REG_OFFSET);
    out.extend_from_slice(gp);
    bytes::append(&mut out, fpvalid as i32);
    bytes::pad(&mut out, 8);
    out
}

/// Encode `elf_prpsinfo` for the process
pub(crate) fn psinfo_bytes(process: &dyn ProcessView, logger: &Logger) -> Vec<u8> {
    let info = process.info();
    let state = info.state;
    let sname = state.letter();

    let mut psargs = [0u8; ELF_PRARGSZ];
    let len = (info.arg_end.saturating_sub(info.arg_start) as usize).min(ELF_PRARGSZ - 1);

    match process.read_memory(info.arg_start, &mut psargs[..len]) {
        Ok(()) => {
            for byte in &mut psargs[..len] {
                if *byte == 0 {
                    *byte = b' ';
                }
            }
        },
        Err(err) => {
            logger.warning(format!("Could not read the arguments: {}", err));
            psargs = [0; ELF_PRARGSZ];
        },
    }

    let mut fname = [0u8; PR_FNAME_SIZE];
    let comm = info.comm.as_bytes();
    let count = comm.len().min(PR_FNAME_SIZE);
    fname[..count].copy_from_slice(&comm[..count]);

    bytes::encode(PrPsInfo {
        pr_state: state.number(),
        pr_sname: sname,
        pr_zomb: (sname == b'Z') as u8,
        pr_nice: info.nice as u8,
        pad0: 0,
        pr_flag: info.flags,
        pr_uid: info.uid,
        pr_gid: info.gid,
        pr_pid: info.pid,
        pr_ppid: info.ppid,
        pr_pgrp: info.pgrp,
        pr_sid: info.sid,
        pr_fname: fname,
        pr_psargs: psargs,
    })
}

/// The notes of a single thread. The first note is always PRSTATUS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadCoreInfo {
    pub tid: u32,
    notes: Vec<MemElfNote>,
}

impl ThreadCoreInfo {
    pub fn prstatus(&self) -> &MemElfNote {
        &self.notes[0]
    }

    /// Register notes beyond PRSTATUS
    pub fn extra(&self) -> &[MemElfNote] {
        &self.notes[1..]
    }

    pub fn notes(&self) -> &[MemElfNote] {
        &self.notes
    }
}

/// Everything that goes into the NOTE segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteInfo {
    threads: Vec<ThreadCoreInfo>,
    psinfo: MemElfNote,
    signote: MemElfNote,
    auxv: MemElfNote,
    files: Option<MemElfNote>,
}

impl NoteInfo {
    /// The dumping thread comes first
    pub fn threads(&self) -> &[ThreadCoreInfo] {
        &self.threads
    }

    pub fn files(&self) -> Option<&MemElfNote> {
        self.files.as_ref()
    }

    /// All notes in file order. The process wide notes follow the PRSTATUS note of the first thread.
    pub fn notes(&self) -> Vec<&MemElfNote> {
        let mut notes = Vec::new();

        for (i, thread) in self.threads.iter().enumerate() {
            notes.push(thread.prstatus());

            if i == 0 {
                notes.push(&self.psinfo);
                notes.push(&self.signote);
                notes.push(&self.auxv);
                notes.extend(self.files.iter());
            }

            notes.extend(thread.extra());
        }

        notes
    }

    /// Size of the NOTE segment
    pub fn size(&self) -> usize {
        self.notes().iter().map(|note| note.size()).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DumpError> {
        let size = self.size();
        let mut out = Vec::new();
        out.try_reserve_exact(size).map_err(|_| DumpError::OutOfMemory(size))?;

        for note in self.notes() {
            note.write_to(&mut out);
        }

        Ok(out)
    }
}

/// Arrange the threads so that the dumping thread is first. Other threads keep their relative order
/// except that each one is inserted directly behind the head.
fn order_threads<'a>(threads: &'a [ThreadInfo], dumper: u32) -> Vec<&'a ThreadInfo> {
    let mut ordered: Vec<&ThreadInfo> = Vec::with_capacity(threads.len());

    for thread in threads {
        if thread.tid == dumper || ordered.is_empty() {
            ordered.insert(0, thread);
        } else {
            ordered.insert(1, thread);
        }
    }

    ordered
}

/// Gather all notes of a process
pub(crate) fn collect_notes(process: &dyn ProcessView, view: &RegisterView, regions: &[MemoryRegion], page_size: u64, logger: &Logger) -> Result<NoteInfo, DumpError> {
    view.check()?;

    let signo = process.siginfo().signo;
    let ordered = order_threads(process.threads(), process.dumper());

    if ordered.is_empty() {
        return Err(DumpError::NoThreads);
    }

    let mut threads = Vec::new();
    threads.try_reserve_exact(ordered.len()).map_err(|_| DumpError::OutOfMemory(ordered.len()))?;

    for thread in ordered {
        let regs = view.read_thread(process, thread.tid);
        let mut notes = Vec::with_capacity(1 + regs.extra.len());

        notes.push(MemElfNote::core(NT_PRSTATUS, prstatus_bytes(process, thread, signo, &regs.gp, regs.fpvalid)));
        notes.extend(regs.extra);

        logger.debug(format!("Thread {} has {} notes", thread.tid, notes.len()));

        threads.push(ThreadCoreInfo {
            tid: thread.tid,
            notes,
        });
    }

    let psinfo = MemElfNote::core(NT_PRPSINFO, psinfo_bytes(process, logger));
    let signote = MemElfNote::core(NT_SIGINFO, process.siginfo().to_bytes());
    let auxv = MemElfNote::core(NT_AUXV, process.saved_auxv().to_bytes());

    let files = fill_files_note(regions, page_size);

    if files.is_none() {
        logger.warning("Too many file mappings, omitting the FILE note");
    }

    Ok(NoteInfo {
        threads,
        psinfo,
        signote,
        auxv,
        files,
    })
}
