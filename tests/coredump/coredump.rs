use std::io::{
    Cursor,
    Read,
};

use elfexec::{
    coredump::{
        notesize,
        CoreDumper,
        DumpFilter,
        DumpStatus,
        MemElfNote,
        ProcessInfo,
        SigInfo,
        SimProcess,
        StopReason,
        TaskState,
        ThreadInfo,
        NOTE_NAME_CORE,
        NOTE_NAME_LINUX,
        NT_AUXV,
        NT_FILE,
        NT_PRFPREG,
        NT_PRPSINFO,
        NT_PRSTATUS,
        NT_SIGINFO,
    },
    elf::{
        Arch,
        ElfHeader,
        Perms,
        ProgramHeader,
    },
    kernel::{
        AddressSpace,
        Fs,
        MapFlags,
        MemFile,
        SimAddressSpace,
    },
    loader::{
        AuxKey,
        AuxVector,
        ElfLoader,
        ExecParams,
    },
};
use flate2::{
    read::GzDecoder,
    Crc,
};
use goblin::elf::{
    header::{
        EM_RISCV,
        EM_X86_64,
        ET_CORE,
        ET_DYN,
    },
    program_header::{
        PF_R,
        PF_W,
        PF_X,
        PT_LOAD,
        PT_NOTE,
    },
    Elf,
};

struct Note {
    name: String,
    n_type: u32,
    desc: Vec<u8>,
}

fn parse(data: &[u8]) -> (Elf<'_>, Vec<Note>) {
    let elf = Elf::parse(data).unwrap();
    let mut notes = Vec::new();

    for note in elf.iter_note_headers(data).unwrap() {
        let note = note.unwrap();
        notes.push(Note {
            name: note.name.to_string(),
            n_type: note.n_type,
            desc: note.desc.to_vec(),
        });
    }

    (elf, notes)
}

fn count(notes: &[Note], n_type: u32) -> usize {
    notes.iter().filter(|note| note.n_type == n_type).count()
}

fn u64_at(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn dump(dumper: &CoreDumper, process: &SimProcess) -> (Vec<u8>, elfexec::coredump::DumpReport) {
    let mut out = Cursor::new(Vec::new());
    let report = dumper.dump(process, &mut out).unwrap();
    (out.into_inner(), report)
}

fn load_segment(offset: u64, vaddr: u64, filesz: u64, memsz: u64, flags: u32) -> ProgramHeader {
    ProgramHeader {
        p_type: PT_LOAD,
        p_flags: flags,
        p_offset: offset,
        p_vaddr: vaddr,
        p_filesz: filesz,
        p_memsz: memsz,
        p_align: 0x1000,
        ..Default::default()
    }
}

fn program() -> Vec<u8> {
    let arch = Arch::riscv64();
    let phdrs = [load_segment(0, 0, 0x1000, 0x1000, PF_R | PF_X), load_segment(0x1000, 0x1000, 0x800, 0x3000, PF_R | PF_W)];

    let mut header = ElfHeader::core(&arch, phdrs.len() as u16);
    header.e_type = ET_DYN;
    header.entry = 0x100;
    header.flags = 0;

    let mut bytes = header.to_bytes();
    for phdr in &phdrs {
        bytes.extend_from_slice(&phdr.to_bytes());
    }
    bytes.resize(0x1800, 0x5A);
    bytes
}

#[test]
fn loaded_program_round_trip() {
    let arch = Arch::riscv64();
    let content = program();
    let file = MemFile::new("/bin/prog", &content);
    let mut mm = SimAddressSpace::new(arch.clone());

    let loader = ElfLoader::builder().arch(arch.clone()).seed(7).stack_size(0x2_0000).build().unwrap();
    let params = ExecParams::builder("/bin/prog").progname("prog").arg("-x").build().unwrap();
    let image = loader.load(&mut mm, &file, &Fs::new(), &params).unwrap();

    let info = ProcessInfo {
        pid: 42,
        comm: "prog".to_string(),
        state: TaskState::RUNNING,
        arg_start: image.arg_start,
        arg_end: image.arg_end,
        ..Default::default()
    };
    let mut process = SimProcess::new(&mm, info, image.saved_auxv.clone());
    process.add_thread(ThreadInfo {
        tid: 42,
        ..Default::default()
    });
    process.set_siginfo(SigInfo {
        signo: 11,
        code: 1,
        addr: 0xdead,
        ..Default::default()
    });

    let dumper = CoreDumper::builder().arch(arch.clone()).build().unwrap();
    let (data, report) = dump(&dumper, &process);
    assert_eq!(report.status, DumpStatus::Complete);

    let (elf, notes) = parse(&data);
    assert_eq!(elf.header.e_type, ET_CORE);
    assert_eq!(elf.header.e_machine, EM_RISCV);
    assert_eq!(elf.program_headers[0].p_type, PT_NOTE);

    /* The LOAD headers describe exactly the mappings of the process */
    let loads: Vec<(u64, u64)> = elf.program_headers.iter().filter(|phdr| phdr.p_type == PT_LOAD).map(|phdr| (phdr.p_vaddr, phdr.p_vaddr + phdr.p_memsz)).collect();
    let mappings: Vec<(u64, u64)> = mm.mappings().map(|mapping| (mapping.start, mapping.end)).collect();
    assert_eq!(loads, mappings);

    for phdr in elf.program_headers.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        assert_eq!(phdr.p_offset % 4096, 0);
        assert!(phdr.p_filesz == 0 || phdr.p_filesz == 4096 || phdr.p_filesz == phdr.p_memsz);
    }

    /* The code segment starts with an ELF header, so its first page is in the dump */
    let code = elf.program_headers.iter().find(|phdr| phdr.p_type == PT_LOAD && phdr.p_vaddr == image.load_bias).unwrap();
    assert_eq!(code.p_filesz, 4096);
    assert_eq!(&data[code.p_offset as usize..code.p_offset as usize + 4], b"\x7fELF");

    /* The bss was written by the loader */
    let bss = elf.program_headers.iter().find(|phdr| phdr.p_type == PT_LOAD && phdr.p_vaddr == image.load_bias + 0x1000).unwrap();
    assert_eq!(bss.p_filesz, bss.p_memsz);
    let offset = bss.p_offset as usize;
    assert!(data[offset..offset + 0x800].iter().all(|b| *b == 0x5A));
    assert!(data[offset + 0x800..offset + 0x1000].iter().all(|b| *b == 0));

    let auxv = notes.iter().find(|note| note.n_type == NT_AUXV).unwrap();
    assert_eq!(auxv.desc, image.saved_auxv.to_bytes());
    assert_eq!(u64_at(&auxv.desc, auxv.desc.len() - 16), AuxKey::Null.id());

    let psinfo = notes.iter().find(|note| note.n_type == NT_PRPSINFO).unwrap();
    assert_eq!(&psinfo.desc[40..45], b"prog\0");
    /* The terminating NUL of the last argument becomes a space too */
    assert_eq!(&psinfo.desc[56..65], b"prog -x \0");

    let siginfo = notes.iter().find(|note| note.n_type == NT_SIGINFO).unwrap();
    assert_eq!(u32_at(&siginfo.desc, 0), 11);
    assert_eq!(u64_at(&siginfo.desc, 16), 0xdead);
}

#[test]
fn note_sizes_match_segment() {
    let mut mm = SimAddressSpace::new(Arch::riscv64());
    mm.map_anonymous(0x10000, 0x1000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();

    let mut auxv = AuxVector::new();
    auxv.set(AuxKey::Pagesz, 4096);

    let mut process = SimProcess::new(&mm, ProcessInfo::default(), auxv);
    process.add_thread(ThreadInfo {
        tid: 1,
        ..Default::default()
    });
    process.set_registers(1, NT_PRFPREG, vec![0x22; 264]);

    let (data, _) = dump(&CoreDumper::builder().build().unwrap(), &process);
    let (elf, notes) = parse(&data);
    let note_phdr = &elf.program_headers[0];

    let total: usize = notes
        .iter()
        .map(|note| {
            let name = if note.name == NOTE_NAME_CORE { NOTE_NAME_CORE } else { NOTE_NAME_LINUX };
            let note = MemElfNote::new(name, note.n_type, note.desc.clone());
            let encoded = note.to_bytes();
            assert_eq!(encoded.len(), notesize(&note));
            encoded.len()
        })
        .sum();

    assert_eq!(total as u64, note_phdr.p_filesz);
    assert_eq!(note_phdr.p_offset, 64 + 2 * 56);

    /* PRSTATUS marks the FP registers valid */
    let prstatus = notes.iter().find(|note| note.n_type == NT_PRSTATUS).unwrap();
    assert_eq!(prstatus.desc.len(), 376);
    assert_eq!(u32_at(&prstatus.desc, 368), 1);
    assert_eq!(count(&notes, NT_PRFPREG), 1);
}

#[test]
fn two_threads_and_shared_file() {
    let mut mm = SimAddressSpace::new(Arch::riscv64());
    let shared = vec![0x77u8; 0x1000];
    let file = MemFile::new("/data/shared.bin", &shared);

    mm.map_anonymous(0x10000, 0x2000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();
    mm.write_user(0x10000, b"heap").unwrap();
    mm.map_file_region(&file, 0x20000, 0x1000, Perms::rw(), MapFlags::FIXED, 0).unwrap();

    let mut process = SimProcess::new(&mm, ProcessInfo::default(), AuxVector::new());
    process.add_thread(ThreadInfo {
        tid: 100,
        ..Default::default()
    });
    process.add_thread(ThreadInfo {
        tid: 101,
        ..Default::default()
    });
    process.set_dumper(101);

    let (data, report) = dump(&CoreDumper::builder().build().unwrap(), &process);
    assert!(report.is_complete());

    let (elf, notes) = parse(&data);
    assert_eq!(count(&notes, NT_PRSTATUS), 2);
    assert_eq!(count(&notes, NT_PRPSINFO), 1);
    assert_eq!(count(&notes, NT_AUXV), 1);
    assert_eq!(count(&notes, NT_FILE), 1);
    assert_eq!(count(&notes, NT_SIGINFO), 1);

    /* The dumping thread comes first */
    assert_eq!(notes[0].n_type, NT_PRSTATUS);
    assert_eq!(u32_at(&notes[0].desc, 32), 101);

    let files = notes.iter().find(|note| note.n_type == NT_FILE).unwrap();
    assert_eq!(u64_at(&files.desc, 0), 1);
    assert_eq!(u64_at(&files.desc, 8), 4096);
    assert_eq!((u64_at(&files.desc, 16), u64_at(&files.desc, 24), u64_at(&files.desc, 32)), (0x20000, 0x21000, 0));
    assert_eq!(&files.desc[40..], b"/data/shared.bin\0");

    /* Shared file mappings are not part of the default filter */
    let loads: Vec<_> = elf.program_headers.iter().filter(|phdr| phdr.p_type == PT_LOAD).collect();
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[0].p_filesz, 0x2000);
    assert_eq!(loads[1].p_filesz, 0);
    assert_eq!(loads[1].p_memsz, 0x1000);

    let dumper = CoreDumper::builder().filter(DumpFilter::default() | DumpFilter::MAPPED_SHARED).build().unwrap();
    let (data, _) = dump(&dumper, &process);
    let (elf, _) = parse(&data);
    let shared = elf.program_headers.iter().find(|phdr| phdr.p_type == PT_LOAD && phdr.p_vaddr == 0x20000).unwrap();
    assert_eq!(shared.p_filesz, 0x1000);
    assert!(data[shared.p_offset as usize..][..0x1000].iter().all(|b| *b == 0x77));
}

#[test]
fn dont_dump_regions_are_empty() {
    let mut mm = SimAddressSpace::new(Arch::riscv64());
    mm.map_anonymous(0x10000, 0x1000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();
    mm.map_anonymous(0x20000, 0x1000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();
    mm.write_user(0x10000, b"a").unwrap();
    mm.write_user(0x20000, b"b").unwrap();

    let mut process = SimProcess::new(&mm, ProcessInfo::default(), AuxVector::new());
    process.add_thread(ThreadInfo {
        tid: 1,
        ..Default::default()
    });
    process.dont_dump(0x20000, 0x21000);

    let (data, _) = dump(&CoreDumper::builder().build().unwrap(), &process);
    let (elf, _) = parse(&data);
    let loads: Vec<(u64, u64, u64)> = elf.program_headers.iter().filter(|phdr| phdr.p_type == PT_LOAD).map(|phdr| (phdr.p_vaddr, phdr.p_memsz, phdr.p_filesz)).collect();
    assert_eq!(loads, vec![(0x10000, 0x1000, 0x1000), (0x20000, 0x1000, 0)]);
}

#[test]
fn compressed_round_trip() {
    let mut mm = SimAddressSpace::new(Arch::riscv64());
    mm.map_anonymous(0x10000, 0x8000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();

    for page in 0..8u64 {
        if page % 3 != 0 {
            let content: Vec<u8> = (0..4096u64).map(|i| ((i * page) % 253) as u8).collect();
            mm.write_user(0x10000 + page * 0x1000, &content).unwrap();
        }
    }

    let mut process = SimProcess::new(&mm, ProcessInfo::default(), AuxVector::new());
    process.add_thread(ThreadInfo {
        tid: 9,
        ..Default::default()
    });

    let (raw, raw_report) = dump(&CoreDumper::builder().build().unwrap(), &process);

    let dumper = CoreDumper::builder().compress(true).gzip_name("core.9.gz").gzip_mtime(0x1234_5678).chunk_size(0x3000).build().unwrap();
    let (gz, report) = dump(&dumper, &process);
    assert!(report.is_complete());
    assert_eq!(report.logical_size, raw_report.logical_size);
    assert_eq!(report.present_pages, raw_report.present_pages);

    assert_eq!(&gz[..4], &[0x1f, 0x8b, 0x08, 0x08]);
    assert_eq!(u32_at(&gz, 4), 0x1234_5678);
    assert_eq!(&gz[10..20], b"core.9.gz\0");

    let mut inflated = Vec::new();
    GzDecoder::new(&gz[..]).read_to_end(&mut inflated).unwrap();
    assert_eq!(inflated.len(), raw.len());
    assert_eq!(inflated, raw);

    let mut crc = Crc::new();
    crc.update(&raw);
    assert_eq!(u32_at(&gz, gz.len() - 8), crc.sum());
    assert_eq!(u32_at(&gz, gz.len() - 4), raw.len() as u32);
}

#[test]
fn limit_truncates_mid_region() {
    let mut mm = SimAddressSpace::new(Arch::riscv64());
    mm.map_anonymous(0x10000, 0x4000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();
    mm.write_user(0x10000, &vec![0x33; 0x4000]).unwrap();

    let mut process = SimProcess::new(&mm, ProcessInfo::default(), AuxVector::new());
    process.add_thread(ThreadInfo {
        tid: 1,
        ..Default::default()
    });

    let (full, _) = dump(&CoreDumper::builder().build().unwrap(), &process);
    let (data, report) = dump(&CoreDumper::builder().limit(3 * 4096).build().unwrap(), &process);

    assert_eq!(report.status, DumpStatus::Incomplete(StopReason::Limit));
    assert_eq!(report.present_pages, 2);
    assert!(report.bytes_written <= 3 * 4096);
    assert!(data.len() < full.len());
    assert_eq!(&full[..data.len()], &data[..]);

    /* Everything that was written still parses */
    let (elf, notes) = parse(&data);
    assert_eq!(elf.header.e_type, ET_CORE);
    assert_eq!(count(&notes, NT_PRSTATUS), 1);
}

#[test]
fn x86_64_register_notes() {
    let mut mm = SimAddressSpace::new(Arch::x86_64());
    mm.map_anonymous(0x10000, 0x1000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();

    let mut process = SimProcess::new(&mm, ProcessInfo::default(), AuxVector::new());
    process.add_thread(ThreadInfo {
        tid: 5,
        ..Default::default()
    });
    process.set_registers(5, NT_PRSTATUS, vec![0x44; 27 * 8]);
    process.set_registers(5, NT_PRFPREG, vec![0x55; 512]);

    let dumper = CoreDumper::builder().arch(Arch::x86_64()).build().unwrap();
    let (data, _) = dump(&dumper, &process);
    let (elf, notes) = parse(&data);

    assert_eq!(elf.header.e_machine, EM_X86_64);

    let prstatus = notes.iter().find(|note| note.n_type == NT_PRSTATUS).unwrap();
    assert_eq!(prstatus.desc.len(), 336);
    assert_eq!(prstatus.desc[112], 0x44);
    assert_eq!(u32_at(&prstatus.desc, 328), 1);

    let fpregs = notes.iter().find(|note| note.n_type == NT_PRFPREG).unwrap();
    assert_eq!(fpregs.name, "CORE");
    assert_eq!(fpregs.desc.len(), 512);
}
