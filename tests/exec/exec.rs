use std::{
    cell::RefCell,
    collections::HashSet,
    io,
    path::Path,
};

use elfexec::{
    elf::{
        Arch,
        ElfHeader,
        LoaderError,
        Perms,
        ProgramHeader,
        Signal,
        PHDR_SIZE,
    },
    kernel::{
        AddressSpace,
        ExecFile,
        Fs,
        MapFlags,
        MemFile,
        SimAddressSpace,
        PERM_R,
        PERM_X,
    },
    loader::{
        AuxKey,
        ElfLoader,
        ExecParams,
        ProcessImage,
    },
};
use goblin::elf::{
    header::{
        ET_DYN,
        ET_EXEC,
    },
    program_header::{
        PF_R,
        PF_W,
        PF_X,
        PT_GNU_STACK,
        PT_INTERP,
        PT_LOAD,
    },
};

fn load_segment(offset: u64, vaddr: u64, filesz: u64, memsz: u64, flags: u32) -> ProgramHeader {
    ProgramHeader {
        p_type: PT_LOAD,
        p_flags: flags,
        p_offset: offset,
        p_vaddr: vaddr,
        p_paddr: vaddr,
        p_filesz: filesz,
        p_memsz: memsz,
        p_align: 0x1000,
    }
}

/// ELF header and program headers at the start of a file of `size` bytes
fn build_elf(arch: &Arch, e_type: u16, entry: u64, phdrs: &[ProgramHeader], size: usize) -> Vec<u8> {
    let mut header = ElfHeader::core(arch, phdrs.len() as u16);
    header.e_type = e_type;
    header.entry = entry;
    header.flags = 0;

    let mut bytes = header.to_bytes();

    for phdr in phdrs {
        bytes.extend_from_slice(&phdr.to_bytes());
    }

    bytes.resize(size.max(bytes.len()), 0);
    bytes
}

fn loader() -> ElfLoader {
    ElfLoader::builder().arch(Arch::riscv64()).seed(1234).stack_size(0x10_0000).build().unwrap()
}

fn params() -> ExecParams {
    ExecParams::builder("/bin/prog").progname("prog").arg("--flag").env("HOME", "/root").build().unwrap()
}

fn read_u64(mm: &SimAddressSpace, addr: u64) -> u64 {
    let mut buf = [0u8; 8];
    mm.read_user(addr, &mut buf).unwrap();
    u64::from_le_bytes(buf)
}

/// Three program headers: code, data with bss and GNU_STACK
fn three_segment_dyn() -> Vec<u8> {
    let arch = Arch::riscv64();
    let phdrs = [
        load_segment(0, 0, 0x1000, 0x1000, PF_R | PF_X),
        load_segment(0x1000, 0x1000, 0x800, 0x1000, PF_R | PF_W),
        ProgramHeader {
            p_type: PT_GNU_STACK,
            p_flags: PF_R | PF_W,
            ..Default::default()
        },
    ];

    let mut bytes = build_elf(&arch, ET_DYN, 0x100, &phdrs, 0x2000);
    bytes[0x1000..0x1800].fill(0xAA);
    /* Whatever follows the data in the file must not show up in the bss */
    bytes[0x1800..0x2000].fill(0xBB);
    bytes
}

#[test]
fn dyn_image_with_bss() {
    let arch = Arch::riscv64();
    let content = three_segment_dyn();
    let file = MemFile::new("/bin/prog", &content);
    let mut mm = SimAddressSpace::new(arch.clone());

    let image = loader().load(&mut mm, &file, &Fs::new(), &params()).unwrap();
    let bias = image.load_bias;

    assert_eq!(bias, arch.page_start(arch.et_dyn_base()));
    assert_eq!(image.entry, bias + 0x100);
    assert_eq!(image.exec_entry, image.entry);
    assert_eq!(image.elf_bss, bias + 0x1800);
    assert_eq!(image.elf_brk, bias + 0x2000);
    assert_eq!(image.start_brk, bias + 0x2000);
    assert_eq!(image.brk, image.start_brk);
    assert_eq!(image.start_code, bias);
    assert_eq!(image.end_code, bias + 0x1000);
    assert_eq!(image.end_data, bias + 0x1800);
    assert!(image.interpreter.is_none());

    let mut data = vec![0u8; 0x1000];
    mm.read_user(bias + 0x1000, &mut data).unwrap();
    assert!(data[..0x800].iter().all(|b| *b == 0xAA));
    assert!(data[0x800..].iter().all(|b| *b == 0));
}

#[test]
fn exec_image_is_not_relocated() {
    let arch = Arch::riscv64();
    let content = build_elf(&arch, ET_EXEC, 0x10080, &[load_segment(0, 0x10000, 0x1000, 0x1000, PF_R | PF_X)], 0x1000);
    let file = MemFile::new("/bin/prog", &content);
    let mut mm = SimAddressSpace::new(arch);

    let image = loader().load(&mut mm, &file, &Fs::new(), &params()).unwrap();

    assert_eq!(image.load_bias, 0);
    assert_eq!(image.entry, 0x10080);
    assert_eq!(image.load_addr, 0x10000);
    assert_eq!(image.start_brk, 0x11000);
}

struct CountingFile<'a> {
    inner: MemFile<'a>,
    reads: RefCell<Vec<(u64, usize)>>,
}

impl ExecFile for CountingFile<'_> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.borrow_mut().push((offset, buf.len()));
        self.inner.read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }
}

#[test]
fn enlarged_phnum_is_rejected_early() {
    let arch = Arch::riscv64();
    let mut header = ElfHeader::core(&arch, u16::try_from(65536 / PHDR_SIZE + 1).unwrap());
    header.e_type = ET_EXEC;
    header.phoff = 0x10000;

    let mut content = header.to_bytes();
    content.resize(0x1000, 0);

    let file = CountingFile {
        inner: MemFile::new("/bin/prog", &content),
        reads: RefCell::new(Vec::new()),
    };

    let mut mm = SimAddressSpace::new(arch);
    mm.map_anonymous(0x10000, 0x1000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();

    let err = loader().load(&mut mm, &file, &Fs::new(), &params()).unwrap_err();
    assert!(matches!(err, LoaderError::Malformed(_)));
    assert!(!err.is_fatal_to_process());

    /* Only the header was looked at and the old image is still there */
    assert!(file.reads.borrow().iter().all(|(offset, _)| *offset < 128));
    assert_eq!(mm.mappings().count(), 1);
}

fn read_auxv(mm: &SimAddressSpace, image: &ProcessImage) -> Vec<(u64, u64)> {
    let mut addr = image.stack.auxv;
    let mut pairs = Vec::new();

    loop {
        let key = read_u64(mm, addr);
        let value = read_u64(mm, addr + 8);
        pairs.push((key, value));
        addr += 16;

        if key == 0 {
            break pairs;
        }
    }
}

#[test]
fn stack_and_auxv() {
    let arch = Arch::riscv64();
    let content = three_segment_dyn();
    let file = MemFile::new("/bin/prog", &content);
    let mut mm = SimAddressSpace::new(arch);

    let image = loader().load(&mut mm, &file, &Fs::new(), &params()).unwrap();

    assert_eq!(image.start_stack % 16, 0);
    assert_eq!(read_u64(&mm, image.start_stack), 2);
    assert_eq!(image.stack.argc, 2);
    assert_eq!(image.stack.envc, 1);

    let auxv = read_auxv(&mm, &image);
    assert_eq!(auxv.last(), Some(&(0, 0)));
    assert_eq!(auxv, image.saved_auxv.to_pairs());

    let keys: HashSet<u64> = auxv.iter().map(|(key, _)| *key).collect();
    assert_eq!(keys.len(), auxv.len());

    let saved = &image.saved_auxv;
    assert_eq!(saved.get(AuxKey::Pagesz), Some(4096));
    assert_eq!(saved.get(AuxKey::Entry), Some(image.exec_entry));
    assert_eq!(saved.get(AuxKey::Phdr), Some(image.load_addr + 64));
    assert_eq!(saved.get(AuxKey::Phnum), Some(3));
    assert_eq!(saved.get(AuxKey::Base), Some(0));
    assert_eq!(saved.get(AuxKey::Random), Some(image.stack.random));

    /* argv[0] */
    let argv0 = read_u64(&mm, image.stack.argv);
    let mut name = [0u8; 5];
    mm.read_user(argv0, &mut name).unwrap();
    assert_eq!(&name, b"prog\0");
    assert_eq!(argv0, image.arg_start);
}

fn interpreter() -> Vec<u8> {
    let arch = Arch::riscv64();
    let phdrs = [load_segment(0, 0, 0x1000, 0x1000, PF_R | PF_X), load_segment(0x1000, 0x1000, 0x100, 0x3000, PF_R | PF_W)];
    build_elf(&arch, ET_DYN, 0x40, &phdrs, 0x1100)
}

#[test]
fn dynamic_executable() {
    let arch = Arch::riscv64();
    let phdrs = [
        ProgramHeader {
            p_type: PT_INTERP,
            p_flags: PF_R,
            p_offset: 0x200,
            p_filesz: 11,
            p_memsz: 11,
            p_align: 1,
            ..Default::default()
        },
        load_segment(0, 0, 0x1000, 0x1000, PF_R | PF_X),
    ];
    let mut content = build_elf(&arch, ET_DYN, 0x300, &phdrs, 0x1000);
    content[0x200..0x20b].copy_from_slice(b"/lib/ld.so\0");

    let mut fs = Fs::new();
    fs.install("/lib/ld.so", interpreter(), PERM_R | PERM_X).unwrap();

    let file = MemFile::new("/bin/prog", &content);
    let mut mm = SimAddressSpace::new(arch.clone());
    let image = loader().load(&mut mm, &file, &fs, &params()).unwrap();

    assert_eq!(image.interpreter.as_deref(), Some(Path::new("/lib/ld.so")));
    assert_ne!(image.interp_load_addr, 0);
    assert_eq!(arch.page_offset(image.interp_load_addr), 0);
    assert_eq!(image.entry, image.interp_load_addr + 0x40);
    assert_eq!(image.exec_entry, image.load_bias + 0x300);
    assert_eq!(image.saved_auxv.get(AuxKey::Base), Some(image.interp_load_addr));
    assert_eq!(image.saved_auxv.get(AuxKey::Entry), Some(image.exec_entry));

    /* The bss of the interpreter reaches beyond its file */
    let mut buf = [0xffu8; 8];
    mm.read_user(image.interp_load_addr + 0x3ff8, &mut buf).unwrap();
    assert_eq!(buf, [0; 8]);
}

#[test]
fn missing_interpreter() {
    let arch = Arch::riscv64();
    let phdrs = [
        ProgramHeader {
            p_type: PT_INTERP,
            p_offset: 0x200,
            p_filesz: 11,
            ..Default::default()
        },
        load_segment(0, 0, 0x1000, 0x1000, PF_R | PF_X),
    ];
    let mut content = build_elf(&arch, ET_DYN, 0x300, &phdrs, 0x1000);
    content[0x200..0x20b].copy_from_slice(b"/lib/ld.so\0");

    let file = MemFile::new("/bin/prog", &content);
    let mut mm = SimAddressSpace::new(arch);

    let err = loader().load(&mut mm, &file, &Fs::new(), &params()).unwrap_err();
    assert!(matches!(err, LoaderError::BadInterpreter(_)));
}

#[test]
fn bad_entry_point_kills_with_segv() {
    let arch = Arch::riscv64();
    let entry = arch.task_size() + 0x1000;
    let content = build_elf(&arch, ET_EXEC, entry, &[load_segment(0, 0x10000, 0x1000, 0x1000, PF_R | PF_X)], 0x1000);
    let file = MemFile::new("/bin/prog", &content);
    let mut mm = SimAddressSpace::new(arch);

    let err = loader().load(&mut mm, &file, &Fs::new(), &params()).unwrap_err();
    assert!(err.is_fatal_to_process());
    assert!(matches!(err, LoaderError::Terminated { signal: Signal::Segv, .. }));
}

#[test]
fn segment_without_file_content() {
    let arch = Arch::riscv64();
    let phdrs = [load_segment(0, 0x10000, 0x1000, 0x1000, PF_R | PF_X), load_segment(0, 0x20000, 0, 0x2000, PF_R | PF_W)];
    let content = build_elf(&arch, ET_EXEC, 0x10080, &phdrs, 0x1000);
    let file = MemFile::new("/bin/prog", &content);
    let mut mm = SimAddressSpace::new(arch);

    let image = loader().load(&mut mm, &file, &Fs::new(), &params()).unwrap();

    assert_eq!(image.elf_bss, 0x20000);
    assert_eq!(image.elf_brk, 0x22000);
    assert_eq!(image.start_brk, 0x22000);

    let mut bss = vec![0xffu8; 0x2000];
    mm.read_user(0x20000, &mut bss).unwrap();
    assert!(bss.iter().all(|b| *b == 0));
}

fn assert_rejected_before_discard(phdrs: &[ProgramHeader]) {
    let arch = Arch::riscv64();
    let content = build_elf(&arch, ET_EXEC, 0x10080, phdrs, 0x3000);
    let file = MemFile::new("/bin/prog", &content);

    let mut mm = SimAddressSpace::new(arch);
    mm.map_anonymous(0x40_0000, 0x1000, Perms::rw(), MapFlags::PRIVATE | MapFlags::FIXED).unwrap();

    let err = loader().load(&mut mm, &file, &Fs::new(), &params()).unwrap_err();
    assert!(matches!(err, LoaderError::AddressError(_)), "{:?}", err);
    assert!(!err.is_fatal_to_process());
    assert_eq!(mm.mappings().count(), 1);
}

#[test]
fn huge_memsz_is_rejected() {
    assert_rejected_before_discard(&[load_segment(0, 0x1000, 0x100, u64::MAX - 0x10, PF_R | PF_X)]);
}

#[test]
fn overflowing_middle_segment_is_rejected() {
    assert_rejected_before_discard(&[
        load_segment(0, 0x10000, 0x1000, 0x1000, PF_R | PF_X),
        load_segment(0x1010, 0x20010, u64::MAX - 0x2000, u64::MAX - 0x2000, PF_R | PF_W),
        load_segment(0x2000, 0x30000, 0x1000, 0x1000, PF_R),
    ]);
}
