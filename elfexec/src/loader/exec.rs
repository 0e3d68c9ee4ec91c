use std::{
    collections::BTreeMap,
    path::PathBuf,
};

use rand::{
    rngs::StdRng,
    Rng,
    RngCore,
    SeedableRng,
};

use crate::{
    elf::{
        Arch,
        ElfHeader,
        LoaderError,
        Perms,
        SegmentType,
        Signal,
    },
    kernel::{
        AddressSpace,
        ExecFile,
        FileOpener,
        HostOpener,
        MappedElf,
    },
    loader::{
        image::{
            finalize_break,
            map_main_image,
        },
        interp::{
            load_elf_interp,
            read_interp_header,
            read_interp_path,
        },
        stack::{
            copy_strings,
            create_elf_tables,
            AuxInfo,
            CopiedStrings,
            ExecStrings,
        },
        validate::validate,
        ExecStack,
        ProcessImage,
    },
    Logger,
};

/// Default size of the stack region that is reserved for a new program
pub const DEFAULT_STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Upper bound for the stack size. Keeps the stack clear of the mmap area.
const MAX_STACK_SIZE: u64 = 64 * 1024 * 1024;

/// The identity the new program runs with
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

impl Credentials {
    /// Real and effective ids differ, like after executing a setuid binary
    pub fn is_setid(&self) -> bool {
        self.uid != self.euid || self.gid != self.egid
    }
}

/// Everything about a single exec call that is not part of the binary
#[derive(Clone, Debug)]
pub struct ExecParams {
    filename: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    credentials: Credentials,
    secure: bool,
    vdso: Option<u64>,
    exec_fd: Option<u64>,
}

impl ExecParams {
    /// Create an [`ExecParamsBuilder`] for executing `filename`
    pub fn builder<S: Into<String>>(filename: S) -> ExecParamsBuilder {
        ExecParamsBuilder {
            filename: filename.into(),
            progname: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            credentials: Credentials::default(),
            secure: false,
            vdso: None,
            exec_fd: None,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The argument vector including `argv[0]`
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    /// Whether `AT_SECURE` is set for the new program
    pub fn is_secure(&self) -> bool {
        self.secure || self.credentials.is_setid()
    }
}

/// Builds [`ExecParams`]
pub struct ExecParamsBuilder {
    filename: String,
    progname: Option<String>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    credentials: Credentials,
    secure: bool,
    vdso: Option<u64>,
    exec_fd: Option<u64>,
}

impl ExecParamsBuilder {
    /// Set `argv[0]`. Without this the argument vector is exactly what was passed via [`arg`](Self::arg).
    pub fn progname<S: Into<String>>(mut self, progname: S) -> Self {
        self.progname = Some(progname.into());
        self
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    /// Set an environment variable. Setting it again replaces the value.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Force `AT_SECURE` even if the credentials would not require it
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Base address of a vDSO that is already mapped. Announced via `AT_SYSINFO_EHDR`.
    pub fn vdso(mut self, addr: u64) -> Self {
        self.vdso = Some(addr);
        self
    }

    /// File descriptor of the binary. Announced via `AT_EXECFD`.
    pub fn exec_fd(mut self, fd: u64) -> Self {
        self.exec_fd = Some(fd);
        self
    }

    pub fn build(self) -> Result<ExecParams, &'static str> {
        if self.filename.is_empty() {
            return Err("Filename must not be empty");
        }

        let args = self.progname.into_iter().chain(self.args).collect();

        Ok(ExecParams {
            filename: self.filename,
            args,
            env: self.env,
            credentials: self.credentials,
            secure: self.secure,
            vdso: self.vdso,
            exec_fd: self.exec_fd,
        })
    }
}

/// Loads ELF executables into an [`AddressSpace`].
///
/// Loading happens in two phases. Everything up to and including the validation of the
/// interpreter only inspects files. Errors in this phase leave the address space untouched.
/// Then the old image is discarded and the new one is built. Errors in the second phase
/// are reported as [`LoaderError::Terminated`] with the signal that kills the process.
#[derive(Clone, Debug)]
pub struct ElfLoader {
    arch: Arch,
    randomize: bool,
    seed: Option<u64>,
    stack_size: u64,
}

impl ElfLoader {
    /// Create an [`ElfLoaderBuilder`]
    pub fn builder() -> ElfLoaderBuilder {
        ElfLoaderBuilder {
            arch: Arch::default(),
            randomize: false,
            seed: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn arch(&self) -> &Arch {
        &self.arch
    }

    pub fn randomize(&self) -> bool {
        self.randomize
    }

    pub fn stack_size(&self) -> u64 {
        self.stack_size
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Replace the contents of `mm` with the program in `file`.
    /// A `PT_INTERP` interpreter is opened through `opener`.
    pub fn load(&self, mm: &mut dyn AddressSpace, file: &dyn ExecFile, opener: &dyn FileOpener, params: &ExecParams) -> Result<ProcessImage, LoaderError> {
        let logger = Logger::for_task("Loading ELF image", params.filename());

        let ret = self.load_image(mm, file, opener, params, &logger);

        match &ret {
            Ok(image) => logger.info(format!("Entry point at {:#x}, stack at {:#x}", image.entry, image.start_stack)),
            Err(err) if err.is_fatal_to_process() => logger.error(err.to_string()),
            Err(err) => logger.debug(format!("Rejected: {}", err)),
        }

        ret
    }

    fn load_image(&self, mm: &mut dyn AddressSpace, file: &dyn ExecFile, opener: &dyn FileOpener, params: &ExecParams, logger: &Logger) -> Result<ProcessImage, LoaderError> {
        let arch = &self.arch;
        let elf = validate(file, arch, logger)?;

        /* Only the first PT_INTERP counts */
        let interp_path = match elf.phdrs.iter().find(|phdr| phdr.segment_type() == SegmentType::Interp) {
            Some(phdr) => Some(read_interp_path(file, phdr)?),
            None => None,
        };

        let interp_file = match &interp_path {
            Some(path) => Some(opener.open_exec(path).map_err(|err| LoaderError::BadInterpreter(format!("{}: {}", path.display(), err)))?),
            None => None,
        };

        let interp_header = match &interp_file {
            Some(interp) => Some(read_interp_header(interp.as_ref(), arch)?),
            None => None,
        };

        let strings = ExecStrings::new(arch, self.stack_size / 4, params.filename(), params.args(), params.env())?;

        /* Point of no return */
        mm.discard_image().map_err(|err| LoaderError::from(err).terminate(Signal::Kill))?;

        let mut rng = self.rng();
        let exec_stack = ExecStack::from_program_headers(&elf.phdrs);
        let (stack_top, strings) = self.setup_stack(mm, &mut rng, exec_stack, &strings).map_err(|err| err.terminate(Signal::Kill))?;

        let mut image = map_main_image(mm, file, &elf, arch, self.randomize, logger)?;
        finalize_break(mm, arch, &mut image, logger)?;

        match (interp_file, interp_header) {
            (Some(interp), Some(header)) => {
                self.enter_interp(mm, interp.as_ref(), header, &mut image, logger)?;
                image.interpreter = interp_path;
            },
            _ => {
                if arch.is_bad_addr(image.entry) {
                    return Err(LoaderError::AddressError(format!("Entry point {:#x}", image.entry)).terminate(Signal::Segv));
                }
            },
        }

        let info = AuxInfo {
            phdr: image.load_addr.wrapping_add(elf.header.phoff),
            phnum: elf.header.phnum as u64,
            base: image.interp_load_addr,
            entry: image.exec_entry,
            credentials: params.credentials(),
            secure: params.is_secure(),
            exec_fd: params.exec_fd,
            vdso: params.vdso,
        };

        let mut random = [0u8; 16];
        rng.fill_bytes(&mut random);

        let jitter = if self.randomize { rng.gen_range(0..8192u64) } else { 0 };
        let (layout, auxv) = create_elf_tables(mm, arch, &strings, &info, &random, jitter).map_err(|err| err.terminate(Signal::Kill))?;

        image.start_stack = layout.sp;
        image.arg_start = strings.arg_start;
        image.arg_end = strings.arg_end;
        image.env_start = strings.env_start;
        image.env_end = strings.env_end;
        image.exec_stack = exec_stack;
        image.stack = layout;
        image.saved_auxv = auxv;

        logger.debug(format!("Stack top at {:#x}", stack_top));

        Ok(image)
    }

    /// Reserve the stack region below the top of the address space and copy the strings onto it
    fn setup_stack(&self, mm: &mut dyn AddressSpace, rng: &mut StdRng, exec_stack: ExecStack, strings: &ExecStrings) -> Result<(u64, CopiedStrings), LoaderError> {
        let arch = &self.arch;
        let mut stack_top = arch.page_start(arch.task_size());

        if self.randomize {
            stack_top -= (rng.next_u64() & 0x7ff) << arch.page_size().trailing_zeros();
        }

        let mut perms = Perms::rw();

        if exec_stack == ExecStack::Enabled {
            perms.make_executable();
        }

        mm.map_stack(stack_top - self.stack_size, self.stack_size, perms)?;

        let strings = copy_strings(mm, stack_top, strings)?;
        Ok((stack_top, strings))
    }

    fn enter_interp(&self, mm: &mut dyn AddressSpace, file: &dyn ExecFile, header: ElfHeader, image: &mut ProcessImage, logger: &Logger) -> Result<(), LoaderError> {
        let arch = &self.arch;
        let entry = header.entry;
        let load = load_elf_interp(mm, file, header, arch, image.load_bias != 0, logger).map_err(|err| err.terminate(Signal::Segv))?;

        image.interp_load_addr = load.load_addr;
        image.entry = load.load_addr.wrapping_add(entry);

        if arch.is_bad_addr(image.entry) {
            return Err(LoaderError::AddressError(format!("Interpreter entry point {:#x}", image.entry)).terminate(Signal::Segv));
        }

        logger.debug(format!("{} loaded at {:#x}", file.path().display(), load.map_addr));
        Ok(())
    }
}

/// Configures an [`ElfLoader`]
pub struct ElfLoaderBuilder {
    arch: Arch,
    randomize: bool,
    seed: Option<u64>,
    stack_size: u64,
}

impl ElfLoaderBuilder {
    pub fn arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    /// Randomize the placement of DYN images and the stack
    pub fn randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Seed for the random bytes in `AT_RANDOM` and the randomized placements
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn stack_size(mut self, stack_size: u64) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn build(self) -> Result<ElfLoader, &'static str> {
        if self.stack_size == 0 || self.arch.page_offset(self.stack_size) != 0 {
            return Err("Stack size must be a non-zero multiple of the page size");
        }

        if self.stack_size > MAX_STACK_SIZE {
            return Err("Stack size is too large");
        }

        Ok(ElfLoader {
            arch: self.arch,
            randomize: self.randomize,
            seed: self.seed,
            stack_size: self.stack_size,
        })
    }
}

/// Convenience for loading straight from the host file system
pub fn load_path<P: Into<PathBuf>>(loader: &ElfLoader, mm: &mut dyn AddressSpace, path: P, params: &ExecParams) -> Result<ProcessImage, LoaderError> {
    let path = path.into();
    let file = MappedElf::open(&path).map_err(|err| LoaderError::IOError(format!("{}: {}", path.display(), err)))?;
    loader.load(mm, &file, &HostOpener, params)
}
