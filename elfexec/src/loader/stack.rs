use std::collections::BTreeMap;

use crate::{
    elf::{
        bytes,
        Arch,
        LoaderError,
        PHDR_SIZE,
    },
    kernel::AddressSpace,
    loader::{
        AuxKey,
        AuxVector,
        Credentials,
    },
};

/// Maximum length of a single argument or environment string including its terminator
pub fn max_arg_strlen(arch: &Arch) -> u64 {
    32 * arch.page_size()
}

/// Where the argument and environment strings ended up at the top of the stack
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopiedStrings {
    pub exec_fn: u64,
    pub args: Vec<u64>,
    pub envs: Vec<u64>,
    pub arg_start: u64,
    pub arg_end: u64,
    pub env_start: u64,
    pub env_end: u64,
    /// Lowest address used by the strings
    pub p: u64,
}

/// The initial stack of a new process as built by [`create_elf_tables`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackLayout {
    pub argc: u64,
    pub envc: u64,
    /// Points to argc. Always 16-byte aligned.
    pub sp: u64,
    pub argv: u64,
    pub envp: u64,
    pub auxv: u64,
    pub platform: Option<u64>,
    pub base_platform: Option<u64>,
    pub random: u64,
}

/// The values that describe the loaded program to the dynamic linker and the C runtime
#[derive(Clone, Debug, Default)]
pub struct AuxInfo {
    pub phdr: u64,
    pub phnum: u64,
    pub base: u64,
    pub entry: u64,
    pub credentials: Credentials,
    pub secure: bool,
    pub exec_fd: Option<u64>,
    pub vdso: Option<u64>,
}

fn cstring(s: &str, what: &str) -> Result<Vec<u8>, LoaderError> {
    if s.as_bytes().contains(&0) {
        return Err(LoaderError::InvalidArgument(format!("{} contains a NUL byte", what)));
    }

    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    Ok(bytes)
}

fn store_block(mm: &mut dyn AddressSpace, addr: u64, strings: &[Vec<u8>]) -> Result<Vec<u64>, LoaderError> {
    let mut addrs = Vec::with_capacity(strings.len());
    let mut cursor = addr;

    for s in strings {
        mm.write_user(cursor, s)?;
        addrs.push(cursor);
        cursor += s.len() as u64;
    }

    Ok(addrs)
}

/// The NUL terminated strings that go onto the new stack, checked against the size limits
#[derive(Clone, Debug)]
pub(crate) struct ExecStrings {
    filename: Vec<u8>,
    args: Vec<Vec<u8>>,
    envs: Vec<Vec<u8>>,
}

impl ExecStrings {
    /// Encode the strings. `stack_limit` bounds how much of the stack they may occupy together.
    pub(crate) fn new(arch: &Arch, stack_limit: u64, filename: &str, args: &[String], env: &BTreeMap<String, String>) -> Result<Self, LoaderError> {
        let max_len = max_arg_strlen(arch);

        let filename = cstring(filename, "Filename")?;
        let args = args.iter().map(|arg| cstring(arg, "Argument")).collect::<Result<Vec<_>, _>>()?;
        let envs = env.iter().map(|(key, value)| cstring(&format!("{}={}", key, value), "Environment variable")).collect::<Result<Vec<_>, _>>()?;

        let mut total = 0u64;

        for s in std::iter::once(&filename).chain(&args).chain(&envs) {
            if s.len() as u64 > max_len {
                return Err(LoaderError::ArgumentListTooLong);
            }

            total += s.len() as u64;
        }

        /* Keep one word free at the very top */
        if total + 8 > stack_limit {
            return Err(LoaderError::ArgumentListTooLong);
        }

        Ok(Self {
            filename,
            args,
            envs,
        })
    }
}

/// Copy the exec filename, the environment and the arguments to the top of the stack.
///
/// In memory the arguments come first, followed by the environment and the filename,
/// which ends up at the highest address.
pub(crate) fn copy_strings(mm: &mut dyn AddressSpace, stack_top: u64, strings: &ExecStrings) -> Result<CopiedStrings, LoaderError> {
    let mut p = stack_top - 8;

    p -= strings.filename.len() as u64;
    mm.write_user(p, &strings.filename)?;
    let exec_fn = p;
    let env_end = p;

    p -= strings.envs.iter().map(|s| s.len() as u64).sum::<u64>();
    let env_start = p;
    let env_addrs = store_block(mm, env_start, &strings.envs)?;

    p -= strings.args.iter().map(|s| s.len() as u64).sum::<u64>();
    let arg_start = p;
    let arg_addrs = store_block(mm, arg_start, &strings.args)?;

    Ok(CopiedStrings {
        exec_fn,
        args: arg_addrs,
        envs: env_addrs,
        arg_start,
        arg_end: env_start,
        env_start,
        env_end,
        p,
    })
}

/// Build the auxiliary vector. Optional entries follow the mandatory ones.
pub(crate) fn build_auxv(arch: &Arch, info: &AuxInfo, strings: &CopiedStrings, random: u64, platform: Option<u64>, base_platform: Option<u64>) -> AuxVector {
    let mut auxv = AuxVector::new();

    auxv.set(AuxKey::Hwcap, arch.hwcap());
    auxv.set(AuxKey::Pagesz, arch.page_size());
    auxv.set(AuxKey::Clktck, arch.clock_ticks());
    auxv.set(AuxKey::Phdr, info.phdr);
    auxv.set(AuxKey::Phent, PHDR_SIZE as u64);
    auxv.set(AuxKey::Phnum, info.phnum);
    auxv.set(AuxKey::Base, info.base);
    auxv.set(AuxKey::Flags, 0);
    auxv.set(AuxKey::Entry, info.entry);
    auxv.set(AuxKey::Uid, info.credentials.uid as u64);
    auxv.set(AuxKey::Euid, info.credentials.euid as u64);
    auxv.set(AuxKey::Gid, info.credentials.gid as u64);
    auxv.set(AuxKey::Egid, info.credentials.egid as u64);
    auxv.set(AuxKey::Secure, info.secure as u64);
    auxv.set(AuxKey::Random, random);

    if let Some(hwcap2) = arch.hwcap2() {
        auxv.set(AuxKey::Hwcap2, hwcap2);
    }

    auxv.set(AuxKey::ExecFn, strings.exec_fn);

    if let Some(platform) = platform {
        auxv.set(AuxKey::Platform, platform);
    }

    if let Some(base_platform) = base_platform {
        auxv.set(AuxKey::BasePlatform, base_platform);
    }

    if let Some(fd) = info.exec_fd {
        auxv.set(AuxKey::ExecFd, fd);
    }

    if let Some(vdso) = info.vdso {
        auxv.set(AuxKey::SysinfoEhdr, vdso);
    }

    auxv
}

/// Lay out random bytes, platform strings, argc, argv, envp and the auxiliary vector
/// below the strings that [`copy_strings`] put on the stack.
///
/// `jitter` lowers the stack by that many bytes before anything is placed. Returns the
/// layout together with the auxiliary vector that was written.
pub(crate) fn create_elf_tables(mm: &mut dyn AddressSpace, arch: &Arch, strings: &CopiedStrings, info: &AuxInfo, random_bytes: &[u8; 16], jitter: u64) -> Result<(StackLayout, AuxVector), LoaderError> {
    let mut p = strings.p.checked_sub(jitter).ok_or(LoaderError::ArgumentListTooLong)? & !0xf;

    p -= random_bytes.len() as u64;
    mm.write_user(p, random_bytes)?;
    let random = p;

    let platform = match arch.platform() {
        Some(platform) => {
            let bytes = cstring(platform, "Platform")?;
            p -= bytes.len() as u64;
            mm.write_user(p, &bytes)?;
            Some(p)
        },
        None => None,
    };

    let base_platform = match arch.base_platform() {
        Some(platform) => {
            let bytes = cstring(platform, "Base platform")?;
            p -= bytes.len() as u64;
            mm.write_user(p, &bytes)?;
            Some(p)
        },
        None => None,
    };

    let auxv = build_auxv(arch, info, strings, random, platform, base_platform);

    let argc = strings.args.len() as u64;
    let envc = strings.envs.len() as u64;
    let items = (argc + 1) + (envc + 1) + 1;
    let words = auxv.words() as u64;
    let sp = p.checked_sub((words + items) * 8).ok_or(LoaderError::ArgumentListTooLong)? & !0xf;

    /* argc, argv, envp and auxv are contiguous */
    let mut table = Vec::with_capacity(((items + words) * 8) as usize);
    bytes::append(&mut table, argc);

    for addr in strings.args.iter().chain(std::iter::once(&0)) {
        bytes::append(&mut table, *addr);
    }

    for addr in strings.envs.iter().chain(std::iter::once(&0)) {
        bytes::append(&mut table, *addr);
    }

    table.extend_from_slice(&auxv.to_bytes());
    mm.write_user(sp, &table)?;

    let argv = sp + 8;
    let envp = argv + (argc + 1) * 8;

    Ok((
        StackLayout {
            argc,
            envc,
            sp,
            argv,
            envp,
            auxv: envp + (envc + 1) * 8,
            platform,
            base_platform,
            random,
        },
        auxv,
    ))
}
