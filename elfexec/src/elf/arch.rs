use goblin::elf::header::{
    EM_RISCV,
    EM_X86_64,
};

/// Describes the machine that loaded images run on and that core dumps are written for.
///
/// Everything the loader and the dumper need to know about the target architecture
/// lives here: the ELF machine type, the page size that governs segment alignment,
/// the top of the user address space and the values that end up in the auxiliary vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arch {
    machine: u16,
    page_size: u64,
    task_size: u64,
    et_dyn_base: u64,
    hwcap: u64,
    hwcap2: Option<u64>,
    platform: Option<String>,
    base_platform: Option<String>,
    clock_ticks: u64,
    core_flags: u32,
}

impl Arch {
    /// A 64-bit RISC-V machine with Sv39 paging
    pub fn riscv64() -> Self {
        let task_size = 0x40_0000_0000;

        Self {
            machine: EM_RISCV,
            page_size: 4096,
            task_size,
            et_dyn_base: (task_size / 3) * 2,
            /* IMAFDC */
            hwcap: (1 << (b'i' - b'a')) | (1 << (b'm' - b'a')) | (1 << (b'a' - b'a')) | (1 << (b'f' - b'a')) | (1 << (b'd' - b'a')) | (1 << (b'c' - b'a')),
            hwcap2: None,
            platform: None,
            base_platform: None,
            clock_ticks: 100,
            core_flags: 0x5,
        }
    }

    /// A 64-bit x86 machine with 4-level paging
    pub fn x86_64() -> Self {
        let task_size = 0x7fff_ffff_f000;

        Self {
            machine: EM_X86_64,
            page_size: 4096,
            task_size,
            et_dyn_base: (task_size / 3) * 2,
            hwcap: 0x178b_fbff,
            hwcap2: Some(0x2),
            platform: Some("x86_64".to_string()),
            base_platform: None,
            clock_ticks: 100,
            core_flags: 0,
        }
    }

    pub fn machine(&self) -> u16 {
        self.machine
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// The first address that is not part of the user address space
    pub fn task_size(&self) -> u64 {
        self.task_size
    }

    /// The preferred base of position independent executables when placement is not randomized
    pub fn et_dyn_base(&self) -> u64 {
        self.et_dyn_base
    }

    pub fn hwcap(&self) -> u64 {
        self.hwcap
    }

    pub fn hwcap2(&self) -> Option<u64> {
        self.hwcap2
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn base_platform(&self) -> Option<&str> {
        self.base_platform.as_deref()
    }

    pub fn clock_ticks(&self) -> u64 {
        self.clock_ticks
    }

    /// The `e_flags` that go into the header of a core file
    pub fn core_flags(&self) -> u32 {
        self.core_flags
    }

    /// Change the platform string that is passed via `AT_PLATFORM`
    pub fn set_platform<S: Into<String>>(&mut self, platform: Option<S>) {
        self.platform = platform.map(Into::into);
    }

    /// Change the platform string that is passed via `AT_BASE_PLATFORM`
    pub fn set_base_platform<S: Into<String>>(&mut self, platform: Option<S>) {
        self.base_platform = platform.map(Into::into);
    }

    #[inline]
    pub fn page_start(&self, addr: u64) -> u64 {
        addr & !(self.page_size - 1)
    }

    #[inline]
    pub fn page_offset(&self, addr: u64) -> u64 {
        addr & (self.page_size - 1)
    }

    /// Round up to the next page boundary. Wraps to 0 at the very top of the 64-bit range.
    #[inline]
    pub fn page_align(&self, addr: u64) -> u64 {
        addr.wrapping_add(self.page_size - 1) & !(self.page_size - 1)
    }

    /// Mirrors the check the kernel performs on every address handed out by mmap
    #[inline]
    pub fn is_bad_addr(&self, addr: u64) -> bool {
        addr >= self.task_size
    }
}

impl Default for Arch {
    fn default() -> Self {
        Self::riscv64()
    }
}
