use goblin::elf::program_header::{
    PF_R,
    PF_W,
    PF_X,
};

const PERM_X: u8 = 1;
const PERM_W: u8 = 2;
const PERM_R: u8 = 4;

/// The permissions of a segment, a mapping or a memory region in a core dump
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Hash)]
pub struct Perms(u8);

impl Perms {
    pub fn from_segment_flags(flags: u32) -> Self {
        let mut perms = Perms(0);

        if (flags & PF_X) != 0 {
            perms.make_executable();
        }

        if (flags & PF_W) != 0 {
            perms.make_writable();
        }

        if (flags & PF_R) != 0 {
            perms.make_readable();
        }

        perms
    }

    /// Decode a `PROT_*` value like it is passed to mmap
    pub fn from_prot(prot: i32) -> Self {
        let mut perms = Perms(0);

        if (prot & libc::PROT_EXEC) != 0 {
            perms.make_executable();
        }

        if (prot & libc::PROT_WRITE) != 0 {
            perms.make_writable();
        }

        if (prot & libc::PROT_READ) != 0 {
            perms.make_readable();
        }

        perms
    }

    pub fn to_segment_flags(self) -> u32 {
        let mut flags = 0;

        if self.is_executable() {
            flags |= PF_X;
        }

        if self.is_writable() {
            flags |= PF_W;
        }

        if self.is_readable() {
            flags |= PF_R;
        }

        flags
    }

    pub fn to_prot(self) -> i32 {
        let mut prot = libc::PROT_NONE;

        if self.is_executable() {
            prot |= libc::PROT_EXEC;
        }

        if self.is_writable() {
            prot |= libc::PROT_WRITE;
        }

        if self.is_readable() {
            prot |= libc::PROT_READ;
        }

        prot
    }

    #[allow(missing_docs)]
    pub fn rwx() -> Self {
        Perms(PERM_R | PERM_W | PERM_X)
    }

    #[allow(missing_docs)]
    pub fn rw() -> Self {
        Perms(PERM_R | PERM_W)
    }

    #[allow(missing_docs)]
    pub fn is_executable(&self) -> bool {
        (self.0 & PERM_X) != 0
    }

    #[allow(missing_docs)]
    pub fn is_writable(&self) -> bool {
        (self.0 & PERM_W) != 0
    }

    #[allow(missing_docs)]
    pub fn is_readable(&self) -> bool {
        (self.0 & PERM_R) != 0
    }

    #[allow(missing_docs)]
    pub fn is_inaccessible(&self) -> bool {
        self.0 == 0
    }

    #[allow(missing_docs)]
    pub fn make_executable(&mut self) {
        self.0 |= PERM_X
    }

    #[allow(missing_docs)]
    pub fn make_readable(&mut self) {
        self.0 |= PERM_R
    }

    #[allow(missing_docs)]
    pub fn make_writable(&mut self) {
        self.0 |= PERM_W
    }
}
