use bitflags::bitflags;
use thiserror::Error;

use crate::{
    elf::Perms,
    kernel::ExecFile,
};

bitflags! {
    /// How a mapping request treats the requested address
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Changes are not shared with the file
        const PRIVATE = 1 << 0;
        /// Place the mapping exactly at the address and replace whatever is there
        const FIXED = 1 << 1;
        /// Place the mapping exactly at the address but fail if something is there
        const FIXED_NOREPLACE = 1 << 2;
        /// Writes to the backing file are not allowed while it is mapped
        const DENYWRITE = 1 << 3;
    }
}

impl MapFlags {
    pub fn is_fixed(&self) -> bool {
        self.intersects(MapFlags::FIXED | MapFlags::FIXED_NOREPLACE)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("Invalid range {addr:#x}+{len:#x}")]
    InvalidRange {
        addr: u64,
        len: u64,
    },

    #[error("No space left for {0:#x} bytes")]
    NoSpace(u64),

    #[error("Fault at {0:#x}")]
    Fault(u64),

    #[error("Could not read backing file: {0}")]
    File(String),
}

/// The virtual memory subsystem of the process that is being built.
///
/// All addresses and lengths passed to the mapping functions are page aligned.
/// `write_user`, `clear_user` and `read_user` operate on arbitrary byte ranges and
/// fail with [`MapError::Fault`] if any byte is not mapped with suitable permissions.
pub trait AddressSpace {
    /// Map `len` bytes of `file` starting at `offset` to `addr`. Without a fixed flag `addr` is only a hint
    /// and an address of 0 lets the address space choose. Returns the start of the new mapping.
    fn map_file_region(&mut self, file: &dyn ExecFile, addr: u64, len: u64, perms: Perms, flags: MapFlags, offset: u64) -> Result<u64, MapError>;

    /// Create a zero-filled private mapping
    fn map_anonymous(&mut self, addr: u64, len: u64, perms: Perms, flags: MapFlags) -> Result<u64, MapError>;

    fn unmap_region(&mut self, addr: u64, len: u64) -> Result<(), MapError>;

    /// Reserve the initial stack of the new program at `[addr, addr + len)`
    fn map_stack(&mut self, addr: u64, len: u64, perms: Perms) -> Result<u64, MapError> {
        self.map_anonymous(addr, len, perms, MapFlags::PRIVATE | MapFlags::FIXED)
    }

    /// Create zero-filled, writable heap pages at `[start, start + len)`
    fn extend_break(&mut self, start: u64, len: u64) -> Result<(), MapError>;

    fn clear_user(&mut self, addr: u64, len: u64) -> Result<(), MapError>;

    fn write_user(&mut self, addr: u64, data: &[u8]) -> Result<(), MapError>;

    fn read_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), MapError>;

    /// Tear down everything that belongs to the previous program
    fn discard_image(&mut self) -> Result<(), MapError>;
}
