use std::{
    collections::BTreeMap,
    path::PathBuf,
};

use rustc_hash::FxHashMap as HashMap;

use crate::{
    elf::{
        Arch,
        Perms,
    },
    kernel::{
        AddressSpace,
        ExecFile,
        MapError,
        MapFlags,
    },
};

/// Distance between the top of the address space and the first address handed out by the mmap allocator
const STACK_GAP: u64 = 128 * 1024 * 1024;

/// What a mapping is backed by
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MappingKind {
    Anonymous,
    File {
        path: PathBuf,
        /// File offset of the first byte of the mapping
        offset: u64,
    },
    Heap,
    Stack,
    /// Kernel provided code like the vDSO
    Special(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub kind: MappingKind,
    pub shared: bool,
    /// Set once something wrote to the mapping after it was created
    pub written: bool,
}

impl Mapping {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn split_off(&mut self, at: u64) -> Mapping {
        debug_assert!(self.start < at && at < self.end);

        let mut upper = self.clone();
        upper.start = at;

        if let MappingKind::File {
            offset,
            ..
        } = &mut upper.kind
        {
            *offset += at - self.start;
        }

        self.end = at;
        upper
    }
}

/// A page-granular simulation of a user address space.
///
/// Pages are only backed by memory once they are touched. Pages of a mapping that were
/// never touched read as zeros and are reported as absent to the core dumper.
pub struct SimAddressSpace {
    arch: Arch,
    mappings: BTreeMap<u64, Mapping>,
    pages: HashMap<u64, Box<[u8]>>,
    mmap_base: u64,
}

impl SimAddressSpace {
    pub fn new(arch: Arch) -> Self {
        let mmap_base = arch.page_start(arch.task_size() - STACK_GAP);

        Self {
            arch,
            mappings: BTreeMap::new(),
            pages: HashMap::default(),
            mmap_base,
        }
    }

    pub fn arch(&self) -> &Arch {
        &self.arch
    }

    /// Move the address below which the mmap allocator searches for free space
    pub fn set_mmap_base(&mut self, base: u64) {
        self.mmap_base = self.arch.page_start(base.min(self.arch.task_size()));
    }

    pub fn mmap_base(&self) -> u64 {
        self.mmap_base
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    pub fn mapping_at(&self, addr: u64) -> Option<&Mapping> {
        let (_, mapping) = self.mappings.range(..=addr).next_back()?;

        if addr < mapping.end {
            Some(mapping)
        } else {
            None
        }
    }

    fn mapping_at_mut(&mut self, addr: u64) -> Option<&mut Mapping> {
        let (_, mapping) = self.mappings.range_mut(..=addr).next_back()?;

        if addr < mapping.end {
            Some(mapping)
        } else {
            None
        }
    }

    /// The content of the page at `addr` if it was ever touched
    pub fn page(&self, addr: u64) -> Option<&[u8]> {
        self.pages.get(&self.arch.page_start(addr)).map(|page| &page[..])
    }

    /// Number of pages that are backed by memory
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    /// Map a kernel provided blob like the vDSO somewhere into the address space
    pub fn map_special<S: Into<String>>(&mut self, name: S, content: &[u8]) -> Result<u64, MapError> {
        let len = self.arch.page_align(content.len().max(1) as u64);
        let addr = self.place(0, len, MapFlags::PRIVATE)?;

        self.insert(Mapping {
            start: addr,
            end: addr + len,
            perms: Perms::from_prot(libc::PROT_READ | libc::PROT_EXEC),
            kind: MappingKind::Special(name.into()),
            shared: false,
            written: false,
        });
        self.store(addr, content);

        Ok(addr)
    }

    fn check_range(&self, addr: u64, len: u64) -> Result<(), MapError> {
        let err = MapError::InvalidRange {
            addr,
            len,
        };

        if len == 0 || self.arch.page_offset(addr) != 0 || self.arch.page_offset(len) != 0 {
            return Err(err);
        }

        match addr.checked_add(len) {
            Some(end) if end <= self.arch.task_size() => Ok(()),
            _ => Err(err),
        }
    }

    fn is_free(&self, start: u64, end: u64) -> bool {
        if let Some((_, mapping)) = self.mappings.range(..end).next_back() {
            mapping.end <= start
        } else {
            true
        }
    }

    /// Top-down search for a gap of `len` bytes below the mmap base
    fn find_free(&self, len: u64) -> Result<u64, MapError> {
        let mut top = self.mmap_base;

        for mapping in self.mappings.range(..top).map(|(_, m)| m).rev() {
            if mapping.end <= top && top - mapping.end >= len {
                return Ok(top - len);
            }

            top = top.min(mapping.start);
        }

        /* Never hand out the zero page */
        if top >= len + self.arch.page_size() {
            Ok(top - len)
        } else {
            Err(MapError::NoSpace(len))
        }
    }

    fn place(&mut self, addr: u64, len: u64, flags: MapFlags) -> Result<u64, MapError> {
        if flags.contains(MapFlags::FIXED_NOREPLACE) {
            self.check_range(addr, len)?;

            if !self.is_free(addr, addr + len) {
                return Err(MapError::InvalidRange {
                    addr,
                    len,
                });
            }

            Ok(addr)
        } else if flags.contains(MapFlags::FIXED) {
            self.check_range(addr, len)?;
            self.remove_range(addr, addr + len);
            Ok(addr)
        } else {
            let hint = self.arch.page_start(addr);

            if hint != 0 && self.check_range(hint, len).is_ok() && self.is_free(hint, hint + len) {
                Ok(hint)
            } else {
                self.find_free(self.arch.page_align(len))
            }
        }
    }

    fn insert(&mut self, mapping: Mapping) {
        debug_assert!(self.is_free(mapping.start, mapping.end));
        self.mappings.insert(mapping.start, mapping);
    }

    fn remove_range(&mut self, start: u64, end: u64) {
        /* Split mappings that stick out of the range */
        if let Some(mapping) = self.mapping_at_mut(start) {
            if mapping.start < start {
                let upper = mapping.split_off(start);
                self.mappings.insert(upper.start, upper);
            }
        }

        if let Some(mapping) = self.mapping_at_mut(end) {
            if mapping.start < end {
                let upper = mapping.split_off(end);
                self.mappings.insert(upper.start, upper);
            }
        }

        let doomed: Vec<u64> = self.mappings.range(start..end).map(|(key, _)| *key).collect();

        for key in doomed {
            self.mappings.remove(&key);
        }

        /* Release the backing pages */
        let page_size = self.arch.page_size();

        if (end - start) / page_size > self.pages.len() as u64 {
            self.pages.retain(|addr, _| *addr < start || *addr >= end);
        } else {
            let mut addr = start;

            while addr < end {
                self.pages.remove(&addr);
                addr += page_size;
            }
        }
    }

    fn page_mut(&mut self, addr: u64) -> &mut [u8] {
        let page_size = self.arch.page_size() as usize;
        self.pages.entry(self.arch.page_start(addr)).or_insert_with(|| vec![0; page_size].into_boxed_slice())
    }

    /// Copy `data` to `addr` without any permission checks
    fn store(&mut self, mut addr: u64, mut data: &[u8]) {
        while !data.is_empty() {
            let offset = self.arch.page_offset(addr) as usize;
            let count = data.len().min(self.arch.page_size() as usize - offset);

            self.page_mut(addr)[offset..offset + count].copy_from_slice(&data[..count]);

            data = &data[count..];
            addr += count as u64;
        }
    }

    /// Verify that `[addr, addr + len)` is covered by mappings and mark them as written if `write` is set
    fn check_access(&mut self, addr: u64, len: u64, write: bool) -> Result<(), MapError> {
        let end = addr.checked_add(len).ok_or(MapError::Fault(addr))?;
        let mut cursor = addr;

        while cursor < end {
            let mapping = self.mapping_at_mut(cursor).ok_or(MapError::Fault(cursor))?;

            if write {
                if !mapping.perms.is_writable() {
                    return Err(MapError::Fault(cursor));
                }

                mapping.written = true;
            }

            cursor = mapping.end;
        }

        Ok(())
    }
}

impl AddressSpace for SimAddressSpace {
    fn map_file_region(&mut self, file: &dyn ExecFile, addr: u64, len: u64, perms: Perms, flags: MapFlags, offset: u64) -> Result<u64, MapError> {
        if self.arch.page_offset(offset) != 0 {
            return Err(MapError::InvalidRange {
                addr,
                len,
            });
        }

        let len = self.arch.page_align(len);
        let addr = self.place(addr, len, flags)?;

        /* Populate the pages that have file content */
        let page_size = self.arch.page_size();
        let mut buf = vec![0u8; page_size as usize];
        let mut page = 0;

        while page < len {
            let count = file.read_at(offset + page, &mut buf).map_err(|err| MapError::File(err.to_string()))?;

            if count == 0 {
                break;
            }

            buf[count..].fill(0);
            self.page_mut(addr + page).copy_from_slice(&buf);
            page += page_size;
        }

        self.insert(Mapping {
            start: addr,
            end: addr + len,
            perms,
            kind: MappingKind::File {
                path: file.path().to_path_buf(),
                offset,
            },
            shared: !flags.contains(MapFlags::PRIVATE),
            written: false,
        });

        Ok(addr)
    }

    fn map_anonymous(&mut self, addr: u64, len: u64, perms: Perms, flags: MapFlags) -> Result<u64, MapError> {
        let len = self.arch.page_align(len);
        let addr = self.place(addr, len, flags)?;

        self.insert(Mapping {
            start: addr,
            end: addr + len,
            perms,
            kind: MappingKind::Anonymous,
            shared: !flags.contains(MapFlags::PRIVATE),
            written: false,
        });

        Ok(addr)
    }

    fn map_stack(&mut self, addr: u64, len: u64, perms: Perms) -> Result<u64, MapError> {
        let len = self.arch.page_align(len);
        let addr = self.place(addr, len, MapFlags::PRIVATE | MapFlags::FIXED)?;

        self.insert(Mapping {
            start: addr,
            end: addr + len,
            perms,
            kind: MappingKind::Stack,
            shared: false,
            written: false,
        });

        Ok(addr)
    }

    fn unmap_region(&mut self, addr: u64, len: u64) -> Result<(), MapError> {
        let len = self.arch.page_align(len);

        if len == 0 {
            return Ok(());
        }

        self.check_range(addr, len)?;
        self.remove_range(addr, addr + len);
        Ok(())
    }

    fn extend_break(&mut self, start: u64, len: u64) -> Result<(), MapError> {
        let len = self.arch.page_align(len);

        if len == 0 {
            return Ok(());
        }

        self.check_range(start, len)?;
        self.remove_range(start, start + len);

        /* Grow an adjacent heap instead of creating a second one */
        if let Some(heap) = start.checked_sub(1).and_then(|prev| self.mapping_at_mut(prev)) {
            if heap.kind == MappingKind::Heap {
                heap.end = start + len;
                return Ok(());
            }
        }

        self.insert(Mapping {
            start,
            end: start + len,
            perms: Perms::rw(),
            kind: MappingKind::Heap,
            shared: false,
            written: false,
        });

        Ok(())
    }

    fn clear_user(&mut self, addr: u64, len: u64) -> Result<(), MapError> {
        self.check_access(addr, len, true)?;

        let zeros = vec![0u8; len as usize];
        self.store(addr, &zeros);
        Ok(())
    }

    fn write_user(&mut self, addr: u64, data: &[u8]) -> Result<(), MapError> {
        self.check_access(addr, data.len() as u64, true)?;
        self.store(addr, data);
        Ok(())
    }

    fn read_user(&self, mut addr: u64, mut buf: &mut [u8]) -> Result<(), MapError> {
        while !buf.is_empty() {
            if self.mapping_at(addr).is_none() {
                return Err(MapError::Fault(addr));
            }

            let offset = self.arch.page_offset(addr) as usize;
            let count = buf.len().min(self.arch.page_size() as usize - offset);

            match self.page(addr) {
                Some(page) => buf[..count].copy_from_slice(&page[offset..offset + count]),
                None => buf[..count].fill(0),
            }

            buf = &mut buf[count..];
            addr += count as u64;
        }

        Ok(())
    }

    fn discard_image(&mut self) -> Result<(), MapError> {
        self.mappings.clear();
        self.pages.clear();
        Ok(())
    }
}
