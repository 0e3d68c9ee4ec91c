use scroll::{
    Pwrite,
    SizeWith,
};

use crate::elf::bytes;

/// The keys of the auxiliary vector
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AuxKey {
    Null,
    ExecFd,
    Phdr,
    Phent,
    Phnum,
    Pagesz,
    Base,
    Flags,
    Entry,
    Uid,
    Euid,
    Gid,
    Egid,
    Platform,
    Hwcap,
    Clktck,
    Secure,
    BasePlatform,
    Random,
    Hwcap2,
    ExecFn,
    SysinfoEhdr,
}

impl AuxKey {
    pub fn id(&self) -> u64 {
        match self {
            AuxKey::Null => 0,
            AuxKey::ExecFd => 2,
            AuxKey::Phdr => 3,
            AuxKey::Phent => 4,
            AuxKey::Phnum => 5,
            AuxKey::Pagesz => 6,
            AuxKey::Base => 7,
            AuxKey::Flags => 8,
            AuxKey::Entry => 9,
            AuxKey::Uid => 11,
            AuxKey::Euid => 12,
            AuxKey::Gid => 13,
            AuxKey::Egid => 14,
            AuxKey::Platform => 15,
            AuxKey::Hwcap => 16,
            AuxKey::Clktck => 17,
            AuxKey::Secure => 23,
            AuxKey::BasePlatform => 24,
            AuxKey::Random => 25,
            AuxKey::Hwcap2 => 26,
            AuxKey::ExecFn => 31,
            AuxKey::SysinfoEhdr => 33,
        }
    }
}

/// `Elf64_auxv_t`
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pwrite, SizeWith)]
struct RawAuxv {
    a_type: u64,
    a_val: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AuxEntry {
    pub key: AuxKey,
    pub value: u64,
}

/// An auxiliary vector under construction. Every key appears at most once,
/// setting a key again overwrites its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuxVector {
    entries: Vec<AuxEntry>,
}

impl AuxVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: AuxKey, value: u64) {
        debug_assert_ne!(key, AuxKey::Null);

        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.key == key) {
            entry.value = value;
        } else {
            self.entries.push(AuxEntry {
                key,
                value,
            });
        }
    }

    pub fn get(&self, key: AuxKey) -> Option<u64> {
        self.entries.iter().find(|entry| entry.key == key).map(|entry| entry.value)
    }

    /// The entries without the terminator
    pub fn entries(&self) -> &[AuxEntry] {
        &self.entries
    }

    /// Number of machine words the vector occupies including the terminating null pair
    pub fn words(&self) -> usize {
        (self.entries.len() + 1) * 2
    }

    /// The (key, value) pairs as they appear in memory, terminated by the null pair
    pub fn to_pairs(&self) -> Vec<(u64, u64)> {
        self.entries.iter().map(|entry| (entry.key.id(), entry.value)).chain(std::iter::once((AuxKey::Null.id(), 0))).collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.words() * 8);

        for (a_type, a_val) in self.to_pairs() {
            bytes::append(&mut out, RawAuxv {
                a_type,
                a_val,
            });
        }

        out
    }
}
