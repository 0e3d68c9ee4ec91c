use crate::{
    coredump::structs::NoteHeader,
    elf::bytes,
};

pub const NT_PRSTATUS: u32 = 1;
pub const NT_PRFPREG: u32 = 2;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;
pub const NT_SIGINFO: u32 = 0x53494749;
pub const NT_FILE: u32 = 0x46494c45;
pub const NT_PRXFPREG: u32 = 0x46e62b7f;

/// Owner of the notes that describe the process
pub const NOTE_NAME_CORE: &str = "CORE";
/// Owner of architecture specific register notes
pub const NOTE_NAME_LINUX: &str = "LINUX";

/// Size of `Elf64_Nhdr`
pub const NHDR_SIZE: usize = std::mem::size_of::<NoteHeader>();

fn round4(value: usize) -> usize {
    (value + 3) & !3
}

/// A note that is kept in memory until it is written to the core file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemElfNote {
    name: &'static str,
    note_type: u32,
    data: Vec<u8>,
}

impl MemElfNote {
    pub fn new(name: &'static str, note_type: u32, data: Vec<u8>) -> Self {
        Self {
            name,
            note_type,
            data,
        }
    }

    /// A note owned by "CORE"
    pub fn core(note_type: u32, data: Vec<u8>) -> Self {
        Self::new(NOTE_NAME_CORE, note_type, data)
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn note_type(&self) -> u32 {
        self.note_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The number of bytes the note occupies in the file
    pub fn size(&self) -> usize {
        notesize(self)
    }

    /// Append the header, the NUL terminated name and the payload to `out`
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();

        bytes::append(out, NoteHeader {
            n_namesz: self.name.len() as u32 + 1,
            n_descsz: self.data.len() as u32,
            n_type: self.note_type,
        });
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        bytes::pad(out, 4);
        out.extend_from_slice(&self.data);
        bytes::pad(out, 4);

        debug_assert_eq!(out.len() - start, self.size());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        self.write_to(&mut out);
        out
    }
}

/// Header, NUL terminated name and payload, each padded to 4 bytes
pub fn notesize(note: &MemElfNote) -> usize {
    NHDR_SIZE + round4(note.name.len() + 1) + round4(note.data.len())
}
