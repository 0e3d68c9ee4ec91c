use crate::{
    coredump::{
        note::{
            MemElfNote,
            NT_FILE,
        },
        process::MemoryRegion,
        structs::{
            FileNoteEntry,
            FileNoteHead,
        },
    },
    elf::{
        bytes,
        round_up,
    },
};

/// The FILE note is dropped instead of growing beyond this
pub const MAX_FILE_NOTE_SIZE: u64 = 4 * 1024 * 1024;

/// Bytes reserved per mapping when the buffer size is first estimated
const BYTES_PER_MAPPING: u64 = 64;

/// Build the `NT_FILE` note for all file backed regions.
///
/// The payload is the number of entries and the page size, followed by one
/// (start, end, offset in pages) triple per entry and the NUL separated paths.
/// The size of the buffer is estimated from the number of regions and grown when the paths do not fit.
/// Returns `None` once the estimate exceeds [`MAX_FILE_NOTE_SIZE`].
pub fn fill_files_note(regions: &[MemoryRegion], page_size: u64) -> Option<MemElfNote> {
    let map_count = regions.len() as u64;
    let names_ofs = (2 + 3 * map_count) * 8;
    let mut size = map_count * BYTES_PER_MAPPING;

    'alloc: loop {
        if size >= MAX_FILE_NOTE_SIZE {
            return None;
        }

        size = round_up(size, page_size);

        let mut remaining = size.saturating_sub(names_ofs);
        let mut triples = Vec::new();
        let mut names = Vec::new();

        for region in regions {
            let Some(path) = &region.file else {
                continue;
            };

            let name = path.to_string_lossy();
            let n = name.len() as u64 + 1;

            if n > remaining {
                size = size * 5 / 4;
                continue 'alloc;
            }

            remaining -= n;
            names.extend_from_slice(name.as_bytes());
            names.push(0);
            triples.push(FileNoteEntry {
                start: region.start,
                end: region.end,
                pgoff: region.pgoff,
            });
        }

        let mut data = Vec::with_capacity(bytes::size_of::<FileNoteHead>() + triples.len() * bytes::size_of::<FileNoteEntry>() + names.len());
        bytes::append(&mut data, FileNoteHead {
            count: triples.len() as u64,
            page_size,
        });

        for entry in triples {
            bytes::append(&mut data, entry);
        }

        data.extend_from_slice(&names);

        return Some(MemElfNote::core(NT_FILE, data));
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::coredump::process::VmFlags;

    fn region(start: u64, file: Option<&str>, pgoff: u64) -> MemoryRegion {
        MemoryRegion {
            start,
            end: start + 0x1000,
            flags: VmFlags::READ,
            pgoff,
            file: file.map(PathBuf::from),
            anonymous_pages: false,
            special: None,
        }
    }

    fn u64_at(data: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn entries_and_names() {
        let regions = vec![region(0x10000, Some("/bin/prog"), 0), region(0x20000, None, 0), region(0x30000, Some("/lib/libc.so"), 3)];
        let note = fill_files_note(&regions, 4096).unwrap();
        let data = note.data();

        assert_eq!(u64_at(data, 0), 2);
        assert_eq!(u64_at(data, 8), 4096);
        assert_eq!((u64_at(data, 16), u64_at(data, 24), u64_at(data, 32)), (0x10000, 0x11000, 0));
        assert_eq!((u64_at(data, 40), u64_at(data, 48), u64_at(data, 56)), (0x30000, 0x31000, 3));
        assert_eq!(&data[64..], b"/bin/prog\0/lib/libc.so\0");
    }

    #[test]
    fn grows_for_long_paths() {
        let long = format!("/{}", "a".repeat(5000));
        let regions = vec![region(0x10000, Some(&long), 0)];
        let note = fill_files_note(&regions, 4096).unwrap();
        assert_eq!(note.data().len(), 16 + 24 + long.len() + 1);
    }

    #[test]
    fn too_large() {
        let long = format!("/{}", "a".repeat(MAX_FILE_NOTE_SIZE as usize));
        assert!(fill_files_note(&[region(0x10000, Some(&long), 0)], 4096).is_none());
        assert_eq!(fill_files_note(&[], 4096).unwrap().data().len(), 16);
    }
}
