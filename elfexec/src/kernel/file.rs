use std::{
    io,
    path::{
        Path,
        PathBuf,
    },
};

use memmap2::{
    Mmap,
    MmapOptions,
};

use crate::kernel::FileSystemError;

/// A file that was opened for execution
pub trait ExecFile {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes read, 0 at EOF.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn len(&self) -> u64;

    fn path(&self) -> &Path;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens the interpreter of a dynamically linked executable
pub trait FileOpener {
    fn open_exec(&self, path: &Path) -> Result<Box<dyn ExecFile + '_>, FileSystemError>;
}

fn read_slice(content: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let Ok(offset) = usize::try_from(offset) else {
        return 0;
    };

    if offset >= content.len() {
        return 0;
    }

    let count = buf.len().min(content.len() - offset);
    buf[..count].copy_from_slice(&content[offset..offset + count]);
    count
}

/// A file whose content is already in memory
pub struct MemFile<'a> {
    path: PathBuf,
    content: &'a [u8],
}

impl<'a> MemFile<'a> {
    pub fn new<P: Into<PathBuf>>(path: P, content: &'a [u8]) -> Self {
        Self {
            path: path.into(),
            content,
        }
    }
}

impl ExecFile for MemFile<'_> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(read_slice(self.content, offset, buf))
    }

    fn len(&self) -> u64 {
        self.content.len() as u64
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// An ELF file from the host filesystem, mapped into our memory
pub struct MappedElf {
    path: PathBuf,
    map: Mmap,
}

impl MappedElf {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let map = unsafe { MmapOptions::new().map(&file) }?;

        Ok(Self {
            path: path.to_path_buf(),
            map,
        })
    }
}

impl ExecFile for MappedElf {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(read_slice(&self.map, offset, buf))
    }

    fn len(&self) -> u64 {
        self.map.len() as u64
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Opens interpreters from the host filesystem
#[derive(Default)]
pub struct HostOpener;

impl FileOpener for HostOpener {
    fn open_exec(&self, path: &Path) -> Result<Box<dyn ExecFile + '_>, FileSystemError> {
        match MappedElf::open(path) {
            Ok(elf) => Ok(Box::new(elf)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(FileSystemError::NotFound),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Err(FileSystemError::InvalidPermissions),
            Err(err) => Err(FileSystemError::Io(err.to_string())),
        }
    }
}
