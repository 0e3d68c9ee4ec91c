use std::{
    collections::HashMap,
    ffi::{
        OsStr,
        OsString,
    },
    path::{
        Component,
        Path,
        PathBuf,
    },
};

use thiserror::Error;

use crate::kernel::{
    ExecFile,
    FileOpener,
    MemFile,
};

pub const PERM_NONE: u8 = 0;
pub const PERM_R: u8 = 4;
pub const PERM_W: u8 = 2;
pub const PERM_X: u8 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileSystemError {
    #[error("Not found")]
    NotFound,

    #[error("Not a directory")]
    NotADirectory,

    #[error("Duplicate name")]
    DuplicateName,

    #[error("Invalid name")]
    InvalidName,

    #[error("Not a file")]
    NotAFile,

    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Invalid permissions")]
    InvalidPermissions,

    #[error("IO error: {0}")]
    Io(String),
}

#[derive(Copy, Clone, Debug)]
#[repr(transparent)]
struct TreeIndex(usize);

#[derive(Clone, Debug)]
pub struct File {
    content: Vec<u8>,
    perms: u8,
}

impl File {
    pub fn perms(&self) -> u8 {
        self.perms
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut Vec<u8> {
        &mut self.content
    }
}

#[derive(Clone, Debug)]
pub struct Directory {
    perms: u8,
    parent: TreeIndex,
    children: HashMap<OsString, TreeIndex>,
}

#[derive(Clone, Debug)]
enum Node {
    File(File),
    Directory(Directory),
}

#[derive(Copy, Clone, Debug)]
pub struct DirHandle(TreeIndex);

#[derive(Copy, Clone, Debug)]
#[repr(transparent)]
pub struct FileHandle(TreeIndex);

/// A minimal in-memory filesystem that executables and interpreters are loaded from
pub struct Fs {
    tree: Vec<Node>,
    root: TreeIndex,
}

impl Fs {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let root = Directory {
            perms: PERM_R | PERM_W | PERM_X,
            parent: TreeIndex(0),
            children: HashMap::default(),
        };

        Self {
            tree: vec![Node::Directory(root)],
            root: TreeIndex(0),
        }
    }

    fn find_tree_index(&self, path: &Path) -> Option<TreeIndex> {
        let mut cursor = self.root;

        for comp in path.components() {
            let node = self.tree.get(cursor.0)?;

            /* Move to next node */
            match comp {
                Component::Prefix(_) => return None,
                Component::RootDir | Component::CurDir => {},
                Component::ParentDir => match node {
                    Node::Directory(dir) => cursor = dir.parent,
                    _ => return None,
                },
                Component::Normal(name) => match node {
                    Node::Directory(dir) => {
                        if (dir.perms & PERM_X) == 0 {
                            return None;
                        }

                        cursor = *dir.children.get(name)?;
                    },
                    _ => return None,
                },
            }
        }

        Some(cursor)
    }

    pub fn root(&self) -> DirHandle {
        DirHandle(self.root)
    }

    pub fn get_file_handle<P: AsRef<Path>>(&self, path: P) -> Result<FileHandle, FileSystemError> {
        let idx = self.find_tree_index(path.as_ref()).ok_or(FileSystemError::NotFound)?;

        match &self.tree[idx.0] {
            Node::File(_) => Ok(FileHandle(idx)),
            _ => Err(FileSystemError::NotAFile),
        }
    }

    fn add_child<S: Into<OsString> + AsRef<OsStr>>(&mut self, parent: DirHandle, name: S, node: Node) -> Result<TreeIndex, FileSystemError> {
        if name.as_ref().is_empty() {
            return Err(FileSystemError::InvalidName);
        }

        let tree_len = self.tree.len();

        /* Verify parent directory */
        let Some(Node::Directory(dir)) = self.tree.get_mut(parent.0 .0) else {
            return Err(FileSystemError::InvalidHandle);
        };

        if (dir.perms & PERM_W) == 0 {
            return Err(FileSystemError::InvalidPermissions);
        } else if dir.children.contains_key(name.as_ref()) {
            return Err(FileSystemError::DuplicateName);
        }

        dir.children.insert(name.into(), TreeIndex(tree_len));
        self.tree.push(node);

        Ok(TreeIndex(tree_len))
    }

    pub fn mkdir<S: Into<OsString> + AsRef<OsStr>>(&mut self, parent: DirHandle, name: S, perms: u8) -> Result<DirHandle, FileSystemError> {
        let dir = Directory {
            perms,
            parent: parent.0,
            children: HashMap::default(),
        };
        self.add_child(parent, name, Node::Directory(dir)).map(DirHandle)
    }

    pub fn touch<S: Into<OsString> + AsRef<OsStr>>(&mut self, parent: DirHandle, name: S, perms: u8) -> Result<FileHandle, FileSystemError> {
        let file = File {
            content: Vec::new(),
            perms,
        };
        self.add_child(parent, name, Node::File(file)).map(FileHandle)
    }

    /// Create `path` with all missing parent directories and store `content` in it
    pub fn install<P: AsRef<Path>, C: Into<Vec<u8>>>(&mut self, path: P, content: C, perms: u8) -> Result<FileHandle, FileSystemError> {
        let path = path.as_ref();
        let filename = path.file_name().ok_or(FileSystemError::InvalidName)?;
        let mut dir = self.root();

        if let Some(parent) = path.parent() {
            for comp in parent.components() {
                let Component::Normal(name) = comp else {
                    continue;
                };

                dir = match self.lookup_child(dir, name) {
                    Ok(idx) if matches!(self.tree[idx.0], Node::Directory(_)) => DirHandle(idx),
                    Ok(_) => return Err(FileSystemError::NotADirectory),
                    Err(_) => self.mkdir(dir, name, PERM_R | PERM_W | PERM_X)?,
                };
            }
        }

        let handle = self.touch(dir, filename, perms)?;
        *self.file_mut(handle)?.content_mut() = content.into();
        Ok(handle)
    }

    fn lookup_child(&self, dir: DirHandle, name: &OsStr) -> Result<TreeIndex, FileSystemError> {
        match &self.tree[dir.0 .0] {
            Node::Directory(dir) => dir.children.get(name).copied().ok_or(FileSystemError::NotFound),
            _ => Err(FileSystemError::NotADirectory),
        }
    }

    pub fn file(&self, handle: FileHandle) -> Result<&File, FileSystemError> {
        match self.tree.get(handle.0 .0) {
            Some(Node::File(file)) => Ok(file),
            Some(_) => Err(FileSystemError::NotAFile),
            None => Err(FileSystemError::InvalidHandle),
        }
    }

    pub fn file_mut(&mut self, handle: FileHandle) -> Result<&mut File, FileSystemError> {
        match self.tree.get_mut(handle.0 .0) {
            Some(Node::File(file)) => Ok(file),
            Some(_) => Err(FileSystemError::NotAFile),
            None => Err(FileSystemError::InvalidHandle),
        }
    }

    /// Open a file for execution. The file must be readable and executable.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<MemFile<'_>, FileSystemError> {
        let path = path.as_ref();
        let file = self.file(self.get_file_handle(path)?)?;

        if (file.perms & (PERM_R | PERM_X)) != (PERM_R | PERM_X) {
            return Err(FileSystemError::InvalidPermissions);
        }

        Ok(MemFile::new(PathBuf::from(path), file.content()))
    }
}

impl FileOpener for Fs {
    fn open_exec(&self, path: &Path) -> Result<Box<dyn ExecFile + '_>, FileSystemError> {
        Ok(Box::new(self.open(path)?))
    }
}
