//! Virtual File System trait and types
//!
//! The storage device abstraction consumed by the pager. Two implementations
//! ship with the crate: [`StdVfs`] over `std::fs` and [`MemVfs`], whose files
//! live on the heap for as long as the `MemVfs` itself.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::{Error, ErrorCode, Result};

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Flags for opening files
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READONLY     = 0x00000001;
        const READWRITE    = 0x00000002;
        const CREATE       = 0x00000004;
        const MEMORY       = 0x00000080;
        const MAIN_DB      = 0x00000100;
        const MAIN_JOURNAL = 0x00000800;
    }
}

bitflags! {
    /// Flags for file sync operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x00002;
        const FULL     = 0x00003;
        const DATAONLY = 0x00010;
    }
}

// ============================================================================
// Traits
// ============================================================================

/// An open file.
pub trait VfsFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; bytes past end of file read as zero.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `buf` at `offset`, extending the file if needed.
    fn write(&self, buf: &[u8], offset: u64) -> Result<()>;

    fn truncate(&self, size: u64) -> Result<()>;

    fn sync(&self, flags: SyncFlags) -> Result<()>;

    fn file_size(&self) -> Result<u64>;
}

/// A file system.
pub trait Vfs: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Box<dyn VfsFile>>;

    fn delete(&self, path: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> Result<bool>;

    /// Canonical name used to recognise two opens of the same file.
    fn full_pathname(&self, path: &Path) -> Result<PathBuf>;
}

// ============================================================================
// std::fs implementation
// ============================================================================

/// VFS backed by the operating system's file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdVfs;

struct StdFile {
    file: Mutex<File>,
}

impl VfsFile for StdFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf[total..].fill(0);
        Ok(total)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.file.lock().set_len(size)?;
        Ok(())
    }

    fn sync(&self, flags: SyncFlags) -> Result<()> {
        let file = self.file.lock();
        if flags.contains(SyncFlags::DATAONLY) {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

impl Vfs for StdVfs {
    fn name(&self) -> &str {
        "std"
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !flags.contains(OpenFlags::READONLY) {
            options.write(true);
            if flags.contains(OpenFlags::CREATE) {
                options.create(true);
            }
        }
        let file = options.open(path).map_err(|e| {
            Error::with_message(
                ErrorCode::CantOpen,
                format!("{}: {}", path.display(), e),
            )
        })?;
        Ok(Box::new(StdFile {
            file: Mutex::new(file),
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        if let Ok(canon) = path.canonicalize() {
            return Ok(canon);
        }
        // Not created yet: canonicalize the directory instead.
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        let dir = match parent {
            Some(p) => p.canonicalize()?,
            None => std::env::current_dir()?,
        };
        match path.file_name() {
            Some(name) => Ok(dir.join(name)),
            None => Err(Error::with_message(
                ErrorCode::CantOpen,
                format!("not a file name: {}", path.display()),
            )),
        }
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Heap-backed file content.
#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VfsFile for MemFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        buf[n..].fill(0);
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut data = self.data.lock();
        let end = (offset as usize)
            .checked_add(buf.len())
            .ok_or_else(|| Error::new(ErrorCode::NoMem))?;
        if data.len() < end {
            let extra = end - data.len();
            data.try_reserve(extra).map_err(|_| Error::new(ErrorCode::NoMem))?;
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.data.lock().truncate(size as usize);
        Ok(())
    }

    fn sync(&self, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}

/// Shares one [`MemFile`] between several handles.
struct MemHandle(Arc<MemFile>);

impl VfsFile for MemHandle {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.0.read(buf, offset)
    }
    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.0.write(buf, offset)
    }
    fn truncate(&self, size: u64) -> Result<()> {
        self.0.truncate(size)
    }
    fn sync(&self, flags: SyncFlags) -> Result<()> {
        self.0.sync(flags)
    }
    fn file_size(&self) -> Result<u64> {
        self.0.file_size()
    }
}

/// Named in-memory file system. Files persist as long as the `MemVfs` does.
pub struct MemVfs {
    /// Unique per instance, so two `MemVfs` never alias each other's files
    name: String,
    files: Mutex<HashMap<PathBuf, Arc<MemFile>>>,
}

static NEXT_MEM_VFS: AtomicU64 = AtomicU64::new(1);

impl MemVfs {
    pub fn new() -> Self {
        Self {
            name: format!("memory-{}", NEXT_MEM_VFS.fetch_add(1, Ordering::Relaxed)),
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for MemVfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(path) {
            return Ok(Box::new(MemHandle(Arc::clone(file))));
        }
        if !flags.contains(OpenFlags::CREATE) {
            return Err(Error::with_message(
                ErrorCode::CantOpen,
                format!("{}: no such file", path.display()),
            ));
        }
        let file = Arc::new(MemFile::new());
        files.insert(path.to_path_buf(), Arc::clone(&file));
        Ok(Box::new(MemHandle(file)))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.files.lock().contains_key(path))
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_file_reads_zero_past_end() {
        let file = MemFile::new();
        file.write(b"abc", 2).unwrap();
        let mut buf = [0xffu8; 8];
        let n = file.read(&mut buf, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, &[0, 0, b'a', b'b', b'c', 0, 0, 0]);
        assert_eq!(file.file_size().unwrap(), 5);
    }

    #[test]
    fn test_mem_file_write_grows_then_overwrites() {
        let file = MemFile::new();
        file.write(&[1u8; 4], 0).unwrap();
        file.write(&[2u8; 4], 2).unwrap();
        file.write(&[3u8; 2], 10).unwrap();
        let mut buf = [0xffu8; 12];
        assert_eq!(file.read(&mut buf, 0).unwrap(), 12);
        assert_eq!(&buf, &[1, 1, 2, 2, 2, 2, 0, 0, 0, 0, 3, 3]);
        assert_eq!(file.write(b"x", u64::MAX).unwrap_err().code, ErrorCode::NoMem);
        assert_eq!(file.file_size().unwrap(), 12);
    }

    #[test]
    fn test_mem_vfs_shares_content_between_handles() {
        let vfs = MemVfs::new();
        let path = Path::new("db");
        let a = vfs.open(path, OpenFlags::CREATE | OpenFlags::READWRITE).unwrap();
        let b = vfs.open(path, OpenFlags::READWRITE).unwrap();
        a.write(b"page", 0).unwrap();
        let mut buf = [0u8; 4];
        b.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"page");
        assert!(vfs.exists(path).unwrap());
        vfs.delete(path).unwrap();
        assert!(!vfs.exists(path).unwrap());
    }

    #[test]
    fn test_mem_vfs_open_missing_without_create_fails() {
        let vfs = MemVfs::new();
        let err = vfs.open(Path::new("nope"), OpenFlags::READWRITE).err().unwrap();
        assert_eq!(err.code, ErrorCode::CantOpen);
    }

    #[test]
    fn test_std_vfs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.db");
        let vfs = StdVfs;
        let file = vfs.open(&path, OpenFlags::CREATE | OpenFlags::READWRITE).unwrap();
        file.write(&[7u8; 16], 512).unwrap();
        assert_eq!(file.file_size().unwrap(), 528);
        file.truncate(512).unwrap();
        file.sync(SyncFlags::NORMAL).unwrap();
        assert_eq!(file.file_size().unwrap(), 512);
        assert_eq!(vfs.full_pathname(&path).unwrap(), path.canonicalize().unwrap());
    }
}
