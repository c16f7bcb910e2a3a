//! OS abstraction layer: file-system and in-memory VFS

pub mod vfs;
