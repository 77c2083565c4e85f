use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::pagecache::PageId;

pub mod adversary;
pub mod disk;
pub mod memory;

/// A file system the page cache moves pages to and from. Files are plain
/// byte arrays addressed by path; the cache only ever talks to them in whole
/// file pages through a [`PageSwapper`].
///
/// The FileSystem trait is designed as `trait object` compatible so that the
/// cache can be handed an `Arc<dyn FileSystem>` and stay agnostic of whether
/// it runs on disk, in memory or behind an adversary.
pub trait FileSystem: Debug + Send + Sync {
    /// Open the file at the given path for paged access with the given file
    /// page size. The file is created if it does not exist and `create` is
    /// set, otherwise a missing file is an error.
    fn open(&self, path: &Path, page_size: usize, create: bool) -> Result<Box<dyn PageSwapper>>;

    /// Check if a file exists at the given path.
    fn exists(&self, path: &Path) -> bool;

    /// Delete the file at the given path, missing files are ignored.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Read the whole content of the file, bypassing any cache. Used by
    /// verification tooling to look at what actually reached the storage.
    fn read_all(&self, path: &Path) -> Result<Vec<u8>>;

    /// Overwrite the whole content of the file.
    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()>;
}

/// Moves whole file pages between a frame buffer and one open file.
///
/// Page `n` lives at byte offset `n * page_size`. Reading a page that is
/// partially or entirely beyond the end of the file fills the missing bytes
/// with zeros. Writing a page beyond the end of the file extends it.
pub trait PageSwapper: Debug + Send + Sync {
    /// The path of the file this swapper is bound to.
    fn path(&self) -> &Path;

    /// The file page size this swapper was opened with.
    fn page_size(&self) -> usize;

    /// Read the page into the given buffer, returns the number of bytes that
    /// were actually present in the file.
    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<usize>;

    /// Write the buffer as the content of the given page.
    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<()>;

    /// Force all written data down to the durable medium.
    fn force(&self) -> Result<()>;

    /// Current size of the file in bytes.
    fn len(&self) -> Result<u64>;

    /// Release the underlying file handle. Further calls are errors.
    fn close(&self) -> Result<()>;
}

/// Compute the byte offset of the given page for the given page size.
pub fn page_offset(page_id: PageId, page_size: usize) -> u64 {
    page_id * page_size as u64
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    Disk,
}

/// Create a file system of the given type. Disk file systems resolve
/// relative paths against `root`.
pub fn new_filesystem(typ: StorageType, root: impl Into<PathBuf>) -> Result<Arc<dyn FileSystem>> {
    match typ {
        StorageType::Memory => Ok(Arc::new(memory::MemoryFileSystem::new())),
        StorageType::Disk => Ok(Arc::new(disk::DiskFileSystem::new(root)?)),
    }
}
