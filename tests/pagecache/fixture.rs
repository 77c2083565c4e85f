use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use pagecache::config::CacheOptions;
use pagecache::error::Result;
use pagecache::pagecache::{LockMode, MappedFile, PageCache, PageId};
use pagecache::storage::adversary::{AdversarialFileSystem, Adversary, AdversaryRates};
use pagecache::storage::memory::MemoryFileSystem;
use pagecache::storage::FileSystem;

/// A cache over an in-memory file system, with an adversary sitting in
/// between that stays quiet unless rates are given.
pub struct Fixture {
    pub mem: Arc<MemoryFileSystem>,
    pub adversary: Arc<Adversary>,
    pub cache: PageCache,
}

impl Fixture {
    pub fn options() -> CacheOptions {
        CacheOptions { eviction_timeout_ms: 5_000, unmap_timeout_ms: 5_000, ..Default::default() }
    }

    pub fn new(
        pages: usize,
        page_size: usize,
        options: CacheOptions,
        rates: Option<AdversaryRates>,
    ) -> Result<Fixture> {
        let mem = Arc::new(MemoryFileSystem::new());
        let adversary = Arc::new(Adversary::new(rates.unwrap_or_default(), 17));
        let fs = Arc::new(AdversarialFileSystem::new(mem.clone(), adversary.clone()));
        let cache = PageCache::open(fs, pages, page_size, options)?;
        debug!("fixture cache with {} pages of {} bytes", pages, page_size);
        Ok(Fixture { mem, adversary, cache })
    }

    /// The file as the file system holds it, bypassing the cache.
    pub fn on_disk(&self, path: &str) -> Result<Vec<u8>> {
        self.mem.read_all(Path::new(path))
    }

    pub fn close(&self) -> Result<()> {
        self.cache.close()
    }
}

pub fn write_u64(file: &MappedFile, page_id: PageId, offset: usize, value: u64) -> Result<()> {
    let mut cursor = file.io(page_id, LockMode::ExclusiveWrite, &[])?;
    assert!(cursor.next()?);
    cursor.put_u64_at(offset, value);
    cursor.check_bounds()
}

/// Read a consistent value, None past the end of the file.
pub fn read_u64(file: &MappedFile, page_id: PageId, offset: usize) -> Result<Option<u64>> {
    let mut cursor = file.io(page_id, LockMode::SharedRead, &[])?;
    if !cursor.next()? {
        return Ok(None);
    }
    let value = loop {
        let value = cursor.get_u64_at(offset);
        if !cursor.should_retry() {
            break value;
        }
    };
    cursor.check_bounds()?;
    Ok(Some(value))
}

/// A directory under the system temp dir, removed on drop.
pub struct TempDir {
    pub path: PathBuf,
}

impl TempDir {
    pub fn new() -> TempDir {
        let path = std::env::temp_dir().join(format!("pagecache-{}", uuid::Uuid::new_v4()));
        TempDir { path }
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
