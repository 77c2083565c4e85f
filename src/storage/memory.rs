use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use super::{page_offset, FileSystem, PageSwapper};
use crate::error::{Error, Result};
use crate::pagecache::PageId;

type FileData = Arc<Mutex<Vec<u8>>>;

/// An in-memory file system, files are byte vectors keyed by path. Writes
/// are immediately visible to every swapper of the same file.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Arc<Mutex<BTreeMap<PathBuf, FileData>>>,
}

impl MemoryFileSystem {
    pub fn new() -> MemoryFileSystem {
        MemoryFileSystem { files: Arc::new(Mutex::new(BTreeMap::new())) }
    }

    fn file(&self, path: &Path) -> Result<FileData> {
        let files = self.files.lock()?;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::io(ErrorKind::NotFound, format!("{} not found", path.display())))
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&self, path: &Path, page_size: usize, create: bool) -> Result<Box<dyn PageSwapper>> {
        let mut files = self.files.lock()?;
        let data = match files.get(path) {
            Some(data) => Arc::clone(data),
            None if create => {
                let data = Arc::new(Mutex::new(Vec::new()));
                files.insert(path.to_path_buf(), Arc::clone(&data));
                data
            }
            None => {
                return Err(Error::io(
                    ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                ))
            }
        };
        Ok(Box::new(MemorySwapper {
            path: path.to_path_buf(),
            page_size,
            data,
            closed: AtomicBool::new(false),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        match self.files.lock() {
            Ok(files) => files.contains_key(path),
            Err(_) => false,
        }
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let mut files = self.files.lock()?;
        files.remove(path);
        Ok(())
    }

    fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        let data = self.file(path)?;
        let data = data.lock()?;
        Ok(data.clone())
    }

    fn write_all(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut files = self.files.lock()?;
        let data = files.entry(path.to_path_buf()).or_insert_with(|| Arc::new(Mutex::new(vec![])));
        let mut data = data.lock()?;
        data.clear();
        data.extend_from_slice(content);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySwapper {
    path: PathBuf,
    page_size: usize,
    data: FileData,
    closed: AtomicBool,
}

impl MemorySwapper {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(format!("{} is closed", self.path.display())));
        }
        Ok(())
    }
}

impl PageSwapper for MemorySwapper {
    fn path(&self) -> &Path {
        &self.path
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let data = self.data.lock()?;
        let start = usize::try_from(page_offset(page_id, self.page_size))?;
        let available = data.len().saturating_sub(start).min(buf.len());
        if available > 0 {
            buf[..available].copy_from_slice(&data[start..start + available]);
        }
        buf[available..].fill(0);
        Ok(available)
    }

    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut data = self.data.lock()?;
        let start = usize::try_from(page_offset(page_id, self.page_size))?;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        self.check_open()
    }

    fn len(&self) -> Result<u64> {
        self.check_open()?;
        let data = self.data.lock()?;
        Ok(data.len() as u64)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
