use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;

use super::{page_offset, FileSystem, PageSwapper};
use crate::error::{Error, Result};
use crate::pagecache::PageId;

/// File system backed by `std::fs`. Relative paths are resolved against
/// the root directory, which is created on demand.
#[derive(Debug)]
pub struct DiskFileSystem {
    root: PathBuf,
}

impl DiskFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Result<DiskFileSystem> {
        let root = root.into();
        if !root.as_os_str().is_empty() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(DiskFileSystem { root })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl FileSystem for DiskFileSystem {
    fn open(&self, path: &Path, page_size: usize, create: bool) -> Result<Box<dyn PageSwapper>> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            if create && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().read(true).write(true).create(create).open(&full)?;
        debug!("opened {} with page size {}", full.display(), page_size);
        Ok(Box::new(DiskSwapper {
            path: path.to_path_buf(),
            page_size,
            file: Mutex::new(Some(file)),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    fn delete(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(self.resolve(path)) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.resolve(path))?)
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        Ok(std::fs::write(self.resolve(path), data)?)
    }
}

/// Positioned page I/O over one file. The handle sits behind a mutex since
/// seek and read/write have to happen as one step.
#[derive(Debug)]
pub struct DiskSwapper {
    path: PathBuf,
    page_size: usize,
    file: Mutex<Option<File>>,
}

impl DiskSwapper {
    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut guard = self.file.lock()?;
        match guard.as_mut() {
            Some(file) => f(file),
            None => Err(Error::closed(format!("{} is closed", self.path.display()))),
        }
    }
}

impl PageSwapper for DiskSwapper {
    fn path(&self) -> &Path {
        &self.path
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<usize> {
        let offset = page_offset(page_id, self.page_size);
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            let mut read = 0;
            while read < buf.len() {
                match file.read(&mut buf[read..]) {
                    Ok(0) => break,
                    Ok(n) => read += n,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            buf[read..].fill(0);
            Ok(read)
        })
    }

    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        let offset = page_offset(page_id, self.page_size);
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
            Ok(())
        })
    }

    fn force(&self) -> Result<()> {
        self.with_file(|file| Ok(file.sync_all()?))
    }

    fn len(&self) -> Result<u64> {
        self.with_file(|file| Ok(file.metadata()?.len()))
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.file.lock()?;
        if let Some(file) = guard.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}
