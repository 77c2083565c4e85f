use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::UnmapPolicy;
use crate::error::{Error, Result};
use crate::storage::PageSwapper;

use super::cursor::PageCursor;
use super::flush::{self, FlushHandle};
use super::page_cache::CacheInner;
use super::translation::TranslationTable;
use super::{CursorOption, FileId, LockMode, OpenOption, PageId};

/// The cache side state of one mapped file. There is exactly one paged file
/// per path no matter how often the path is mapped; every mapping and every
/// cursor share it.
#[derive(Debug)]
pub struct PagedFile {
    id: FileId,
    path: PathBuf,
    swapper: Box<dyn PageSwapper>,
    page_size: usize,
    reserved_bytes: usize,
    no_grow: bool,
    multi_versioned: bool,
    big_endian: bool,
    /// number of pages in the file, including pages that only exist in the
    /// cache so far.
    page_count: AtomicU64,
    pub(crate) table: TranslationTable,
    /// live `MappedFile` handles. Only changed under the file registry lock.
    mappings: AtomicUsize,
    cursors: Mutex<usize>,
    cursors_closed: Condvar,
    /// set once the file was released and its swapper closed.
    released: AtomicBool,
}

impl PagedFile {
    pub fn new(
        id: FileId,
        path: &Path,
        swapper: Box<dyn PageSwapper>,
        page_size: usize,
        options: &[OpenOption],
    ) -> Result<PagedFile> {
        let mut reserved_bytes = 0;
        let (mut no_grow, mut multi_versioned, mut big_endian) = (false, false, false);
        for option in options {
            match option {
                OpenOption::NoGrow => no_grow = true,
                OpenOption::MultiVersioned => multi_versioned = true,
                OpenOption::BigEndian => big_endian = true,
                OpenOption::ReservedBytes(n) => reserved_bytes = *n,
                OpenOption::Create => {}
            }
        }
        if reserved_bytes >= page_size {
            return Err(Error::misuse(format!(
                "{} reserved bytes leave no payload in pages of {} bytes",
                reserved_bytes, page_size
            )));
        }
        let len = swapper.len()?;
        let page_count = len.div_ceil(page_size as u64);
        Ok(PagedFile {
            id,
            path: path.to_path_buf(),
            swapper,
            page_size,
            reserved_bytes,
            no_grow,
            multi_versioned,
            big_endian,
            page_count: AtomicU64::new(page_count),
            table: TranslationTable::new(),
            mappings: AtomicUsize::new(0),
            cursors: Mutex::new(0),
            cursors_closed: Condvar::new(),
            released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file page size, reserved bytes included.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// The part of a page cursors can see.
    pub fn payload_size(&self) -> usize {
        self.page_size - self.reserved_bytes
    }

    pub fn is_no_grow(&self) -> bool {
        self.no_grow
    }

    pub fn is_multi_versioned(&self) -> bool {
        self.multi_versioned
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn page_count(&self) -> u64 {
        self.page_count.load(Ordering::Acquire)
    }

    pub fn last_page_id(&self) -> Option<PageId> {
        self.page_count().checked_sub(1)
    }

    /// Extend the file so that it contains the given page.
    pub fn grow_to(&self, page_id: PageId) {
        self.page_count.fetch_max(page_id + 1, Ordering::AcqRel);
    }

    pub(crate) fn mappings(&self) -> usize {
        self.mappings.load(Ordering::Acquire)
    }

    pub(crate) fn add_mapping(&self) -> usize {
        self.mappings.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn remove_mapping(&self) -> usize {
        self.mappings.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn register_cursor(&self) -> Result<()> {
        let mut cursors = self.cursors.lock()?;
        *cursors += 1;
        Ok(())
    }

    pub(crate) fn unregister_cursor(&self) {
        let mut cursors = match self.cursors.lock() {
            Ok(cursors) => cursors,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cursors -= 1;
        if *cursors == 0 {
            self.cursors_closed.notify_all();
        }
    }

    pub fn open_cursors(&self) -> usize {
        match self.cursors.lock() {
            Ok(cursors) => *cursors,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Make sure no cursor is open on the file, either by waiting for them to
    /// close or by failing right away.
    pub(crate) fn await_cursors(&self, policy: UnmapPolicy, timeout: Duration) -> Result<()> {
        let mut cursors = self.cursors.lock()?;
        if *cursors == 0 {
            return Ok(());
        }
        match policy {
            UnmapPolicy::Fail => Err(Error::FileInUse(format!(
                "{} still has {} open cursors",
                self.path.display(),
                *cursors
            ))),
            UnmapPolicy::Block => {
                debug!("waiting for {} cursors on {} to close", *cursors, self.path.display());
                let deadline = Instant::now() + timeout;
                while *cursors > 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::LockTimeout(format!(
                            "{} still has {} open cursors after {:?}",
                            self.path.display(),
                            *cursors,
                            timeout
                        )));
                    }
                    cursors = self.cursors_closed.wait_timeout(cursors, deadline - now)?.0;
                }
                Ok(())
            }
        }
    }

    /// Read a whole page from the file. Transient failures are retried, a
    /// read does not change anything so repeating it is always safe.
    pub(crate) fn read_page(&self, page_id: PageId, buf: &mut [u8], retries: usize) -> Result<usize> {
        let mut attempt = 0;
        loop {
            match self.swapper.read(page_id, &mut buf[..self.page_size]) {
                Ok(n) => return Ok(n),
                Err(err) if err.is_transient() && attempt < retries => {
                    attempt += 1;
                    debug!(
                        "retrying read of page {} of {} after: {}",
                        page_id,
                        self.path.display(),
                        err
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Write a whole page to the file, optionally reading it back to make
    /// sure the bytes that reached the file are the ones that were written.
    pub(crate) fn write_page(&self, page_id: PageId, page: &[u8], verify: bool) -> Result<()> {
        self.swapper.write(page_id, page)?;
        if verify {
            let mut back = vec![0u8; page.len()];
            self.swapper.read(page_id, &mut back)?;
            if back != page {
                warn!("page {} of {} did not read back as written", page_id, self.path.display());
                return Err(Error::Corruption(format!(
                    "page {} of {} did not read back as written",
                    page_id,
                    self.path.display()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn force(&self) -> Result<()> {
        self.swapper.force()
    }

    pub(crate) fn close_swapper(&self) -> Result<()> {
        self.released.store(true, Ordering::Release);
        self.swapper.close()
    }

    /// Whether the cache let go of the file. Its pages were all written and
    /// dropped before.
    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// A client handle on a mapped file. Dropping the handle unmaps it; `unmap`
/// does the same but reports failures.
#[derive(Debug)]
pub struct MappedFile {
    inner: Arc<CacheInner>,
    file: Arc<PagedFile>,
    unmapped: bool,
}

impl MappedFile {
    pub(crate) fn new(inner: Arc<CacheInner>, file: Arc<PagedFile>) -> MappedFile {
        MappedFile { inner, file, unmapped: false }
    }

    /// Open a cursor positioned before `start_page_id`; the first `next`
    /// binds it to that page.
    pub fn io(
        &self,
        start_page_id: PageId,
        mode: LockMode,
        options: &[CursorOption],
    ) -> Result<PageCursor> {
        self.inner.check_open()?;
        PageCursor::new(Arc::clone(&self.inner), Arc::clone(&self.file), start_page_id, mode, options)
    }

    /// Write every dirty page of the file and force it to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_open()?;
        flush::flush_file(&self.inner, &self.file)?;
        self.file.force()
    }

    /// Flush the file on a background thread, retrying on failure. The
    /// returned handle may be waited on or dropped.
    pub fn flush_async(&self) -> Result<FlushHandle> {
        self.inner.check_open()?;
        FlushHandle::spawn(Arc::clone(&self.inner), vec![Arc::clone(&self.file)])
    }

    /// Release this mapping. The last mapping of a file flushes it and drops
    /// its pages from the cache. If that fails the file stays known to the
    /// cache with its dirty pages, to be flushed again by the next
    /// `flush_and_force`, `close` or `map` of the same path.
    pub fn unmap(mut self) -> Result<()> {
        self.unmapped = true;
        self.inner.unmap(&self.file)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn page_size(&self) -> usize {
        self.file.page_size()
    }

    pub fn page_count(&self) -> u64 {
        self.file.page_count()
    }

    pub fn last_page_id(&self) -> Option<PageId> {
        self.file.last_page_id()
    }

    pub fn reserved_bytes(&self) -> usize {
        self.file.reserved_bytes()
    }

    pub fn payload_size(&self) -> usize {
        self.file.payload_size()
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.unmapped {
            return;
        }
        if let Err(err) = self.inner.unmap(&self.file) {
            warn!("implicit unmap of {} failed: {}", self.file.path().display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryFileSystem;
    use crate::storage::FileSystem;

    fn paged_file(len: usize, page_size: usize, options: &[OpenOption]) -> Result<PagedFile> {
        let fs = MemoryFileSystem::new();
        fs.write_all(Path::new("f"), &vec![1u8; len])?;
        let swapper = fs.open(Path::new("f"), page_size, false)?;
        PagedFile::new(0, Path::new("f"), swapper, page_size, options)
    }

    #[test]
    fn test_page_count() -> Result<()> {
        let file = paged_file(0, 8, &[])?;
        assert_eq!(0, file.page_count());
        assert_eq!(None, file.last_page_id());

        let file = paged_file(17, 8, &[])?;
        assert_eq!(3, file.page_count());
        assert_eq!(Some(2), file.last_page_id());
        file.grow_to(1);
        assert_eq!(3, file.page_count());
        file.grow_to(9);
        assert_eq!(10, file.page_count());
        Ok(())
    }

    #[test]
    fn test_options() -> Result<()> {
        let file = paged_file(
            0,
            16,
            &[OpenOption::ReservedBytes(4), OpenOption::BigEndian, OpenOption::NoGrow],
        )?;
        assert_eq!(4, file.reserved_bytes());
        assert_eq!(12, file.payload_size());
        assert!(file.is_big_endian());
        assert!(file.is_no_grow());
        assert!(!file.is_multi_versioned());

        let err = paged_file(0, 16, &[OpenOption::ReservedBytes(16)]).unwrap_err();
        assert!(matches!(err, Error::Misuse(_)));
        Ok(())
    }

    #[test]
    fn test_await_cursors() -> Result<()> {
        let file = Arc::new(paged_file(0, 8, &[])?);
        file.await_cursors(UnmapPolicy::Fail, Duration::ZERO)?;

        file.register_cursor()?;
        let err = file.await_cursors(UnmapPolicy::Fail, Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::FileInUse(_)));
        let err = file.await_cursors(UnmapPolicy::Block, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));

        let closer = {
            let file = file.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                file.unregister_cursor();
            })
        };
        file.await_cursors(UnmapPolicy::Block, Duration::from_secs(10))?;
        closer.join().unwrap();
        assert_eq!(0, file.open_cursors());
        Ok(())
    }
}
