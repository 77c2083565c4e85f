use std::sync::Arc;
use std::thread;

use log::{debug, error, warn};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

use super::frame::Frame;
use super::page_cache::CacheInner;
use super::paged_file::PagedFile;
use super::translation::Slot;
use super::{FrameId, PageId};

/// Write the page held by the frame to its file and clear the dirty bit once
/// the write went through. The caller keeps writers away, by the flush lock
/// or by holding the shard lock on an unpinned frame.
pub(crate) fn write_back(inner: &CacheInner, file: &PagedFile, page_id: PageId, frame: &Frame) -> Result<()> {
    let page = frame.snapshot(file.page_size());
    file.write_page(page_id, &page, inner.options.verify_writes)
        .map_err(|err| Error::flush(page_id, err))?;
    frame.clear_dirty();
    inner.metrics.flush(page.len());
    Ok(())
}

/// Flush one pinned frame under its flush lock. Readers carry on, writers of
/// the page wait until the page is out. A writer holding the page past the
/// lock timeout fails the flush, the page stays dirty.
fn flush_frame(inner: &CacheInner, file: &PagedFile, page_id: PageId, frame_id: FrameId) -> Result<()> {
    let frame = inner.pool.frame(frame_id);
    frame.lock_flush(inner.options.lock_timeout())?;
    let result = if frame.is_dirty() { write_back(inner, file, page_id, frame) } else { Ok(()) };
    frame.unlock_flush()?;
    result
}

/// Write every dirty page of the file. Every page is attempted; the first
/// failure is returned and failed pages stay dirty.
pub(crate) fn flush_file(inner: &CacheInner, file: &PagedFile) -> Result<()> {
    let mut first_err = None;
    let mut flushed = 0;
    for shard in file.table.shards() {
        let dirty = {
            let shard = shard.lock()?;
            let mut dirty = vec![];
            for (page_id, slot) in shard.iter() {
                if let Slot::Resident(frame_id) = slot {
                    let frame = inner.pool.frame(*frame_id);
                    if frame.is_dirty() {
                        frame.pin();
                        dirty.push((*page_id, *frame_id));
                    }
                }
            }
            dirty
        };
        for (page_id, frame_id) in dirty {
            let result = flush_frame(inner, file, page_id, frame_id);
            inner.release_frame(frame_id);
            match result {
                Ok(()) => flushed += 1,
                Err(err) => {
                    warn!("flush of page {} of {} failed: {}", page_id, file.path().display(), err);
                    first_err.get_or_insert(err);
                }
            }
        }
    }
    debug!("flushed {} pages of {}", flushed, file.path().display());
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Flush and force every given file, returning the first failure.
pub(crate) fn flush_files(inner: &CacheInner, files: &[Arc<PagedFile>]) -> Result<()> {
    let mut first_err = None;
    for file in files {
        match flush_file(inner, file).and_then(|_| file.force()) {
            Ok(()) => {}
            // released by its last unmap while the flush ran.
            Err(_) if file.is_released() => {}
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Handle on a flush running in the background. Dropping the handle leaves
/// the flush running.
#[derive(Debug)]
pub struct FlushHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl FlushHandle {
    /// Flush the files on a new thread. Failures are logged and the flush is
    /// repeated after `flush_retry_interval_ms`, up to `flush_retry_limit`
    /// times, before the last failure is reported.
    pub(crate) fn spawn(inner: Arc<CacheInner>, files: Vec<Arc<PagedFile>>) -> Result<FlushHandle> {
        let (tx, rx) = oneshot::channel();
        thread::Builder::new().name("pagecache-flush".to_string()).spawn(move || {
            let result = flush_with_retry(&inner, &files);
            if tx.send(result).is_err() {
                // handle dropped, nobody waits for the result.
            }
        })?;
        Ok(FlushHandle { rx })
    }

    /// Block until the flush finished. Panics when called from within an
    /// async runtime, use `finished` there.
    pub fn wait(self) -> Result<()> {
        self.rx.blocking_recv()?
    }

    /// Wait for the flush to finish without blocking the runtime.
    pub async fn finished(self) -> Result<()> {
        self.rx.await?
    }

    /// The outcome of the flush if it finished already.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(Error::internal("flush thread ended without result")))
            }
        }
    }
}

fn flush_with_retry(inner: &CacheInner, files: &[Arc<PagedFile>]) -> Result<()> {
    let limit = inner.options.flush_retry_limit;
    let interval = inner.options.flush_retry_interval();
    let mut attempt = 0;
    loop {
        match flush_files(inner, files) {
            Ok(()) => return Ok(()),
            Err(err) if attempt < limit && !inner.is_closed() => {
                attempt += 1;
                warn!("background flush failed, retry {} of {} in {:?}: {}", attempt, limit, interval, err);
                thread::sleep(interval);
            }
            Err(err) => {
                error!("background flush gave up after {} retries: {}", attempt, err);
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::config::CacheOptions;
    use crate::pagecache::{LockMode, OpenOption, PageCache};
    use crate::storage::adversary::{AdversarialFileSystem, Adversary, AdversaryRates};
    use crate::storage::memory::MemoryFileSystem;
    use crate::storage::FileSystem;

    fn options() -> CacheOptions {
        CacheOptions { background_eviction: false, ..Default::default() }
    }

    #[test]
    fn test_flush_is_idempotent() -> Result<()> {
        let fs = Arc::new(MemoryFileSystem::new());
        let cache = PageCache::open(fs.clone(), 8, 32, options())?;
        let file = cache.map("idem", 32, &[OpenOption::Create])?;
        let mut cursor = file.io(0, LockMode::ExclusiveWrite, &[])?;
        for page in 0..4u64 {
            assert!(cursor.next()?);
            cursor.put_u64(page);
        }
        cursor.close();

        file.flush()?;
        let flushes = cache.metrics().flushes;
        assert_eq!(4, flushes);
        let before = fs.read_all(Path::new("idem"))?;

        // nothing is dirty any more, flushing again writes nothing.
        file.flush()?;
        cache.flush_and_force()?;
        assert_eq!(flushes, cache.metrics().flushes);
        assert_eq!(before, fs.read_all(Path::new("idem"))?);
        Ok(())
    }

    #[test]
    fn test_flush_waits_for_writer() -> Result<()> {
        let fs = Arc::new(MemoryFileSystem::new());
        let cache = PageCache::open(fs.clone(), 8, 32, options())?;
        let file = cache.map("writer", 32, &[OpenOption::Create])?;
        let mut writer = file.io(0, LockMode::ExclusiveWrite, &[])?;
        assert!(writer.next()?);
        writer.put_u64(1);
        writer.close();

        // a writer holds the page while a flush runs: the flush writes either
        // the old or the new content, never a mix.
        let mut writer = file.io(0, LockMode::ExclusiveWrite, &[])?;
        assert!(writer.next()?);
        writer.put_u32(0xaaaa_aaaa);
        let handle = file.flush_async()?;
        std::thread::sleep(Duration::from_millis(20));
        writer.put_u32(0xbbbb_bbbb);
        writer.close();
        handle.wait()?;

        let data = fs.read_all(Path::new("writer"))?;
        let first = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let second = u32::from_le_bytes(data[4..8].try_into().unwrap());
        assert!(
            (first == 1 && second == 0) || (first == 0xaaaa_aaaa && second == 0xbbbb_bbbb),
            "torn page {:x} {:x}",
            first,
            second
        );
        Ok(())
    }

    #[test]
    fn test_failed_flush_keeps_dirty() -> Result<()> {
        let rates = AdversaryRates { failure_rate: 1.0, ..Default::default() };
        let adversary = Arc::new(Adversary::new(rates, 11));
        adversary.disable();
        let mem = Arc::new(MemoryFileSystem::new());
        let fs = Arc::new(AdversarialFileSystem::new(mem.clone(), adversary.clone()));
        let options = CacheOptions { flush_retry_interval_ms: 5, flush_retry_limit: 2, ..options() };
        let cache = PageCache::open(fs, 8, 32, options)?;
        let file = cache.map("dirty", 32, &[OpenOption::Create])?;
        let mut cursor = file.io(0, LockMode::ExclusiveWrite, &[])?;
        assert!(cursor.next()?);
        cursor.put_u64(42);
        cursor.close();

        adversary.enable();
        let err = file.flush().unwrap_err();
        assert!(matches!(err, Error::Flush { page_id: 0, .. }), "{}", err);
        assert!(err.is_transient());
        assert!(file.flush_async()?.wait().is_err());

        adversary.disable();
        file.flush()?;
        assert_eq!(42u64.to_le_bytes(), mem.read_all(Path::new("dirty"))?[..8]);
        Ok(())
    }

    #[tokio::test]
    async fn test_await_flush_in_runtime() -> Result<()> {
        let fs = Arc::new(MemoryFileSystem::new());
        let cache = PageCache::open(fs.clone(), 8, 32, options())?;
        let file = cache.map("awaited", 32, &[OpenOption::Create])?;
        let mut cursor = file.io(0, LockMode::ExclusiveWrite, &[])?;
        assert!(cursor.next()?);
        cursor.put_u64(8);
        cursor.close();

        file.flush_async()?.finished().await?;
        cache.flush_and_force_async()?.finished().await?;
        assert_eq!(8u64.to_le_bytes(), fs.read_all(Path::new("awaited"))?[..8]);
        Ok(())
    }
}
