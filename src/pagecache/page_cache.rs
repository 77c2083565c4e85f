use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, info};
use tokio::sync::broadcast;

use crate::config::CacheOptions;
use crate::error::{Error, Result};
use crate::storage::FileSystem;

use super::evictor::{self, EvictorState};
use super::flush::{self, FlushHandle};
use super::metrics::{Metrics, MetricsSnapshot};
use super::paged_file::{MappedFile, PagedFile};
use super::pool::FramePool;
use super::replacer::{ClockReplacer, Replacer};
use super::translation::{Latch, Slot};
use super::{FileId, FrameId, OpenOption, PageBinding, PageId};

/// Paged files known to the cache, mapped or orphaned by a failed unmap.
#[derive(Debug, Default)]
struct FileRegistry {
    by_path: HashMap<PathBuf, FileId>,
    files: BTreeMap<FileId, Arc<PagedFile>>,
    next_file_id: FileId,
}

/// The state shared between the cache, its mapped files, cursors and the
/// background threads.
#[derive(Debug)]
pub struct CacheInner {
    fs: Arc<dyn FileSystem>,
    pub(crate) pool: FramePool,
    /// Replacer to find unpinned frames for replacement.
    pub(crate) replacer: Arc<dyn Replacer>,
    pub(crate) metrics: Metrics,
    pub(crate) options: CacheOptions,
    pub(crate) evictor: EvictorState,
    /// frames the background evictor keeps on the free list.
    pub(crate) keep_free: usize,
    files: Mutex<FileRegistry>,
    closed: AtomicBool,
}

impl CacheInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed("page cache is closed"));
        }
        Ok(())
    }

    pub(crate) fn lookup_file(&self, file_id: FileId) -> Result<Option<Arc<PagedFile>>> {
        let registry = self.files.lock()?;
        Ok(registry.files.get(&file_id).cloned())
    }

    pub(crate) fn registered_files(&self) -> Result<Vec<Arc<PagedFile>>> {
        let registry = self.files.lock()?;
        Ok(registry.files.values().cloned().collect())
    }

    /// Pin the frame holding the given page, faulting it in if it is not
    /// resident. Concurrent faults of one page coalesce: the first thread
    /// installs a latch and does the read, everybody else waits for it.
    ///
    /// With `no_fault` set pages are only pinned if they are resident
    /// already, None is returned otherwise.
    pub(crate) fn acquire_frame(
        &self,
        file: &PagedFile,
        page_id: PageId,
        no_fault: bool,
    ) -> Result<Option<FrameId>> {
        loop {
            let mut shard = file.table.lock(page_id)?;
            match shard.get(&page_id) {
                Some(Slot::Resident(frame_id)) => {
                    let frame_id = *frame_id;
                    self.pool.frame(frame_id).pin();
                    drop(shard);
                    self.replacer.record_access(frame_id);
                    self.metrics.hit();
                    return Ok(Some(frame_id));
                }
                Some(Slot::Faulting(latch)) => {
                    if no_fault {
                        return Ok(None);
                    }
                    let latch = Arc::clone(latch);
                    drop(shard);
                    latch.wait()?;
                }
                None => {
                    if no_fault {
                        return Ok(None);
                    }
                    let latch = Arc::new(Latch::new());
                    shard.insert(page_id, Slot::Faulting(Arc::clone(&latch)));
                    drop(shard);
                    let result = self.fault(file, page_id);
                    if result.is_err() {
                        if let Ok(mut shard) = file.table.lock(page_id) {
                            if matches!(shard.get(&page_id), Some(Slot::Faulting(_))) {
                                shard.remove(&page_id);
                            }
                        }
                    }
                    latch.release();
                    return result.map(Some);
                }
            }
        }
    }

    /// Load a page into a frame and install it, pinned, in the translation
    /// table. The caller owns the fault latch of the page.
    fn fault(&self, file: &PagedFile, page_id: PageId) -> Result<FrameId> {
        let frame_id = self.grab_frame().map_err(|err| Error::page_fault(page_id, err))?;
        match self.load(file, page_id, frame_id) {
            Ok(bytes) => {
                self.replacer.set_evictable(frame_id, true);
                self.metrics.fault(bytes);
                self.signal_evictor();
                Ok(frame_id)
            }
            Err(err) => {
                debug!("fault of page {} of {} failed: {}", page_id, file.path().display(), err);
                let frame = self.pool.frame(frame_id);
                if frame.is_pinned() {
                    frame.unpin();
                }
                self.pool.release(frame_id)?;
                Err(Error::page_fault(page_id, err))
            }
        }
    }

    fn load(&self, file: &PagedFile, page_id: PageId, frame_id: FrameId) -> Result<usize> {
        let frame = self.pool.frame(frame_id);
        let mut page = vec![0u8; file.page_size()];
        let bytes = file.read_page(page_id, &mut page, self.options.io_retries)?;
        frame.write(0, &page);
        frame.bind(PageBinding { file_id: file.id(), page_id })?;
        frame.pin();
        let mut shard = file.table.lock(page_id)?;
        shard.insert(page_id, Slot::Resident(frame_id));
        Ok(bytes)
    }

    /// Release a pin taken by `acquire_frame`.
    pub(crate) fn release_frame(&self, frame_id: FrameId) {
        if self.pool.frame(frame_id).unpin() == 0 {
            self.pool.notify_unpinned();
        }
    }

    /// Drop one mapping of the file. The last one flushes the file, evicts
    /// its pages and closes it.
    pub(crate) fn unmap(&self, file: &Arc<PagedFile>) -> Result<()> {
        let remaining = {
            let _registry = self.files.lock()?;
            file.remove_mapping()
        };
        if remaining > 0 || self.is_closed() {
            return Ok(());
        }
        info!("unmapping {}", file.path().display());
        file.await_cursors(self.options.unmap_policy, self.options.unmap_timeout())?;
        self.release_file(file, false)
    }

    /// Flush a file, drop all of its pages from the cache and forget it.
    /// Unless `force` is set this stops early if the file got mapped again
    /// meanwhile.
    fn release_file(&self, file: &Arc<PagedFile>, force: bool) -> Result<()> {
        flush::flush_file(self, file)?;
        file.force()?;
        if !self.drop_pages(file, force)? {
            return Ok(());
        }
        {
            let mut registry = self.files.lock()?;
            if !force && file.mappings() > 0 {
                return Ok(());
            }
            registry.files.remove(&file.id());
            registry.by_path.remove(file.path());
        }
        debug!("closing {}", file.path().display());
        file.close_swapper()
    }

    /// Evict every page of the file. Returns false if the file was mapped
    /// again before all pages were gone.
    fn drop_pages(&self, file: &PagedFile, force: bool) -> Result<bool> {
        for shard in file.table.shards() {
            loop {
                let mut shard = shard.lock()?;
                if !force && file.mappings() > 0 {
                    return Ok(false);
                }
                let mut busy = false;
                let pages = shard
                    .iter()
                    .filter_map(|(page_id, slot)| match slot {
                        Slot::Resident(frame_id) => Some((*page_id, *frame_id)),
                        Slot::Faulting(_) => None,
                    })
                    .collect::<Vec<_>>();
                busy |= pages.len() < shard.len();
                for (page_id, frame_id) in pages {
                    if self.pool.frame(frame_id).is_pinned() {
                        // a concurrent flush holds it for a moment.
                        busy = true;
                        continue;
                    }
                    self.evict_locked(file, &mut shard, page_id, frame_id)?;
                    self.pool.release(frame_id)?;
                }
                if !busy {
                    break;
                }
                drop(shard);
                std::thread::yield_now();
            }
        }
        Ok(true)
    }

    /// Try to release every registered file, used when the cache closes.
    fn release_all(&self) -> Result<()> {
        let mut result = Ok(());
        for file in self.registered_files()? {
            let released = file
                .await_cursors(self.options.unmap_policy, self.options.unmap_timeout())
                .and_then(|_| self.release_file(&file, true));
            if let Err(err) = released {
                error!("failed to release {}: {}", file.path().display(), err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

/// The page cache: a fixed number of page-sized frames shared by all files
/// mapped through it.
///
/// Pages are accessed through cursors obtained from [`MappedFile::io`].
/// Dirty pages reach their files when they are evicted, when their file or
/// the whole cache is flushed, and when their file is unmapped.
pub struct PageCache {
    inner: Arc<CacheInner>,
    evictor: Mutex<Option<(broadcast::Sender<()>, JoinHandle<()>)>>,
}

impl PageCache {
    /// Open a cache of `max_cached_pages` frames of `page_size` bytes each on
    /// top of the given file system.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        max_cached_pages: usize,
        page_size: usize,
        options: CacheOptions,
    ) -> Result<PageCache> {
        if max_cached_pages < 2 {
            return Err(Error::value(format!(
                "page cache needs at least 2 pages, got {}",
                max_cached_pages
            )));
        }
        if page_size == 0 {
            return Err(Error::value("page size must be positive"));
        }
        let options = CacheOptions { max_cached_pages, page_size, ..options };
        let keep_free = options.pages_to_keep_free(max_cached_pages);
        let replacer: Arc<dyn Replacer> =
            Arc::new(ClockReplacer::new(max_cached_pages, options.clock_sweeps));
        let inner = Arc::new(CacheInner {
            fs,
            pool: FramePool::new(max_cached_pages, page_size),
            replacer,
            metrics: Metrics::default(),
            evictor: EvictorState::default(),
            keep_free,
            files: Mutex::new(FileRegistry::default()),
            closed: AtomicBool::new(false),
            options,
        });
        let evictor = if inner.options.background_eviction {
            Some(evictor::spawn(Arc::clone(&inner))?)
        } else {
            None
        };
        info!(
            "page cache opened with {} pages of {} bytes, keeping {} free",
            max_cached_pages, page_size, keep_free
        );
        Ok(PageCache { inner, evictor: Mutex::new(evictor) })
    }

    /// Open a cache sized by the options.
    pub fn with_options(fs: Arc<dyn FileSystem>, options: CacheOptions) -> Result<PageCache> {
        PageCache::open(fs, options.max_cached_pages, options.page_size, options)
    }

    /// Map the file at the given path. Mapping a path that is mapped already
    /// returns another handle on the same file, which then has to agree on
    /// the page size.
    pub fn map(
        &self,
        path: impl AsRef<Path>,
        page_size: usize,
        options: &[OpenOption],
    ) -> Result<MappedFile> {
        self.inner.check_open()?;
        let path = path.as_ref();
        if page_size == 0 || page_size > self.inner.pool.page_size() {
            return Err(Error::misuse(format!(
                "cannot map {} with page size {}, the cache page size is {}",
                path.display(),
                page_size,
                self.inner.pool.page_size()
            )));
        }
        let mut registry = self.inner.files.lock()?;
        if let Some(file_id) = registry.by_path.get(path) {
            let file = registry
                .files
                .get(file_id)
                .cloned()
                .ok_or_else(|| Error::internal(format!("{} has no paged file", path.display())))?;
            if file.page_size() != page_size {
                return Err(Error::misuse(format!(
                    "{} is already mapped with page size {}, not {}",
                    path.display(),
                    file.page_size(),
                    page_size
                )));
            }
            let mappings = file.add_mapping();
            debug!("mapped {} again, {} mappings", path.display(), mappings);
            return Ok(MappedFile::new(Arc::clone(&self.inner), file));
        }

        let create = options.contains(&OpenOption::Create);
        let swapper = self.inner.fs.open(path, page_size, create)?;
        let file_id = registry.next_file_id;
        let file = Arc::new(PagedFile::new(file_id, path, swapper, page_size, options)?);
        file.add_mapping();
        registry.next_file_id += 1;
        registry.by_path.insert(path.to_path_buf(), file_id);
        registry.files.insert(file_id, Arc::clone(&file));
        info!("mapped {} with page size {} as file {}", path.display(), page_size, file_id);
        Ok(MappedFile::new(Arc::clone(&self.inner), file))
    }

    /// Write every dirty page of every file known to the cache, and force the
    /// files. All files are attempted, the first failure is returned.
    pub fn flush_and_force(&self) -> Result<()> {
        self.inner.check_open()?;
        flush::flush_files(&self.inner, &self.inner.registered_files()?)
    }

    /// Like `flush_and_force`, on a background thread with retries.
    pub fn flush_and_force_async(&self) -> Result<FlushHandle> {
        self.inner.check_open()?;
        FlushHandle::spawn(Arc::clone(&self.inner), self.inner.registered_files()?)
    }

    /// Close the cache: stop the background evictor, then flush and release
    /// every file. Handles and cursors that outlive the cache fail with
    /// `Error::Closed`. A failed close may be repeated.
    pub fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!("closing page cache, {}", self.inner.metrics.snapshot());
        }
        let evictor = self.evictor.lock()?.take();
        if let Some((done, handle)) = evictor {
            let _ = done.send(());
            self.inner.evictor.wake();
            if handle.join().is_err() {
                error!("background evictor panicked");
            }
        }
        self.inner.release_all()
    }

    pub fn max_cached_pages(&self) -> usize {
        self.inner.pool.capacity()
    }

    pub fn page_size(&self) -> usize {
        self.inner.pool.page_size()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Frames that are not on the free list.
    pub fn resident_pages(&self) -> usize {
        self.inner.pool.resident_count()
    }

    pub fn free_frames(&self) -> usize {
        self.inner.pool.free_count()
    }

    /// The last failure of an eviction, if any happened.
    pub fn evictor_error(&self) -> Option<Error> {
        self.inner.evictor.last_error()
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("closing page cache on drop failed: {}", err);
        }
    }
}
