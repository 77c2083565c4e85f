//! Eviction reclaims frames of resident pages so that other pages can be
//! faulted in. It happens in two places:
//!
//! 1. cooperatively, by a fault that finds the free list empty;
//! 2. in the background, by a thread that keeps a number of frames on the
//!    free list so that most faults never have to evict.
//!
//! Both run the same procedure. The clock replacer offers an unpinned
//! candidate, which is then confirmed under the shard lock of the page it
//! holds: if the translation table still maps the page to the frame and
//! nobody pinned it, a dirty page is written back first, and only after a
//! successful write the entry is removed. A failed write keeps the page
//! resident and dirty, and the scan moves on to the next candidate.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::error::{Error, Result};

use super::flush;
use super::page_cache::CacheInner;
use super::paged_file::PagedFile;
use super::translation::{Shard, Slot};
use super::{FrameId, PageId};

/// How long the background evictor sleeps when there is nothing to do.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Upper bound of a single wait of a fault for a released frame, after which
/// it tries to evict again.
const FRAME_WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct EvictorState {
    wakeup: Mutex<bool>,
    cond: Condvar,
    last_error: Mutex<Option<Error>>,
}

impl EvictorState {
    pub fn wake(&self) {
        if let Ok(mut wakeup) = self.wakeup.lock() {
            *wakeup = true;
            self.cond.notify_one();
        }
    }

    fn park(&self, timeout: Duration) -> Result<()> {
        let wakeup = self.wakeup.lock()?;
        let (mut wakeup, _) = self.cond.wait_timeout_while(wakeup, timeout, |w| !*w)?;
        *wakeup = false;
        Ok(())
    }

    fn record(&self, err: Error) {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(err);
        }
    }

    pub fn last_error(&self) -> Option<Error> {
        match self.last_error.lock() {
            Ok(last_error) => last_error.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Start the background evictor. Sending on (or dropping) the returned
/// sender stops it.
pub fn spawn(inner: Arc<CacheInner>) -> Result<(broadcast::Sender<()>, JoinHandle<()>)> {
    let (tx, mut done) = broadcast::channel(1);
    let handle = std::thread::Builder::new().name("pagecache-evictor".to_string()).spawn(
        move || {
            debug!("background evictor keeps {} frames free", inner.keep_free);
            loop {
                match done.try_recv() {
                    Err(TryRecvError::Empty) => {}
                    _ => break,
                }
                inner.keep_frames_free();
                if let Err(err) = inner.evictor.park(PARK_TIMEOUT) {
                    warn!("background evictor stopped: {}", err);
                    break;
                }
            }
            debug!("background evictor stopped");
        },
    )?;
    Ok((tx, handle))
}

impl CacheInner {
    /// Wake the background evictor if the free list ran low.
    pub(crate) fn signal_evictor(&self) {
        if self.keep_free > 0 && self.pool.free_count() < self.keep_free {
            self.evictor.wake();
        }
    }

    fn keep_frames_free(&self) {
        while !self.is_closed() && self.pool.free_count() < self.keep_free {
            match self.evict_one() {
                Ok(Some(frame_id)) => {
                    if let Err(err) = self.pool.release(frame_id) {
                        self.evictor.record(err);
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!("background eviction failed: {}", err);
                    self.evictor.record(err);
                    return;
                }
            }
        }
    }

    /// Get a frame for a fault: from the free list, else by evicting a page,
    /// else by waiting until a frame is released or unpinned. Gives up after
    /// the eviction timeout since that means some caller holds on to all
    /// frames.
    pub(crate) fn grab_frame(&self) -> Result<FrameId> {
        let timeout = self.options.eviction_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame_id) = self.pool.try_acquire()? {
                self.signal_evictor();
                return Ok(frame_id);
            }
            if let Some(frame_id) = self.evict_one()? {
                return Ok(frame_id);
            }
            self.check_open()?;
            let now = Instant::now();
            if now >= deadline {
                let pinned = self.pool.frames().filter(|frame| frame.is_pinned()).count();
                // pinned frames the replacer does not know yet are being faulted into.
                let holding = (0..self.pool.capacity())
                    .filter(|f| self.pool.frame(*f).is_pinned() && self.replacer.is_evictable(*f))
                    .count();
                let mut msg = format!(
                    "no free frame within {:?}, {} of {} frames are pinned, {} by faults in progress",
                    timeout,
                    pinned,
                    self.pool.capacity(),
                    pinned - holding.min(pinned)
                );
                if let Some(err) = self.evictor.last_error() {
                    msg.push_str(&format!(", last eviction failure: {}", err));
                }
                return Err(Error::NoFreeFrame(msg));
            }
            self.evictor.wake();
            self.pool.wait_for_frame(FRAME_WAIT_SLICE.min(deadline - now))?;
        }
    }

    /// Evict one page and hand its frame to the caller. The frame is neither
    /// on the free list nor in any translation table afterwards.
    ///
    /// Candidates that were pinned meanwhile, or whose write back failed, are
    /// skipped. Returns None if the clock found nothing within its bound.
    pub(crate) fn evict_one(&self) -> Result<Option<FrameId>> {
        for _ in 0..self.pool.capacity() {
            let Some(frame_id) = self.replacer.evict(&|f| self.pool.frame(f).is_pinned()) else {
                return Ok(None);
            };
            match self.try_evict(frame_id) {
                Ok(true) => return Ok(Some(frame_id)),
                Ok(false) => {}
                Err(err) => {
                    warn!("eviction of frame {} failed: {}", frame_id, err);
                    self.metrics.eviction_failure();
                    self.evictor.record(err);
                }
            }
        }
        Ok(None)
    }

    fn try_evict(&self, frame_id: FrameId) -> Result<bool> {
        let Some(binding) = self.pool.frame(frame_id).binding() else {
            return Ok(false);
        };
        let Some(file) = self.lookup_file(binding.file_id)? else {
            return Ok(false);
        };
        let mut shard = file.table.lock(binding.page_id)?;
        match shard.get(&binding.page_id) {
            Some(Slot::Resident(resident)) if *resident == frame_id => {}
            _ => return Ok(false),
        }
        // pins are only taken under the shard lock, an unpinned frame stays
        // unpinned until it is released.
        if self.pool.frame(frame_id).is_pinned() {
            return Ok(false);
        }
        self.evict_locked(&file, &mut shard, binding.page_id, frame_id)?;
        Ok(true)
    }

    /// Write back and unbind a resident, unpinned page. The caller holds the
    /// shard lock of the page.
    pub(crate) fn evict_locked(
        &self,
        file: &PagedFile,
        shard: &mut Shard,
        page_id: PageId,
        frame_id: FrameId,
    ) -> Result<()> {
        let frame = self.pool.frame(frame_id);
        if frame.is_dirty() {
            flush::write_back(self, file, page_id, frame)?;
        }
        shard.remove(&page_id);
        self.replacer.set_evictable(frame_id, false);
        frame.unbind()?;
        self.metrics.eviction();
        trace!("evicted page {} of {} from frame {}", page_id, file.path().display(), frame_id);
        Ok(())
    }
}
