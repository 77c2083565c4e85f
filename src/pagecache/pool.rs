use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::Result;

use super::frame::Frame;
use super::FrameId;

/// The frame pool owns every frame of the cache. It is sized once, frames
/// are addressed by their index, i.e., the FrameId is in range:
/// [0, capacity), and handed out from a free list.
///
/// Frames that are not on the free list are resident: bound to a page in
/// some translation table, or in the middle of being faulted in.
#[derive(Debug)]
pub struct FramePool {
    frames: Vec<Frame>,
    page_size: usize,
    /// list of free frames that don't have any pages on them.
    free_list: Mutex<Vec<FrameId>>,
    /// signalled whenever a frame goes back to the free list or loses its
    /// last pin, so that starved faults can try again.
    released: Condvar,
    waiters: AtomicUsize,
}

impl FramePool {
    pub fn new(capacity: usize, page_size: usize) -> FramePool {
        let frames = (0..capacity).map(|id| Frame::new(id, page_size)).collect();
        // hand out low frame ids first.
        let free_list = (0..capacity).rev().collect();
        FramePool {
            frames,
            page_size,
            free_list: Mutex::new(free_list),
            released: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id]
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Take a frame off the free list, if there is one.
    pub fn try_acquire(&self) -> Result<Option<FrameId>> {
        let mut free_list = self.free_list.lock()?;
        Ok(free_list.pop())
    }

    /// Return a frame to the free list. The frame must be unbound and
    /// unpinned, and not reachable from any translation table.
    pub fn release(&self, frame_id: FrameId) -> Result<()> {
        self.frames[frame_id].reset()?;
        let mut free_list = self.free_list.lock()?;
        debug_assert!(!free_list.contains(&frame_id), "double release of frame {}", frame_id);
        free_list.push(frame_id);
        self.released.notify_all();
        Ok(())
    }

    /// Wake threads that wait for frames, e.g., after a frame lost its last
    /// pin and became evictable.
    pub fn notify_unpinned(&self) {
        if self.waiters.load(Ordering::Acquire) == 0 {
            return;
        }
        // take the lock so a waiter between its check and its wait does not
        // miss the signal.
        let _guard = self.free_list.lock();
        self.released.notify_all();
    }

    /// Wait until a frame is released or unpinned, or the timeout elapsed.
    /// Returns whether the free list is non-empty afterwards.
    pub fn wait_for_frame(&self, timeout: Duration) -> Result<bool> {
        let free_list = self.free_list.lock()?;
        if !free_list.is_empty() {
            return Ok(true);
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let result = self.released.wait_timeout(free_list, timeout);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        let (free_list, _) = result?;
        Ok(!free_list.is_empty())
    }

    pub fn free_count(&self) -> usize {
        match self.free_list.lock() {
            Ok(free_list) => free_list.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn resident_count(&self) -> usize {
        self.capacity() - self.free_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_acquire_release() -> Result<()> {
        let pool = FramePool::new(3, 16);
        assert_eq!(3, pool.free_count());
        assert_eq!(Some(0), pool.try_acquire()?);
        assert_eq!(Some(1), pool.try_acquire()?);
        assert_eq!(Some(2), pool.try_acquire()?);
        assert_eq!(None, pool.try_acquire()?);
        assert_eq!(3, pool.resident_count());

        pool.frame(1).write(0, &[9; 16]);
        pool.frame(1).mark_dirty();
        pool.release(1)?;
        assert_eq!(1, pool.free_count());
        assert!(!pool.frame(1).is_dirty());
        assert_eq!(vec![0u8; 16], pool.frame(1).snapshot(16));
        assert_eq!(Some(1), pool.try_acquire()?);
        Ok(())
    }

    #[test]
    fn test_wait_for_frame() -> Result<()> {
        let pool = Arc::new(FramePool::new(1, 8));
        let frame_id = pool.try_acquire()?.unwrap();
        assert!(!pool.wait_for_frame(Duration::from_millis(10))?);

        let releaser = {
            let pool = pool.clone();
            thread::spawn(move || -> Result<()> {
                thread::sleep(Duration::from_millis(20));
                pool.release(frame_id)
            })
        };
        let mut freed = false;
        for _ in 0..100 {
            if pool.wait_for_frame(Duration::from_millis(50))? {
                freed = true;
                break;
            }
        }
        releaser.join().unwrap()?;
        assert!(freed);
        Ok(())
    }
}
