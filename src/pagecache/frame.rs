use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

use super::{FrameId, PageBinding};

#[derive(Debug, Default)]
struct LockState {
    /// an exclusive writer holds the page.
    write: bool,
    /// the page is being written back to its file.
    flush: bool,
}

/// Frame is a page-sized buffer in the frame pool plus the bookkeeping the
/// cache needs to share it between threads. Frames are allocated once when
/// the cache opens and recycled between pages of any file until it closes.
///
/// The buffer is made of atomic bytes so that optimistic readers may look at
/// it while a writer is mutating it; whatever they observe in that case is
/// thrown away once the version stamp tells them a write raced their read.
#[derive(Debug)]
pub struct Frame {
    id: FrameId,
    buf: Box<[AtomicU8]>,
    /// sequence lock stamp, odd while an exclusive writer holds the page.
    version: AtomicU64,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    /// the page this frame currently caches, if any. This is a back
    /// reference only, the translation table owns the mapping.
    binding: Mutex<Option<PageBinding>>,
    lock: Mutex<LockState>,
    released: Condvar,
}

impl Frame {
    pub fn new(id: FrameId, page_size: usize) -> Frame {
        let buf = (0..page_size).map(|_| AtomicU8::new(0)).collect::<Vec<_>>().into_boxed_slice();
        Frame {
            id,
            buf,
            version: AtomicU64::new(0),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            binding: Mutex::new(None),
            lock: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Pin the frame. Callers must hold the translation table shard lock of
    /// the page the frame is bound to, which is what keeps the evictor away.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one pin, return the remaining pin count.
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpin of unpinned frame {}", self.id);
        prev - 1
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release)
    }

    pub fn binding(&self) -> Option<PageBinding> {
        match self.binding.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn bind(&self, binding: PageBinding) -> Result<()> {
        let mut guard = self.binding.lock()?;
        *guard = Some(binding);
        Ok(())
    }

    /// Forget the page this frame was caching. The content stays as it is,
    /// the next page that lands here overwrites it.
    pub fn unbind(&self) -> Result<()> {
        let mut guard = self.binding.lock()?;
        *guard = None;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Forget the page this frame was caching and wipe its content so no
    /// stale bytes leak into the next page that lands here.
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.binding.lock()?;
        *guard = None;
        self.dirty.store(false, Ordering::Release);
        self.fill(0, self.buf.len(), 0);
        Ok(())
    }

    pub fn get(&self, at: usize) -> u8 {
        self.buf[at].load(Ordering::Relaxed)
    }

    pub fn put(&self, at: usize, value: u8) {
        self.buf[at].store(value, Ordering::Relaxed)
    }

    /// Copy `dst.len()` bytes starting at `at` out of the frame.
    pub fn read(&self, at: usize, dst: &mut [u8]) {
        for (i, b) in dst.iter_mut().enumerate() {
            *b = self.buf[at + i].load(Ordering::Relaxed);
        }
    }

    /// Copy `src` into the frame starting at `at`.
    pub fn write(&self, at: usize, src: &[u8]) {
        for (i, b) in src.iter().enumerate() {
            self.buf[at + i].store(*b, Ordering::Relaxed);
        }
    }

    pub fn fill(&self, at: usize, len: usize, value: u8) {
        for b in &self.buf[at..at + len] {
            b.store(value, Ordering::Relaxed);
        }
    }

    /// Take a copy of the first `len` bytes, i.e., one file page.
    pub fn snapshot(&self, len: usize) -> Vec<u8> {
        let mut page = vec![0u8; len];
        self.read(0, &mut page);
        page
    }

    /// Begin an optimistic read, return the stamp to validate against.
    pub fn read_stamp(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Validate an optimistic read that started at `stamp`. False means a
    /// writer held or took the page meanwhile and the read has to be redone.
    pub fn validate(&self, stamp: u64) -> bool {
        fence(Ordering::Acquire);
        stamp & 1 == 0 && self.version.load(Ordering::Relaxed) == stamp
    }

    /// Block until no exclusive writer holds the page. Readers that failed
    /// validation park here instead of spinning on the stamp.
    pub fn wait_for_writer(&self, timeout: Option<Duration>) -> Result<()> {
        let guard = self.lock.lock()?;
        self.wait_while(guard, timeout, "writer", |state| state.write)?;
        Ok(())
    }

    /// Take the exclusive page lock. Writers exclude each other and wait for
    /// an in-progress flush of the page to finish. `None` waits forever.
    pub fn lock_write(&self, timeout: Option<Duration>) -> Result<()> {
        let guard = self.lock.lock()?;
        let mut guard = self.wait_while(guard, timeout, "page lock", |state| state.write || state.flush)?;
        guard.write = true;
        self.version.fetch_add(1, Ordering::Acquire);
        fence(Ordering::Release);
        Ok(())
    }

    pub fn unlock_write(&self) -> Result<()> {
        let mut guard = self.lock.lock()?;
        assert!(guard.write, "frame {} is not write locked", self.id);
        self.version.fetch_add(1, Ordering::Release);
        guard.write = false;
        self.released.notify_all();
        Ok(())
    }

    /// Take the flush lock. It is compatible with optimistic readers but not
    /// with writers, so a page is never written out halfway through a write.
    pub fn lock_flush(&self, timeout: Option<Duration>) -> Result<()> {
        let guard = self.lock.lock()?;
        let mut guard = self.wait_while(guard, timeout, "flush lock", |state| state.write || state.flush)?;
        guard.flush = true;
        Ok(())
    }

    pub fn unlock_flush(&self) -> Result<()> {
        let mut guard = self.lock.lock()?;
        guard.flush = false;
        self.released.notify_all();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_write_locked(&self) -> bool {
        match self.lock.lock() {
            Ok(guard) => guard.write,
            Err(poisoned) => poisoned.into_inner().write,
        }
    }

    /// Wait on the lock state until `blocked` no longer holds, at most
    /// `timeout` when one is given.
    fn wait_while<'a>(
        &self,
        mut guard: MutexGuard<'a, LockState>,
        timeout: Option<Duration>,
        what: &str,
        blocked: impl Fn(&LockState) -> bool,
    ) -> Result<MutexGuard<'a, LockState>> {
        let Some(timeout) = timeout else {
            return Ok(self.released.wait_while(guard, |state| blocked(state))?);
        };
        let deadline = Instant::now() + timeout;
        while blocked(&guard) {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout(format!(
                    "{} of frame {} not released within {:?}",
                    what, self.id, timeout
                )));
            }
            guard = self.released.wait_timeout(guard, deadline - now)?.0;
        }
        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_buffer_access() -> Result<()> {
        let frame = Frame::new(0, 16);
        frame.write(4, &[1, 2, 3, 4]);
        assert_eq!(3, frame.get(6));
        frame.put(15, 0xff);

        let mut buf = [0u8; 4];
        frame.read(4, &mut buf);
        assert_eq!([1, 2, 3, 4], buf);

        frame.fill(0, 8, 7);
        assert_eq!(vec![7u8; 8], frame.snapshot(8));
        assert_eq!(0xff, frame.snapshot(16)[15]);

        frame.bind(PageBinding { file_id: 1, page_id: 2 })?;
        frame.mark_dirty();
        frame.reset()?;
        assert_eq!(None, frame.binding());
        assert!(!frame.is_dirty());
        assert_eq!(vec![0u8; 16], frame.snapshot(16));
        Ok(())
    }

    #[test]
    fn test_pin_count() -> Result<()> {
        let frame = Frame::new(3, 8);
        assert!(!frame.is_pinned());
        assert_eq!(1, frame.pin());
        assert_eq!(2, frame.pin());
        assert_eq!(1, frame.unpin());
        assert_eq!(0, frame.unpin());
        assert!(!frame.is_pinned());
        Ok(())
    }

    #[test]
    fn test_version_stamp() -> Result<()> {
        let frame = Frame::new(0, 8);
        let stamp = frame.read_stamp();
        assert!(frame.validate(stamp));

        frame.lock_write(None)?;
        // a read that started while the writer holds the page never validates.
        let during = frame.read_stamp();
        assert!(!frame.validate(during));
        assert!(!frame.validate(stamp));
        frame.unlock_write()?;

        assert!(!frame.validate(stamp));
        assert!(frame.validate(frame.read_stamp()));
        Ok(())
    }

    #[test]
    fn test_lock_timeout() -> Result<()> {
        let frame = Frame::new(0, 8);
        frame.lock_write(None)?;
        assert!(frame.is_write_locked());
        let err = frame.lock_write(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        frame.unlock_write()?;

        frame.lock_flush(None)?;
        assert!(frame.lock_write(Some(Duration::from_millis(20))).is_err());
        frame.unlock_flush()?;
        frame.lock_write(Some(Duration::from_millis(20)))?;
        frame.unlock_write()?;
        assert!(!frame.is_write_locked());
        Ok(())
    }

    #[test]
    fn test_writers_exclude_each_other() -> Result<()> {
        let frame = Arc::new(Frame::new(0, 8));
        let inside = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let frame = frame.clone();
            let inside = inside.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                for _ in 0..200 {
                    frame.lock_write(None)?;
                    assert_eq!(0, inside.fetch_add(1, Ordering::SeqCst));
                    let v = frame.get(0);
                    frame.put(0, v.wrapping_add(1));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    frame.unlock_write()?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().unwrap()?;
        }
        assert_eq!((800 % 256) as u8, frame.get(0));
        Ok(())
    }

    #[test]
    fn test_reader_waits_for_writer() -> Result<()> {
        let frame = Arc::new(Frame::new(0, 8));
        frame.lock_write(None)?;
        let reader = {
            let frame = frame.clone();
            thread::spawn(move || -> Result<u8> {
                frame.wait_for_writer(None)?;
                Ok(frame.get(0))
            })
        };
        thread::sleep(Duration::from_millis(20));
        frame.put(0, 42);
        frame.unlock_write()?;
        assert_eq!(42, reader.join().unwrap()?);
        Ok(())
    }

    #[test]
    fn test_waits_on_writer_time_out() -> Result<()> {
        let frame = Frame::new(0, 8);
        frame.lock_write(None)?;
        let timeout = Some(Duration::from_millis(20));
        assert!(matches!(frame.wait_for_writer(timeout), Err(Error::LockTimeout(_))));
        assert!(matches!(frame.lock_flush(timeout), Err(Error::LockTimeout(_))));
        frame.unlock_write()?;

        frame.wait_for_writer(timeout)?;
        frame.lock_flush(timeout)?;
        // a flush holds off writers but not readers.
        frame.wait_for_writer(timeout)?;
        assert!(matches!(frame.lock_flush(timeout), Err(Error::LockTimeout(_))));
        frame.unlock_flush()?;
        Ok(())
    }
}
