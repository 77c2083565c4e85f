use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::error::{Error, Result};

use super::frame::Frame;
use super::page_cache::CacheInner;
use super::paged_file::PagedFile;
use super::{CursorOption, FrameId, LockMode, PageId};

/// A cursor reads and writes one page of a mapped file at a time.
///
/// `next` moves the cursor to the next page: the previous page is released
/// and the new one pinned, faulting it in if needed. Exclusive-write cursors
/// hold the page lock until they move on or close, nothing else can write the
/// page in between.
///
/// Shared-read cursors take no lock. They read optimistically and must
/// validate every read with `should_retry`, redoing the whole read whenever
/// it returns true:
///
/// ```ignore
/// let mut cursor = file.io(page_id, LockMode::SharedRead, &[])?;
/// if cursor.next()? {
///     let value = loop {
///         let value = cursor.get_u64();
///         if !cursor.should_retry() {
///             break value;
///         }
///     };
///     cursor.check_bounds()?;
/// }
/// ```
///
/// Accesses outside of the page payload never fail on the spot, they read as
/// zero or are dropped and raise the bounds flag, which the caller checks
/// with `check_and_clear_bounds_flag` or `check_bounds` afterwards.
///
/// The cursor releases its page when it is closed or dropped.
pub struct PageCursor {
    inner: Arc<CacheInner>,
    file: Arc<PagedFile>,
    mode: LockMode,
    /// the page lock is taken, true for writers and for every cursor on a
    /// multi-versioned file.
    exclusive: bool,
    no_grow: bool,
    no_fault: bool,
    big_endian: bool,
    payload_size: usize,
    next_page_id: PageId,
    current_page_id: Option<PageId>,
    frame_id: Option<FrameId>,
    locked: bool,
    stamp: u64,
    offset: usize,
    out_of_bounds: bool,
    modified: bool,
}

macro_rules! accessors {
    ($($ty:ty => $get:ident, $get_at:ident, $put:ident, $put_at:ident;)*) => {
        $(
            /// Read at the current offset and advance it.
            pub fn $get(&mut self) -> $ty {
                let at = self.advance(std::mem::size_of::<$ty>());
                self.$get_at(at)
            }

            pub fn $get_at(&mut self, offset: usize) -> $ty {
                match self.read_array(offset) {
                    Some(bytes) if self.big_endian => <$ty>::from_be_bytes(bytes),
                    Some(bytes) => <$ty>::from_le_bytes(bytes),
                    None => 0,
                }
            }

            /// Write at the current offset and advance it.
            pub fn $put(&mut self, value: $ty) {
                let at = self.advance(std::mem::size_of::<$ty>());
                self.$put_at(at, value)
            }

            pub fn $put_at(&mut self, offset: usize, value: $ty) {
                let bytes = if self.big_endian { value.to_be_bytes() } else { value.to_le_bytes() };
                self.write_slice(offset, &bytes)
            }
        )*
    };
}

impl PageCursor {
    pub(crate) fn new(
        inner: Arc<CacheInner>,
        file: Arc<PagedFile>,
        start_page_id: PageId,
        mode: LockMode,
        options: &[CursorOption],
    ) -> Result<PageCursor> {
        file.register_cursor()?;
        let exclusive = mode == LockMode::ExclusiveWrite || file.is_multi_versioned();
        Ok(PageCursor {
            exclusive,
            no_grow: options.contains(&CursorOption::NoGrow),
            no_fault: options.contains(&CursorOption::NoFault),
            big_endian: file.is_big_endian(),
            payload_size: file.payload_size(),
            inner,
            file,
            mode,
            next_page_id: start_page_id,
            current_page_id: None,
            frame_id: None,
            locked: false,
            stamp: 0,
            offset: 0,
            out_of_bounds: false,
            modified: false,
        })
    }

    /// Move to the next page. Returns false once a read cursor, or a cursor
    /// that may not grow the file, reaches the end of the file.
    pub fn next(&mut self) -> Result<bool> {
        self.move_to(self.next_page_id)
    }

    /// Move to the given page. Succeeds right away if the cursor is bound to
    /// that page already.
    pub fn next_to(&mut self, page_id: PageId) -> Result<bool> {
        if self.current_page_id == Some(page_id) && self.frame_id.is_some() {
            return Ok(true);
        }
        self.move_to(page_id)
    }

    fn move_to(&mut self, page_id: PageId) -> Result<bool> {
        self.release_page()?;
        self.inner.check_open()?;
        let grows = page_id >= self.file.page_count();
        if grows {
            if self.mode != LockMode::ExclusiveWrite || self.no_grow || self.file.is_no_grow() {
                return Ok(false);
            }
            self.file.grow_to(page_id);
        }
        self.next_page_id = page_id + 1;
        self.offset = 0;
        self.out_of_bounds = false;

        let Some(frame_id) = self.inner.acquire_frame(&self.file, page_id, self.no_fault)? else {
            // not resident and may not fault, the cursor stays unbound.
            self.current_page_id = Some(page_id);
            return Ok(true);
        };
        let frame = self.inner.pool.frame(frame_id);
        let timeout = self.inner.options.lock_timeout();
        if self.exclusive {
            if let Err(err) = frame.lock_write(timeout) {
                self.inner.release_frame(frame_id);
                return Err(err);
            }
            self.locked = true;
        } else {
            match stable_stamp(frame, timeout) {
                Ok(stamp) => self.stamp = stamp,
                Err(err) => {
                    self.inner.release_frame(frame_id);
                    return Err(err);
                }
            }
        }
        self.frame_id = Some(frame_id);
        self.current_page_id = Some(page_id);
        if grows {
            // a page the file did not have yet has to reach it on flush.
            self.mark_modified();
        }
        Ok(true)
    }

    /// Unlock and unpin the current page, if any.
    fn release_page(&mut self) -> Result<()> {
        self.current_page_id = None;
        self.modified = false;
        let Some(frame_id) = self.frame_id.take() else {
            return Ok(());
        };
        let result = if self.locked {
            self.locked = false;
            self.inner.pool.frame(frame_id).unlock_write()
        } else {
            Ok(())
        };
        self.inner.release_frame(frame_id);
        result
    }

    /// Validate the reads done since the cursor moved to its page, or since
    /// the last retry. True means a writer raced them: the cursor has been
    /// reset to offset zero and the reads have to be done again. Cursors
    /// that hold the page lock never retry.
    pub fn should_retry(&mut self) -> bool {
        if self.exclusive {
            return false;
        }
        let Some(frame_id) = self.frame_id else {
            return false;
        };
        let frame = self.inner.pool.frame(frame_id);
        if frame.validate(self.stamp) {
            return false;
        }
        // an odd stamp never validates, the next check retries again.
        self.stamp = match stable_stamp(frame, self.inner.options.lock_timeout()) {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!("waiting for the writer of page {:?} failed: {}", self.current_page_id, err);
                frame.read_stamp() | 1
            }
        };
        self.offset = 0;
        self.out_of_bounds = false;
        true
    }

    /// Whether an access went out of bounds since the last check; the flag is
    /// cleared.
    pub fn check_and_clear_bounds_flag(&mut self) -> bool {
        std::mem::replace(&mut self.out_of_bounds, false)
    }

    /// Like `check_and_clear_bounds_flag`, as an error.
    pub fn check_bounds(&mut self) -> Result<()> {
        if self.check_and_clear_bounds_flag() {
            return Err(Error::OutOfBounds(format!(
                "access out of bounds on page {:?} of {}, payload size {}",
                self.current_page_id,
                self.file.path().display(),
                self.payload_size
            )));
        }
        Ok(())
    }

    pub fn current_page_id(&self) -> Option<PageId> {
        self.current_page_id
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn lock_mode(&self) -> LockMode {
        self.mode
    }

    pub fn get_u8(&mut self) -> u8 {
        let at = self.advance(1);
        self.get_u8_at(at)
    }

    pub fn get_u8_at(&mut self, offset: usize) -> u8 {
        match self.read_array::<1>(offset) {
            Some(bytes) => bytes[0],
            None => 0,
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        let at = self.advance(1);
        self.put_u8_at(at, value)
    }

    pub fn put_u8_at(&mut self, offset: usize, value: u8) {
        self.write_slice(offset, &[value])
    }

    accessors! {
        u16 => get_u16, get_u16_at, put_u16, put_u16_at;
        u32 => get_u32, get_u32_at, put_u32, put_u32_at;
        u64 => get_u64, get_u64_at, put_u64, put_u64_at;
    }

    /// Fill `dst` from the current offset and advance it.
    pub fn get_bytes(&mut self, dst: &mut [u8]) {
        let at = self.advance(dst.len());
        match self.bound_frame(at, dst.len()) {
            Some(frame) => frame.read(at, dst),
            None => dst.fill(0),
        }
    }

    /// Write `src` at the current offset and advance it.
    pub fn put_bytes(&mut self, src: &[u8]) {
        let at = self.advance(src.len());
        self.write_slice(at, src)
    }

    /// Zero the whole payload of the current page.
    pub fn zap_page(&mut self) {
        self.assert_writable();
        let len = self.payload_size;
        if let Some(frame) = self.bound_frame(0, len) {
            frame.fill(0, len, 0);
            self.mark_modified();
        }
    }

    /// Copy up to `len` bytes from this cursor's page at `source_offset` to
    /// the page of `target` at `target_offset`. The copy is cut short at the
    /// end of either payload; the number of bytes copied is returned.
    pub fn copy_to(
        &mut self,
        source_offset: usize,
        target: &mut PageCursor,
        target_offset: usize,
        len: usize,
    ) -> usize {
        target.assert_writable();
        if source_offset >= self.payload_size || target_offset >= target.payload_size {
            self.out_of_bounds = true;
            return 0;
        }
        let len = len.min(self.payload_size - source_offset).min(target.payload_size - target_offset);
        let mut buf = vec![0u8; len];
        match self.bound_frame(source_offset, len) {
            Some(frame) => frame.read(source_offset, &mut buf),
            None => return 0,
        }
        target.write_slice(target_offset, &buf);
        len
    }

    /// Release the page and close the cursor.
    pub fn close(self) {}

    /// Move the offset past `len` bytes, return where they start.
    fn advance(&mut self, len: usize) -> usize {
        let at = self.offset;
        self.offset = at.saturating_add(len);
        at
    }

    /// The frame to access `len` bytes at `at` in, or None with the bounds
    /// flag raised.
    fn bound_frame(&mut self, at: usize, len: usize) -> Option<&Frame> {
        let fits = at.checked_add(len).map_or(false, |end| end <= self.payload_size);
        match self.frame_id {
            Some(frame_id) if fits => Some(self.inner.pool.frame(frame_id)),
            _ => {
                self.out_of_bounds = true;
                None
            }
        }
    }

    fn read_array<const N: usize>(&mut self, at: usize) -> Option<[u8; N]> {
        let frame = self.bound_frame(at, N)?;
        let mut bytes = [0u8; N];
        frame.read(at, &mut bytes);
        Some(bytes)
    }

    fn write_slice(&mut self, at: usize, src: &[u8]) {
        self.assert_writable();
        if let Some(frame) = self.bound_frame(at, src.len()) {
            frame.write(at, src);
            self.mark_modified();
        }
    }

    fn assert_writable(&self) {
        assert!(
            self.mode == LockMode::ExclusiveWrite,
            "write through a {} cursor on {}",
            self.mode,
            self.file.path().display()
        );
    }

    fn mark_modified(&mut self) {
        if self.modified {
            return;
        }
        if let Some(frame_id) = self.frame_id {
            self.inner.pool.frame(frame_id).mark_dirty();
            self.modified = true;
        }
    }
}

/// Snapshot a version stamp no writer holds, waiting for the current writer
/// if there is one.
fn stable_stamp(frame: &Frame, timeout: Option<Duration>) -> Result<u64> {
    loop {
        let stamp = frame.read_stamp();
        if stamp & 1 == 0 {
            return Ok(stamp);
        }
        frame.wait_for_writer(timeout)?;
    }
}

impl Debug for PageCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCursor")
            .field("file", &self.file.path())
            .field("mode", &self.mode)
            .field("current_page_id", &self.current_page_id)
            .field("offset", &self.offset)
            .finish()
    }
}

impl Drop for PageCursor {
    fn drop(&mut self) {
        if let Err(err) = self.release_page() {
            warn!("releasing cursor on {} failed: {}", self.file.path().display(), err);
        }
        self.file.unregister_cursor();
    }
}
