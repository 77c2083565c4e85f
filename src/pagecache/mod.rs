//! The page cache: a bounded pool of page-sized frames that caches the pages
//! of mapped files and serves all page access through short-lived cursors.
//!
//! The moving parts, leaf first:
//!
//! - [`frame`]: one page-sized buffer plus its pin count, dirty bit, version
//!   stamp and page lock.
//! - [`pool`]: the fixed arena of frames and the free list.
//! - [`replacer`]: the clock that picks eviction candidates.
//! - [`translation`]: per-file mapping of page ids to frames.
//! - [`paged_file`]: one mapped file and the handle clients hold on to.
//! - [`cursor`]: pin, fault, optimistic retry and release of pages.
//! - [`flush`]: writing dirty pages back without tearing concurrent writes.
//! - [`evictor`]: cooperative and background eviction.
//! - [`page_cache`]: the cache itself, tying everything together.

use std::fmt::{Display, Formatter};

pub mod cursor;
pub mod evictor;
pub mod flush;
pub mod frame;
pub mod metrics;
pub mod page_cache;
pub mod paged_file;
pub mod pool;
pub mod replacer;
pub mod translation;

pub use cursor::PageCursor;
pub use flush::FlushHandle;
pub use metrics::MetricsSnapshot;
pub use page_cache::PageCache;
pub use paged_file::MappedFile;

/// Logical page number inside a file.
pub type PageId = u64;

/// Index of a frame in the frame pool, i.e., in range: [0, max_cached_pages).
pub type FrameId = usize;

/// Identifies a paged file for as long as the cache is open.
pub type FileId = u32;

/// How a cursor accesses the pages it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Optimistic reads that have to be validated with `should_retry`.
    SharedRead,
    /// Exclusive access, held from `next` until the cursor moves on.
    ExclusiveWrite,
}

impl Display for LockMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::SharedRead => write!(f, "shared-read"),
            LockMode::ExclusiveWrite => write!(f, "exclusive-write"),
        }
    }
}

/// Options given when mapping a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOption {
    /// Create the file if it does not exist.
    Create,
    /// No cursor may extend the file.
    NoGrow,
    /// Every cursor takes the exclusive page lock, readers included.
    MultiVersioned,
    /// Multi-byte accessors use big-endian byte order.
    BigEndian,
    /// Keep the given number of trailing bytes of every page away from cursors.
    ReservedBytes(usize),
}

/// Options given when opening a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOption {
    /// Moving past the last page of the file ends the cursor instead of
    /// growing the file.
    NoGrow,
    /// Only bind to pages that are already resident. Pages that are not stay
    /// unbound, every access to them raises the bounds flag.
    NoFault,
}

/// Where a frame's content belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageBinding {
    pub file_id: FileId,
    pub page_id: PageId,
}

impl Display for PageBinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_id)
    }
}
