use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::FrameId;

///  Replacer tracks page usage for replacement in case of frame pool is full.
pub trait Replacer: Debug + Send + Sync {
    /// Record the event that the given frame is accessed. Frames that are
    /// not evictable ignore it.
    fn record_access(&self, frame_id: FrameId);

    /// Find a frame to evict with the replace policy. Only frames that are
    /// marked as evictable and not pinned are candidates.
    ///
    /// The returned frame is a candidate only: the caller has to confirm it
    /// under the translation table lock, evict it, and then mark it as
    /// non-evictable. A candidate that turns out to be busy simply stays.
    ///
    /// Return None if no candidate was found within the scan bound.
    fn evict(&self, is_pinned: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Toggle whether a frame is evictable or non-evictable. A frame becomes
    /// evictable when a page is installed in it and non-evictable when it
    /// goes back to the free list. Note that size is equal to number of
    /// evictable entries.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Check if a frame is evictable.
    fn is_evictable(&self, frame_id: FrameId) -> bool;

    /// replace size.
    fn size(&self) -> usize;
}

const FREE: u8 = 0;
const RESIDENT: u8 = 1;
const REFERENCED: u8 = 2;

/// ClockReplacer implements the clock (second chance) replacement policy.
///
/// Every frame carries a reference bit that is set on access with a single
/// atomic store, so page hits never contend on a shared lock. The arm walks
/// the frames in a circle: a referenced frame has its bit cleared and is
/// skipped, the first unreferenced and unpinned frame is the victim.
///
/// The arm is never reset between calls. Each call walks at most `sweeps`
/// full revolutions; with two revolutions every unpinned frame is found even
/// if all of them were referenced when the scan started.
#[derive(Debug)]
pub struct ClockReplacer {
    states: Vec<AtomicU8>,
    arm: Mutex<usize>,
    sweeps: usize,
    size: AtomicUsize,
}

impl ClockReplacer {
    pub fn new(capacity: usize, sweeps: usize) -> Self {
        let states = (0..capacity).map(|_| AtomicU8::new(FREE)).collect();
        ClockReplacer { states, arm: Mutex::new(0), sweeps: sweeps.max(1), size: AtomicUsize::new(0) }
    }

    /// Current arm position, i.e., the next frame the scan looks at.
    pub fn arm(&self) -> usize {
        match self.arm.lock() {
            Ok(arm) => *arm,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&self, frame_id: FrameId) {
        if let Some(state) = self.states.get(frame_id) {
            let _ = state.compare_exchange(RESIDENT, REFERENCED, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    fn evict(&self, is_pinned: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let n = self.states.len();
        if n == 0 || self.size() == 0 {
            return None;
        }
        let mut arm = match self.arm.lock() {
            Ok(arm) => arm,
            Err(_) => return None,
        };
        for _ in 0..n * self.sweeps {
            let frame_id = *arm;
            *arm = (frame_id + 1) % n;
            let state = &self.states[frame_id];
            match state.load(Ordering::Acquire) {
                RESIDENT if !is_pinned(frame_id) => return Some(frame_id),
                REFERENCED if !is_pinned(frame_id) => {
                    let _ = state.compare_exchange(REFERENCED, RESIDENT, Ordering::AcqRel, Ordering::Relaxed);
                }
                _ => {}
            }
        }
        None
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let Some(state) = self.states.get(frame_id) else {
            return;
        };
        let new = if evictable { RESIDENT } else { FREE };
        let old = state.swap(new, Ordering::AcqRel);
        match (old == FREE, evictable) {
            (true, true) => {
                self.size.fetch_add(1, Ordering::AcqRel);
            }
            (false, false) => {
                self.size.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }

    fn is_evictable(&self, frame_id: FrameId) -> bool {
        match self.states.get(frame_id) {
            Some(state) => state.load(Ordering::Acquire) != FREE,
            None => false,
        }
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }
}
