use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::Result;

use super::{FrameId, PageId};

const SHARDS: usize = 16;

pub type Shard = HashMap<PageId, Slot>;

/// An entry of the translation table.
#[derive(Debug, Clone)]
pub enum Slot {
    /// Some thread is faulting the page in. Everybody else who wants the page
    /// waits on the latch and then looks again.
    Faulting(Arc<Latch>),
    /// The page lives in the given frame.
    Resident(FrameId),
}

/// One-shot latch that coalesces concurrent faults of the same page.
#[derive(Debug, Default)]
pub struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Latch {
        Latch::default()
    }

    pub fn wait(&self) -> Result<()> {
        let guard = self.released.lock()?;
        let _guard = self.cond.wait_while(guard, |released| !*released)?;
        Ok(())
    }

    pub fn release(&self) {
        let mut guard = match self.released.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = true;
        self.cond.notify_all();
    }
}

/// Per-file mapping of logical page ids to frames. The table is split into
/// shards, each behind its own lock, so that faults and evictions of
/// unrelated pages do not serialize on one lock.
///
/// The shard lock of a page guards its entry and is also the lock under
/// which frames bound to the page are pinned and evicted.
#[derive(Debug)]
pub struct TranslationTable {
    shards: Vec<Mutex<Shard>>,
}

impl Default for TranslationTable {
    fn default() -> Self {
        TranslationTable::new()
    }
}

impl TranslationTable {
    pub fn new() -> TranslationTable {
        TranslationTable { shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    /// Lock the shard the given page belongs to.
    pub fn lock(&self, page_id: PageId) -> Result<MutexGuard<'_, Shard>> {
        Ok(self.shards[(page_id % SHARDS as u64) as usize].lock()?)
    }

    pub fn shards(&self) -> impl Iterator<Item = &Mutex<Shard>> {
        self.shards.iter()
    }

    /// Number of pages that are resident, faults in progress excluded.
    #[cfg(test)]
    pub(crate) fn resident_count(&self) -> Result<usize> {
        let mut count = 0;
        for shard in &self.shards {
            let shard = shard.lock()?;
            count += shard.values().filter(|slot| matches!(slot, Slot::Resident(_))).count();
        }
        Ok(count)
    }

    /// All resident pages and their frames, sorted by page id.
    pub fn resident_pages(&self) -> Result<Vec<(PageId, FrameId)>> {
        let mut pages = vec![];
        for shard in &self.shards {
            let shard = shard.lock()?;
            for (page_id, slot) in shard.iter() {
                if let Slot::Resident(frame_id) = slot {
                    pages.push((*page_id, *frame_id));
                }
            }
        }
        pages.sort_unstable();
        Ok(pages)
    }
}
