use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pagecache::{PageCursor, PageId};

/// Encoded size of a `Record`: slot, generation, thread and checksum in
/// bincode's fixed width little endian encoding.
pub const RECORD_SIZE: usize = 24;

/// One record of the stress test. The owning thread bumps the generation
/// with every write, so the last value of a slot is known without any
/// global ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub slot: u64,
    pub generation: u64,
    pub thread: u32,
    checksum: u32,
}

impl Record {
    pub fn new(slot: u64, generation: u64, thread: u32) -> Record {
        Record { slot, generation, thread, checksum: checksum(slot, generation, thread) }
    }

    pub fn is_valid(&self) -> bool {
        self.checksum == checksum(self.slot, self.generation, self.thread)
    }
}

// FNV-1a over the little endian fields.
fn checksum(slot: u64, generation: u64, thread: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    let bytes = slot.to_le_bytes().into_iter().chain(generation.to_le_bytes()).chain(thread.to_le_bytes());
    for byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// How records are laid out in pages and checked against the backing file.
pub trait RecordFormat: Debug + Send + Sync {
    fn record_size(&self) -> usize;

    /// Write the record at `offset` of the cursor's current page.
    fn write_record(&self, cursor: &mut PageCursor, offset: usize, record: &Record) -> Result<()>;

    /// Read the record at `offset` of the cursor's current page, retrying
    /// until the read is consistent. None if the slot was never written.
    fn read_record(&self, cursor: &mut PageCursor, offset: usize) -> Result<Option<Record>>;

    /// Check the expected records, given as (offset, record), against the
    /// raw bytes of a page. Returns the number of records checked.
    fn verify_page(&self, page_id: PageId, page: &[u8], expected: &[(usize, Record)]) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct StandardRecordFormat;

impl StandardRecordFormat {
    fn encode(&self, record: &Record) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(record)?;
        if bytes.len() != RECORD_SIZE {
            return Err(Error::internal(format!("record encoded to {} bytes", bytes.len())));
        }
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Option<Record>> {
        if bytes.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let record: Record = bincode::deserialize(bytes)?;
        if !record.is_valid() {
            return Err(Error::Verification(format!("record checksum mismatch: {}", hex::encode(bytes))));
        }
        Ok(Some(record))
    }
}

impl RecordFormat for StandardRecordFormat {
    fn record_size(&self) -> usize {
        RECORD_SIZE
    }

    fn write_record(&self, cursor: &mut PageCursor, offset: usize, record: &Record) -> Result<()> {
        let bytes = self.encode(record)?;
        cursor.set_offset(offset);
        cursor.put_bytes(&bytes);
        cursor.check_bounds()
    }

    fn read_record(&self, cursor: &mut PageCursor, offset: usize) -> Result<Option<Record>> {
        let mut bytes = [0u8; RECORD_SIZE];
        loop {
            cursor.set_offset(offset);
            cursor.get_bytes(&mut bytes);
            if !cursor.should_retry() {
                break;
            }
        }
        cursor.check_bounds()?;
        self.decode(&bytes)
    }

    fn verify_page(&self, page_id: PageId, page: &[u8], expected: &[(usize, Record)]) -> Result<usize> {
        for (offset, record) in expected {
            let want = self.encode(record)?;
            let got = page.get(*offset..*offset + RECORD_SIZE).unwrap_or_default();
            if got != want.as_slice() {
                return Err(Error::Verification(format!(
                    "page {} offset {}: expected {} got {}",
                    page_id,
                    offset,
                    hex::encode(&want),
                    hex::encode(got)
                )));
            }
        }
        Ok(expected.len())
    }
}
