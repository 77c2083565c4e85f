use std::fmt::{Display, Formatter};

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pagecache::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Map,
    Unmap,
    ReadRecord,
    WriteRecord,
    Touch,
    FlushFile,
    FlushCache,
}

impl CommandKind {
    pub const ALL: [CommandKind; 7] = [
        CommandKind::Map,
        CommandKind::Unmap,
        CommandKind::ReadRecord,
        CommandKind::WriteRecord,
        CommandKind::Touch,
        CommandKind::FlushFile,
        CommandKind::FlushCache,
    ];
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandKind::Map => "map",
            CommandKind::Unmap => "unmap",
            CommandKind::ReadRecord => "read_record",
            CommandKind::WriteRecord => "write_record",
            CommandKind::Touch => "touch",
            CommandKind::FlushFile => "flush_file",
            CommandKind::FlushCache => "flush_cache",
        };
        write!(f, "{}", name)
    }
}

/// Relative frequency of each command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandWeights {
    pub map: u32,
    pub unmap: u32,
    pub read_record: u32,
    pub write_record: u32,
    pub touch: u32,
    pub flush_file: u32,
    pub flush_cache: u32,
}

impl Default for CommandWeights {
    fn default() -> Self {
        CommandWeights {
            map: 2,
            unmap: 2,
            read_record: 30,
            write_record: 40,
            touch: 10,
            flush_file: 2,
            flush_cache: 1,
        }
    }
}

impl CommandWeights {
    fn weight(&self, kind: CommandKind) -> u32 {
        match kind {
            CommandKind::Map => self.map,
            CommandKind::Unmap => self.unmap,
            CommandKind::ReadRecord => self.read_record,
            CommandKind::WriteRecord => self.write_record,
            CommandKind::Touch => self.touch,
            CommandKind::FlushFile => self.flush_file,
            CommandKind::FlushCache => self.flush_cache,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Map { file: usize },
    Unmap { file: usize },
    ReadRecord { file: usize, slot: u64 },
    WriteRecord { file: usize, slot: u64 },
    Touch { file: usize, page_id: PageId },
    FlushFile { file: usize },
    FlushCache,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Map { .. } => CommandKind::Map,
            Command::Unmap { .. } => CommandKind::Unmap,
            Command::ReadRecord { .. } => CommandKind::ReadRecord,
            Command::WriteRecord { .. } => CommandKind::WriteRecord,
            Command::Touch { .. } => CommandKind::Touch,
            Command::FlushFile { .. } => CommandKind::FlushFile,
            Command::FlushCache => CommandKind::FlushCache,
        }
    }

    /// Unmap consumes the mapping even when it fails, so it is never
    /// repeated.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Command::Unmap { .. })
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Map { file } | Command::Unmap { file } | Command::FlushFile { file } => {
                write!(f, "{} file {}", self.kind(), file)
            }
            Command::ReadRecord { file, slot } | Command::WriteRecord { file, slot } => {
                write!(f, "{} file {} slot {}", self.kind(), file, slot)
            }
            Command::Touch { file, page_id } => write!(f, "touch file {} page {}", file, page_id),
            Command::FlushCache => write!(f, "flush_cache"),
        }
    }
}

/// Draws random commands for one worker thread. Record commands only pick
/// slots the thread owns, that is `slot % threads == thread`.
#[derive(Debug)]
pub struct CommandGenerator {
    kinds: WeightedIndex<u32>,
    thread: u64,
    threads: u64,
    file_count: usize,
    slots_per_file: u64,
    max_pages: u64,
}

impl CommandGenerator {
    pub fn new(
        weights: &CommandWeights,
        thread: usize,
        threads: usize,
        file_count: usize,
        slots_per_file: u64,
        max_pages: u64,
    ) -> Result<CommandGenerator> {
        let kinds = WeightedIndex::new(CommandKind::ALL.iter().map(|kind| weights.weight(*kind)))
            .map_err(|err| Error::value(format!("invalid command weights: {}", err)))?;
        if slots_per_file < threads as u64 {
            return Err(Error::value(format!(
                "{} record slots per file cannot be shared by {} threads",
                slots_per_file, threads
            )));
        }
        Ok(CommandGenerator {
            kinds,
            thread: thread as u64,
            threads: threads as u64,
            file_count,
            slots_per_file,
            max_pages,
        })
    }

    pub fn next(&self, rng: &mut StdRng) -> Command {
        let file = rng.gen_range(0..self.file_count);
        match CommandKind::ALL[self.kinds.sample(rng)] {
            CommandKind::Map => Command::Map { file },
            CommandKind::Unmap => Command::Unmap { file },
            CommandKind::ReadRecord => Command::ReadRecord { file, slot: self.own_slot(rng) },
            CommandKind::WriteRecord => Command::WriteRecord { file, slot: self.own_slot(rng) },
            CommandKind::Touch => Command::Touch { file, page_id: rng.gen_range(0..self.max_pages) },
            CommandKind::FlushFile => Command::FlushFile { file },
            CommandKind::FlushCache => Command::FlushCache,
        }
    }

    fn own_slot(&self, rng: &mut StdRng) -> u64 {
        let owned = (self.slots_per_file - self.thread).div_ceil(self.threads);
        self.thread + self.threads * rng.gen_range(0..owned)
    }
}
