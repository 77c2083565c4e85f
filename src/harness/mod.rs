//! Randomized stress testing of the page cache.
//!
//! A number of threads run random map, unmap, record read and write, touch
//! and flush commands against one cache, optionally on top of a file system
//! that injects mischief, transient failures and hard errors. Every thread
//! owns a disjoint set of record slots and keeps a model of what it wrote,
//! so reads can be checked exactly while the run goes on. Afterwards the
//! adversary is silenced, the cache is flushed and closed, and every record
//! is checked bit for bit in the backing files.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::CacheOptions;
use crate::error::{Error, Result};
use crate::pagecache::{LockMode, MappedFile, MetricsSnapshot, OpenOption, PageCache, PageId};
use crate::storage::adversary::{AdversarialFileSystem, Adversary, AdversaryRates};
use crate::storage::{page_offset, FileSystem};

pub mod command;
pub mod record;

use command::{Command, CommandGenerator, CommandKind, CommandWeights};
use record::{Record, RecordFormat, StandardRecordFormat};

/// How often a command failing with a transient error is repeated before it
/// counts as failed.
const TRANSIENT_RETRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub concurrency: usize,
    pub commands_per_thread: usize,
    pub file_count: usize,
    /// Pages per file the records are spread over.
    pub max_pages: u64,
    pub cache_pages: usize,
    pub page_size: usize,
    pub reserved_bytes: usize,
    pub seed: u64,
    pub weights: CommandWeights,
    pub mischief_rate: f64,
    pub failure_rate: f64,
    pub error_rate: f64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            concurrency: 4,
            commands_per_thread: 1000,
            file_count: 2,
            max_pages: 64,
            cache_pages: 32,
            page_size: 256,
            reserved_bytes: 0,
            seed: 1,
            weights: CommandWeights::default(),
            mischief_rate: 0.0,
            failure_rate: 0.0,
            error_rate: 0.0,
        }
    }
}

impl HarnessConfig {
    pub fn rates(&self) -> AdversaryRates {
        AdversaryRates {
            mischief_rate: self.mischief_rate,
            failure_rate: self.failure_rate,
            error_rate: self.error_rate,
        }
    }
}

/// Outcome of a harness run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarnessReport {
    pub commands: BTreeMap<CommandKind, u64>,
    /// Commands repeated after a transient error.
    pub retries: u64,
    /// Commands given up on after a hard error, or after too many retries.
    pub failures: u64,
    pub records_written: u64,
    pub records_verified: u64,
    pub injected_mischiefs: u64,
    pub injected_failures: u64,
    pub injected_errors: u64,
    pub metrics: MetricsSnapshot,
}

impl HarnessReport {
    fn merge(&mut self, other: &HarnessReport) {
        for (kind, count) in &other.commands {
            *self.commands.entry(*kind).or_default() += count;
        }
        self.retries += other.retries;
        self.failures += other.failures;
        self.records_written += other.records_written;
    }
}

impl Display for HarnessReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (kind, count) in &self.commands {
            writeln!(f, "{:<14} {}", kind, count)?;
        }
        writeln!(f, "retries        {}", self.retries)?;
        writeln!(f, "failures       {}", self.failures)?;
        writeln!(f, "written        {}", self.records_written)?;
        writeln!(f, "verified       {}", self.records_verified)?;
        writeln!(
            f,
            "injected       mischief={} failure={} error={}",
            self.injected_mischiefs, self.injected_failures, self.injected_errors
        )?;
        write!(f, "{}", self.metrics)
    }
}

/// Where a record slot lives in its file.
#[derive(Debug, Clone, Copy)]
struct Layout {
    page_size: usize,
    record_size: usize,
    records_per_page: u64,
}

impl Layout {
    fn locate(&self, slot: u64) -> (PageId, usize) {
        let page_id = slot / self.records_per_page;
        let offset = (slot % self.records_per_page) as usize * self.record_size;
        (page_id, offset)
    }
}

#[derive(Debug)]
pub struct RandomHarness {
    config: HarnessConfig,
    options: CacheOptions,
    format: Arc<dyn RecordFormat>,
}

impl RandomHarness {
    pub fn new(config: HarnessConfig, options: CacheOptions) -> Result<RandomHarness> {
        Self::with_format(config, options, Arc::new(StandardRecordFormat))
    }

    pub fn with_format(
        config: HarnessConfig,
        options: CacheOptions,
        format: Arc<dyn RecordFormat>,
    ) -> Result<RandomHarness> {
        if config.concurrency == 0 || config.file_count == 0 || config.max_pages == 0 {
            return Err(Error::value("harness needs at least one thread, file and page"));
        }
        if config.cache_pages < config.concurrency + 2 {
            return Err(Error::value(format!(
                "{} cache pages are too few for {} threads",
                config.cache_pages, config.concurrency
            )));
        }
        if config.reserved_bytes + format.record_size() > config.page_size {
            return Err(Error::value(format!(
                "page size {} leaves no room for a record of {} bytes",
                config.page_size,
                format.record_size()
            )));
        }
        Ok(RandomHarness { config, options, format })
    }

    fn layout(&self) -> Layout {
        let record_size = self.format.record_size();
        let payload = self.config.page_size - self.config.reserved_bytes;
        Layout {
            page_size: self.config.page_size,
            record_size,
            records_per_page: (payload / record_size) as u64,
        }
    }

    fn paths(&self) -> Vec<PathBuf> {
        (0..self.config.file_count).map(|i| PathBuf::from(format!("harness-{}.db", i))).collect()
    }

    /// Run the configured commands against a fresh cache over `fs`, then
    /// verify every record written in the backing files.
    pub fn run(&self, fs: Arc<dyn FileSystem>) -> Result<HarnessReport> {
        let paths = self.paths();
        for path in &paths {
            if fs.exists(path) {
                fs.delete(path)?;
            }
        }

        let adversary = Arc::new(Adversary::new(self.config.rates(), self.config.seed ^ 0x5eed));
        let adversarial = Arc::new(AdversarialFileSystem::new(Arc::clone(&fs), Arc::clone(&adversary)));
        // mischief goes unnoticed unless written pages are read back.
        let options = CacheOptions {
            max_cached_pages: self.config.cache_pages,
            page_size: self.config.page_size,
            verify_writes: self.options.verify_writes || self.config.mischief_rate > 0.0,
            ..self.options.clone()
        };
        let cache = PageCache::with_options(adversarial, options)?;
        info!(
            "harness: {} threads x {} commands on {} files, rates {:?}",
            self.config.concurrency,
            self.config.commands_per_thread,
            self.config.file_count,
            self.config.rates()
        );

        let layout = self.layout();
        let outcomes = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.config.concurrency);
            for id in 0..self.config.concurrency {
                let worker = Worker::new(self, id, &cache, &paths, layout)?;
                let handle = thread::Builder::new()
                    .name(format!("harness-{}", id))
                    .spawn_scoped(scope, move || worker.run())?;
                handles.push(handle);
            }
            handles
                .into_iter()
                .map(|handle| handle.join().map_err(|_| Error::internal("harness worker panicked"))?)
                .collect::<Result<Vec<_>>>()
        })?;

        adversary.disable();
        let mut report = HarnessReport::default();
        let mut expected = BTreeMap::new();
        for outcome in outcomes {
            report.merge(&outcome.report);
            for mapping in outcome.mappings.into_iter().flatten() {
                if let Err(err) = mapping.unmap() {
                    warn!("harness: final unmap failed: {}", err);
                }
            }
            expected.extend(outcome.written);
        }
        cache.flush_and_force()?;
        cache.close()?;

        report.records_verified = self.verify(fs.as_ref(), &paths, layout, &expected)?;
        let stats = adversary.stats();
        report.injected_mischiefs = stats.mischiefs;
        report.injected_failures = stats.failures;
        report.injected_errors = stats.errors;
        report.metrics = cache.metrics();
        info!("harness: verified {} records", report.records_verified);
        Ok(report)
    }

    /// Check every expected record, keyed by (file, slot), in the files as
    /// the file system holds them.
    fn verify(
        &self,
        fs: &dyn FileSystem,
        paths: &[PathBuf],
        layout: Layout,
        expected: &BTreeMap<(usize, u64), Record>,
    ) -> Result<u64> {
        let mut pages: BTreeMap<(usize, PageId), Vec<(usize, Record)>> = BTreeMap::new();
        for ((file, slot), record) in expected {
            let (page_id, offset) = layout.locate(*slot);
            pages.entry((*file, page_id)).or_default().push((offset, *record));
        }

        let mut contents: HashMap<usize, Vec<u8>> = HashMap::new();
        let mut verified = 0;
        for ((file, page_id), records) in pages {
            if !contents.contains_key(&file) {
                contents.insert(file, read_file(fs, &paths[file])?);
            }
            let data = &contents[&file];
            let start = page_offset(page_id, layout.page_size) as usize;
            let mut page = vec![0u8; layout.page_size];
            if start < data.len() {
                let end = data.len().min(start + layout.page_size);
                page[..end - start].copy_from_slice(&data[start..end]);
            }
            verified += self
                .format
                .verify_page(page_id, &page, &records)
                .map_err(|err| Error::Verification(format!("{}: {}", paths[file].display(), err)))?;
        }
        Ok(verified as u64)
    }
}

fn read_file(fs: &dyn FileSystem, path: &Path) -> Result<Vec<u8>> {
    if fs.exists(path) {
        fs.read_all(path)
    } else {
        Ok(vec![])
    }
}

/// What a worker thread leaves behind: the last record written to each of
/// its slots, and the mappings it still holds.
struct Outcome {
    report: HarnessReport,
    written: HashMap<(usize, u64), Record>,
    mappings: Vec<Option<MappedFile>>,
}

struct Worker<'a> {
    id: usize,
    cache: &'a PageCache,
    paths: &'a [PathBuf],
    format: &'a dyn RecordFormat,
    layout: Layout,
    reserved_bytes: usize,
    commands: usize,
    generator: CommandGenerator,
    rng: StdRng,
    generation: u64,
    mappings: Vec<Option<MappedFile>>,
    written: HashMap<(usize, u64), Record>,
    report: HarnessReport,
}

impl<'a> Worker<'a> {
    fn new(
        harness: &'a RandomHarness,
        id: usize,
        cache: &'a PageCache,
        paths: &'a [PathBuf],
        layout: Layout,
    ) -> Result<Worker<'a>> {
        let config = &harness.config;
        let generator = CommandGenerator::new(
            &config.weights,
            id,
            config.concurrency,
            paths.len(),
            layout.records_per_page * config.max_pages,
            config.max_pages,
        )?;
        Ok(Worker {
            id,
            cache,
            paths,
            format: harness.format.as_ref(),
            layout,
            reserved_bytes: config.reserved_bytes,
            commands: config.commands_per_thread,
            generator,
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(id as u64)),
            generation: 0,
            mappings: (0..paths.len()).map(|_| None).collect(),
            written: HashMap::new(),
            report: HarnessReport::default(),
        })
    }

    fn run(mut self) -> Result<Outcome> {
        for _ in 0..self.commands {
            let command = self.generator.next(&mut self.rng);
            *self.report.commands.entry(command.kind()).or_default() += 1;
            self.run_command(command)?;
        }
        debug!("harness worker {} done: {} records", self.id, self.written.len());
        Ok(Outcome { report: self.report, written: self.written, mappings: self.mappings })
    }

    /// Run one command, repeating it on transient errors. Hard errors are
    /// counted, a wrong record read ends the run.
    fn run_command(&mut self, command: Command) -> Result<()> {
        let record = match command {
            Command::WriteRecord { slot, .. } => {
                self.generation += 1;
                Some(Record::new(slot, self.generation, self.id as u32))
            }
            _ => None,
        };
        let mut attempt = 0;
        loop {
            match self.execute(command, record) {
                Ok(()) => return Ok(()),
                Err(err @ Error::Verification(_)) => return Err(err),
                Err(err) if err.is_transient() && command.is_retryable() && attempt < TRANSIENT_RETRIES => {
                    attempt += 1;
                    self.report.retries += 1;
                    debug!("harness worker {}: retry {} after {}", self.id, command, err);
                }
                Err(err) => {
                    self.report.failures += 1;
                    debug!("harness worker {}: {} failed: {}", self.id, command, err);
                    return Ok(());
                }
            }
        }
    }

    fn execute(&mut self, command: Command, record: Option<Record>) -> Result<()> {
        match command {
            Command::Map { file } => self.mapping(file).map(|_| ()),
            Command::Unmap { file } => match self.mappings[file].take() {
                Some(mapping) => mapping.unmap(),
                None => Ok(()),
            },
            Command::ReadRecord { file, slot } => self.read_record(file, slot),
            Command::WriteRecord { file, slot } => match record {
                Some(record) => self.write_record(file, slot, record),
                None => Err(Error::internal("write command without record")),
            },
            Command::Touch { file, page_id } => self.touch(file, page_id),
            Command::FlushFile { file } => self.mapping(file)?.flush(),
            Command::FlushCache => self.cache.flush_and_force(),
        }
    }

    /// The thread's mapping of the file, mapped on first use.
    fn mapping(&mut self, file: usize) -> Result<&MappedFile> {
        if self.mappings[file].is_none() {
            let mut options = vec![OpenOption::Create];
            if self.reserved_bytes > 0 {
                options.push(OpenOption::ReservedBytes(self.reserved_bytes));
            }
            let mapping = self.cache.map(&self.paths[file], self.layout.page_size, &options)?;
            self.mappings[file] = Some(mapping);
        }
        self.mappings[file].as_ref().ok_or_else(|| Error::internal("mapping vanished"))
    }

    fn read_record(&mut self, file: usize, slot: u64) -> Result<()> {
        let (page_id, offset) = self.layout.locate(slot);
        let format = self.format;
        let mut cursor = self.mapping(file)?.io(page_id, LockMode::SharedRead, &[])?;
        let actual = if cursor.next()? { format.read_record(&mut cursor, offset)? } else { None };
        cursor.close();

        let expected = self.written.get(&(file, slot)).copied();
        if actual != expected {
            return Err(Error::Verification(format!(
                "worker {} read {:?} from file {} slot {}, expected {:?}",
                self.id, actual, file, slot, expected
            )));
        }
        Ok(())
    }

    fn write_record(&mut self, file: usize, slot: u64, record: Record) -> Result<()> {
        let (page_id, offset) = self.layout.locate(slot);
        let format = self.format;
        let mut cursor = self.mapping(file)?.io(page_id, LockMode::ExclusiveWrite, &[])?;
        if !cursor.next()? {
            return Err(Error::internal(format!("cannot move to page {} of file {}", page_id, file)));
        }
        format.write_record(&mut cursor, offset, &record)?;
        cursor.close();
        self.written.insert((file, slot), record);
        self.report.records_written += 1;
        Ok(())
    }

    /// Fault the page in and read from it without checking anything.
    fn touch(&mut self, file: usize, page_id: PageId) -> Result<()> {
        let mut cursor = self.mapping(file)?.io(page_id, LockMode::SharedRead, &[])?;
        if cursor.next()? {
            loop {
                cursor.get_u64();
                if !cursor.should_retry() {
                    break;
                }
            }
        }
        Ok(())
    }
}
