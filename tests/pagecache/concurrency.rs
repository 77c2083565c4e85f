use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::info;
use pagecache::config::CacheOptions;
use pagecache::error::{Error, Result};
use pagecache::harness::{HarnessConfig, RandomHarness};
use pagecache::pagecache::{LockMode, MappedFile, OpenOption, PageId};
use pagecache::storage::adversary::AdversaryRates;
use pagecache::storage::disk::DiskFileSystem;
use pagecache::storage::memory::MemoryFileSystem;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::fixture::{Fixture, TempDir};

fn join<T>(handles: Vec<thread::JoinHandle<Result<T>>>) -> Result<Vec<T>> {
    handles.into_iter().map(|handle| handle.join().map_err(|_| Error::internal("worker panicked"))?).collect()
}

/// Run `op` again as long as it fails transiently.
fn retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempts = 0;
    loop {
        match op() {
            Err(err) if err.is_transient() && attempts < 100 => attempts += 1,
            result => return result,
        }
    }
}

#[test]
fn test_writers_exclude_each_other() -> Result<()> {
    setup!(fixture, 8, 64);
    let file = Arc::new(fixture.cache.map("counters", 64, &[OpenOption::Create])?);
    let (threads, rounds, pages) = (8, 200, 32u64);

    let handles = (0..threads)
        .map(|t| {
            let file = Arc::clone(&file);
            thread::spawn(move || -> Result<()> {
                let mut rng = StdRng::seed_from_u64(t);
                for _ in 0..rounds {
                    let mut cursor = file.io(rng.gen_range(0..pages), LockMode::ExclusiveWrite, &[])?;
                    assert!(cursor.next()?);
                    let count = cursor.get_u64_at(0);
                    cursor.put_u64_at(0, count + 1);
                }
                Ok(())
            })
        })
        .collect::<Vec<_>>();

    let cache = &fixture.cache;
    let mut max_resident = 0;
    while handles.iter().any(|handle| !handle.is_finished()) {
        max_resident = max_resident.max(cache.resident_pages());
        thread::yield_now();
    }
    join(handles)?;
    assert!(max_resident <= 8);

    let mut total = 0;
    for page_id in 0..pages {
        let mut cursor = file.io(page_id, LockMode::SharedRead, &[])?;
        if cursor.next()? {
            total += cursor.get_u64();
        }
    }
    assert_eq!(threads * rounds, total);
    info!("counters: {}", cache.metrics());
    teardown!(fixture);
    Ok(())
}

#[test]
fn test_readers_never_see_torn_pages() -> Result<()> {
    setup!(fixture, 4, 128);
    let file = Arc::new(fixture.cache.map("torn", 128, &[OpenOption::Create])?);
    fill(&file, 0, 0)?;
    let done = Arc::new(AtomicBool::new(false));

    let readers = (0..4)
        .map(|_| {
            let file = Arc::clone(&file);
            let done = Arc::clone(&done);
            thread::spawn(move || -> Result<u64> {
                let mut reads = 0;
                while !done.load(Ordering::Acquire) {
                    let mut cursor = file.io(0, LockMode::SharedRead, &[])?;
                    assert!(cursor.next()?);
                    let (first, last) = loop {
                        let first = cursor.get_u64_at(0);
                        let last = cursor.get_u64_at(120);
                        if !cursor.should_retry() {
                            break (first, last);
                        }
                    };
                    assert_eq!(first, last, "torn read");
                    reads += 1;
                }
                Ok(reads)
            })
        })
        .collect::<Vec<_>>();

    for value in 1..2000 {
        fill(&file, 0, value)?;
    }
    done.store(true, Ordering::Release);
    let reads = join(readers)?;
    info!("reads per reader: {:?}", reads);
    teardown!(fixture);
    Ok(())
}

fn fill(file: &MappedFile, page_id: PageId, value: u64) -> Result<()> {
    let mut cursor = file.io(page_id, LockMode::ExclusiveWrite, &[])?;
    assert!(cursor.next()?);
    for at in (0..cursor.payload_size()).step_by(8) {
        cursor.put_u64_at(at, value);
    }
    Ok(())
}

#[test]
fn test_concurrent_writes_survive_mischief() -> Result<()> {
    let options = CacheOptions { verify_writes: true, ..Fixture::options() };
    let rates = AdversaryRates { mischief_rate: 0.5, ..Default::default() };
    setup!(fixture, 8, 32, options, rates);
    let file = Arc::new(fixture.cache.map("mischief", 32, &[OpenOption::Create])?);
    let (threads, pages, rounds) = (8u64, 100u64, 10u64);

    let handles = (0..threads)
        .map(|t| {
            let file = Arc::clone(&file);
            thread::spawn(move || -> Result<()> {
                for round in 0..rounds {
                    // thread t owns the pages p with p % threads == t.
                    for page_id in (t..pages).step_by(threads as usize) {
                        retry(|| {
                            let mut cursor = file.io(page_id, LockMode::ExclusiveWrite, &[])?;
                            assert!(cursor.next()?);
                            cursor.put_u64(page_id);
                            cursor.put_u64(round);
                            Ok(())
                        })?;
                    }
                }
                Ok(())
            })
        })
        .collect::<Vec<_>>();
    join(handles)?;
    assert!(fixture.adversary.stats().mischiefs > 0);
    assert!(fixture.cache.metrics().eviction_failures > 0);

    fixture.adversary.disable();
    fixture.cache.flush_and_force()?;
    let data = fixture.on_disk("mischief")?;
    assert_eq!(pages as usize * 32, data.len());
    for page_id in 0..pages as usize {
        let page = &data[page_id * 32..(page_id + 1) * 32];
        assert_eq!((page_id as u64).to_le_bytes(), page[0..8], "page {}", page_id);
        assert_eq!((rounds - 1).to_le_bytes(), page[8..16], "page {}", page_id);
    }
    teardown!(fixture);
    Ok(())
}

#[test]
fn test_harness_under_adversarial_io() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = HarnessConfig {
        concurrency: 6,
        commands_per_thread: 500,
        file_count: 3,
        max_pages: 32,
        cache_pages: 12,
        page_size: 128,
        seed: 3,
        mischief_rate: 0.05,
        failure_rate: 0.05,
        error_rate: 0.01,
        ..Default::default()
    };
    let harness = RandomHarness::new(config, Fixture::options())?;
    let report = harness.run(Arc::new(MemoryFileSystem::new()))?;
    info!("harness report:\n{}", report);
    assert_eq!(3000, report.commands.values().sum::<u64>());
    assert!(report.records_verified > 0);
    assert!(report.injected_mischiefs + report.injected_failures + report.injected_errors > 0);
    Ok(())
}

#[test]
fn test_harness_on_disk() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new();
    let config = HarnessConfig { concurrency: 2, commands_per_thread: 200, ..Default::default() };
    let harness = RandomHarness::new(config, Fixture::options())?;
    let fs = Arc::new(DiskFileSystem::new(&dir.path)?);
    let report = harness.run(fs)?;
    assert_eq!(0, report.failures);
    assert!(dir.path.join(Path::new("harness-0.db")).exists());
    Ok(())
}
