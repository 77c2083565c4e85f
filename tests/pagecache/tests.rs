use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use log::info;
use pagecache::config::{CacheOptions, UnmapPolicy};
use pagecache::error::{Error, Result};
use pagecache::pagecache::{LockMode, OpenOption, PageCache};
use pagecache::storage::disk::DiskFileSystem;
use pagecache::storage::FileSystem;

use super::fixture::{read_u64, write_u64, Fixture, TempDir};

#[test]
fn test_write_flush_remap() -> Result<()> {
    setup!(fixture, 16, 64);
    fixture.mem.write_all(Path::new("hundred"), &vec![0u8; 100 * 64])?;

    let file = fixture.cache.map("hundred", 64, &[])?;
    assert_eq!(100, file.page_count());
    write_u64(&file, 50, 8, 0xdead_beef)?;
    file.flush()?;
    file.unmap()?;

    let data = fixture.on_disk("hundred")?;
    assert_eq!(100 * 64, data.len());
    assert_eq!(0xdead_beefu64.to_le_bytes(), data[50 * 64 + 8..50 * 64 + 16]);

    let file = fixture.cache.map("hundred", 64, &[])?;
    assert_eq!(Some(0xdead_beef), read_u64(&file, 50, 8)?);
    assert_eq!(Some(99), file.last_page_id());
    assert_eq!(None, read_u64(&file, 100, 0)?);
    teardown!(fixture);
    Ok(())
}

#[test]
fn test_eviction_writes_back() -> Result<()> {
    let options = CacheOptions { background_eviction: false, ..Fixture::options() };
    setup!(fixture, 2, 32, options);
    let file = fixture.cache.map("three", 32, &[OpenOption::Create])?;
    for page_id in 0..3 {
        write_u64(&file, page_id, 0, page_id + 1)?;
    }
    let metrics = fixture.cache.metrics();
    assert_eq!(1, metrics.evictions);
    assert_eq!(2, fixture.cache.resident_pages());

    // the evicted page went to the file, the others are still dirty.
    let data = fixture.on_disk("three")?;
    assert_eq!(1u64.to_le_bytes(), data[0..8]);
    assert_eq!(Some(1), read_u64(&file, 0, 0)?);
    teardown!(fixture);
    Ok(())
}

#[test]
fn test_unmap_blocks_until_cursors_close() -> Result<()> {
    setup!(fixture, 8, 32);
    let file = fixture.cache.map("blocking", 32, &[OpenOption::Create])?;
    let mut cursor = file.io(0, LockMode::ExclusiveWrite, &[])?;
    assert!(cursor.next()?);
    cursor.put_u64(7);

    let started = Instant::now();
    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cursor.close();
    });
    file.unmap()?;
    assert!(started.elapsed() >= Duration::from_millis(40));
    closer.join().map_err(|_| Error::internal("closer panicked"))?;

    assert_eq!(7u64.to_le_bytes(), fixture.on_disk("blocking")?[0..8]);
    teardown!(fixture);
    Ok(())
}

#[test]
fn test_unmap_fails_with_open_cursor() -> Result<()> {
    let options = CacheOptions { unmap_policy: UnmapPolicy::Fail, ..Fixture::options() };
    setup!(fixture, 8, 32, options);
    let file = fixture.cache.map("in-use", 32, &[OpenOption::Create])?;
    let mut cursor = file.io(0, LockMode::ExclusiveWrite, &[])?;
    assert!(cursor.next()?);
    cursor.put_u64(9);

    let err = file.unmap().unwrap_err();
    assert!(matches!(err, Error::FileInUse(_)), "{}", err);
    cursor.close();

    // the file is kept with its dirty page, a new mapping picks it up.
    let file = fixture.cache.map("in-use", 32, &[])?;
    assert_eq!(Some(9), read_u64(&file, 0, 0)?);
    file.unmap()?;
    assert_eq!(9u64.to_le_bytes(), fixture.on_disk("in-use")?[0..8]);
    teardown!(fixture);
    Ok(())
}

#[test]
fn test_pinned_page_is_never_evicted() -> Result<()> {
    let options = CacheOptions { background_eviction: false, ..Fixture::options() };
    setup!(fixture, 2, 32, options);
    let file = fixture.cache.map("pinned", 32, &[OpenOption::Create])?;
    write_u64(&file, 0, 0, 100)?;

    let mut pinned = file.io(0, LockMode::SharedRead, &[])?;
    assert!(pinned.next()?);
    for page_id in 1..6 {
        write_u64(&file, page_id, 0, page_id)?;
    }
    assert!(fixture.cache.metrics().evictions >= 4);
    // the page never moved, the read needs no retry.
    assert_eq!(100, pinned.get_u64());
    assert!(!pinned.should_retry());
    pinned.close();
    teardown!(fixture);
    Ok(())
}

#[test]
fn test_reserved_bytes_on_disk() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new();
    let options = CacheOptions { background_eviction: false, ..Default::default() };
    let fs = Arc::new(DiskFileSystem::new(&dir.path)?);
    let cache = PageCache::open(fs.clone(), 4, 64, options.clone())?;
    let file = cache.map("reserved.db", 64, &[OpenOption::Create, OpenOption::ReservedBytes(16)])?;
    assert_eq!(48, file.payload_size());

    let mut cursor = file.io(0, LockMode::ExclusiveWrite, &[])?;
    for page in 0..3u64 {
        assert!(cursor.next()?);
        cursor.put_u64_at(40, page + 1);
        assert!(!cursor.check_and_clear_bounds_flag());
        // the reserved bytes are out of reach.
        cursor.put_u64_at(48, u64::MAX);
        assert!(cursor.check_and_clear_bounds_flag());
    }
    cursor.close();
    file.unmap()?;
    cache.close()?;

    let data = fs.read_all(Path::new("reserved.db"))?;
    assert_eq!(3 * 64, data.len());
    for page in 0..3usize {
        let start = page * 64;
        assert_eq!((page as u64 + 1).to_le_bytes(), data[start + 40..start + 48]);
        assert!(data[start + 48..start + 64].iter().all(|b| *b == 0));
    }

    let cache = PageCache::open(fs, 4, 64, options)?;
    let file = cache.map("reserved.db", 64, &[OpenOption::ReservedBytes(16)])?;
    assert_eq!(3, file.page_count());
    assert_eq!(Some(2), read_u64(&file, 1, 40)?);
    file.unmap()?;
    cache.close()?;
    Ok(())
}

#[test]
fn test_concurrent_faults_coalesce() -> Result<()> {
    setup!(fixture, 16, 64);
    fixture.mem.write_all(Path::new("shared"), &[5u8; 64])?;
    let file = Arc::new(fixture.cache.map("shared", 64, &[])?);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles = (0..threads)
        .map(|_| {
            let file = Arc::clone(&file);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Option<u64>> {
                barrier.wait();
                read_u64(&file, 0, 0)
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        let value = handle.join().map_err(|_| Error::internal("reader panicked"))??;
        assert_eq!(Some(u64::from_le_bytes([5u8; 8])), value);
    }
    let metrics = fixture.cache.metrics();
    assert_eq!(1, metrics.faults);
    assert_eq!(threads as u64 - 1, metrics.hits);
    teardown!(fixture);
    Ok(())
}

#[test]
fn test_flush_and_force_async() -> Result<()> {
    setup!(fixture, 8, 32);
    let first = fixture.cache.map("first", 32, &[OpenOption::Create])?;
    let second = fixture.cache.map("second", 32, &[OpenOption::Create])?;
    write_u64(&first, 0, 0, 1)?;
    write_u64(&second, 1, 0, 2)?;

    fixture.cache.flush_and_force_async()?.wait()?;
    assert_eq!(1u64.to_le_bytes(), fixture.on_disk("first")?[0..8]);
    assert_eq!(2u64.to_le_bytes(), fixture.on_disk("second")?[32..40]);
    assert_eq!(2, fixture.cache.metrics().flushes);
    info!("after async flush: {}", fixture.cache.metrics());
    teardown!(fixture);
    Ok(())
}

#[test]
fn test_use_after_close() -> Result<()> {
    setup!(fixture, 8, 32);
    let file = fixture.cache.map("late", 32, &[OpenOption::Create])?;
    write_u64(&file, 0, 0, 3)?;
    teardown!(fixture);

    assert_eq!(3u64.to_le_bytes(), fixture.on_disk("late")?[0..8]);
    assert!(matches!(file.io(0, LockMode::SharedRead, &[]), Err(Error::Closed(_))));
    assert!(matches!(fixture.cache.map("other", 32, &[OpenOption::Create]), Err(Error::Closed(_))));
    // closing again is fine, so is dropping the handle.
    fixture.cache.close()?;
    drop(file);
    Ok(())
}
