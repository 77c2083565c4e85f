//! Adversarial I/O: a file system wrapper that injects misbehaviour into the
//! page swappers it hands out, used to prove the cache never loses or
//! silently corrupts data.
//!
//! Three independent classes of faults are injected, each with its own rate
//! in `[0, 1]`:
//!
//! mischief: a write reports success but puts wrong bytes into the file.
//! failure:  the operation fails with an `Interrupted` error before touching
//!           the file; repeating it may succeed.
//! error:    the operation fails with a hard error before touching the file.
//!
//! Reads are never the target of mischief, only of failures and errors.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{FileSystem, PageSwapper};
use crate::error::{Error, Result};
use crate::pagecache::PageId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdversaryRates {
    #[serde(default)]
    pub mischief_rate: f64,
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default)]
    pub error_rate: f64,
}

impl AdversaryRates {
    pub fn is_quiet(&self) -> bool {
        self.mischief_rate <= 0.0 && self.failure_rate <= 0.0 && self.error_rate <= 0.0
    }
}

/// What the adversary decided to do with the next operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Injection {
    None,
    Mischief,
    Failure,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdversaryStats {
    pub mischiefs: u64,
    pub failures: u64,
    pub errors: u64,
}

#[derive(Debug)]
pub struct Adversary {
    rates: AdversaryRates,
    rng: Mutex<StdRng>,
    enabled: AtomicBool,
    mischiefs: AtomicU64,
    failures: AtomicU64,
    errors: AtomicU64,
}

impl Adversary {
    pub fn new(rates: AdversaryRates, seed: u64) -> Adversary {
        Adversary {
            rates,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            enabled: AtomicBool::new(true),
            mischiefs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release)
    }

    /// Stop injecting anything, used before the final verification pass.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AdversaryStats {
        AdversaryStats {
            mischiefs: self.mischiefs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Roll the dice for one operation. `allow_mischief` is false for
    /// operations that have no bytes to corrupt.
    pub fn roll(&self, allow_mischief: bool) -> Injection {
        if !self.is_enabled() || self.rates.is_quiet() {
            return Injection::None;
        }
        let (error, failure, mischief) = match self.rng.lock() {
            Ok(mut rng) => (rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()),
            Err(_) => return Injection::None,
        };
        if error < self.rates.error_rate {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Injection::Error;
        }
        if failure < self.rates.failure_rate {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Injection::Failure;
        }
        if allow_mischief && mischief < self.rates.mischief_rate {
            self.mischiefs.fetch_add(1, Ordering::Relaxed);
            return Injection::Mischief;
        }
        Injection::None
    }

    fn check(&self, op: &str, path: &Path) -> Result<()> {
        match self.roll(false) {
            Injection::Failure => Err(Error::io(
                ErrorKind::Interrupted,
                format!("adversarial failure on {} of {}", op, path.display()),
            )),
            Injection::Error => Err(Error::io(
                ErrorKind::Other,
                format!("adversarial error on {} of {}", op, path.display()),
            )),
            _ => Ok(()),
        }
    }

    /// Produce a damaged copy of the buffer: a few bytes get flipped, or the
    /// tail is cut off so that the old content shows through.
    fn corrupt(&self, buf: &[u8]) -> (Vec<u8>, usize) {
        let mut damaged = buf.to_vec();
        let mut len = buf.len();
        if buf.is_empty() {
            return (damaged, len);
        }
        if let Ok(mut rng) = self.rng.lock() {
            if rng.gen_bool(0.5) || buf.len() < 2 {
                let amount = rng.gen_range(1..=4).min(damaged.len());
                for at in rand::seq::index::sample(&mut *rng, damaged.len(), amount) {
                    damaged[at] ^= rng.gen_range(1..=u8::MAX);
                }
            } else {
                len = rng.gen_range(0..buf.len());
            }
        }
        (damaged, len)
    }
}

/// A FileSystem decorator whose swappers consult the adversary before every
/// operation.
#[derive(Debug)]
pub struct AdversarialFileSystem {
    inner: Arc<dyn FileSystem>,
    adversary: Arc<Adversary>,
}

impl AdversarialFileSystem {
    pub fn new(inner: Arc<dyn FileSystem>, adversary: Arc<Adversary>) -> Self {
        Self { inner, adversary }
    }
}

impl FileSystem for AdversarialFileSystem {
    fn open(&self, path: &Path, page_size: usize, create: bool) -> Result<Box<dyn PageSwapper>> {
        self.adversary.check("open", path)?;
        let inner = self.inner.open(path, page_size, create)?;
        Ok(Box::new(AdversarialSwapper { inner, adversary: Arc::clone(&self.adversary) }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.inner.delete(path)
    }

    fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read_all(path)
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.inner.write_all(path, data)
    }
}

#[derive(Debug)]
struct AdversarialSwapper {
    inner: Box<dyn PageSwapper>,
    adversary: Arc<Adversary>,
}

impl PageSwapper for AdversarialSwapper {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<usize> {
        self.adversary.check("read", self.path())?;
        self.inner.read(page_id, buf)
    }

    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        match self.adversary.roll(true) {
            Injection::None => self.inner.write(page_id, buf),
            Injection::Mischief => {
                let (damaged, len) = self.adversary.corrupt(buf);
                trace!("mischief on page {} of {}", page_id, self.path().display());
                if len == buf.len() {
                    self.inner.write(page_id, &damaged)
                } else {
                    // partial write, the remainder keeps whatever was on file.
                    let mut old = vec![0u8; buf.len()];
                    self.inner.read(page_id, &mut old)?;
                    old[..len].copy_from_slice(&buf[..len]);
                    if old == buf {
                        old[len] ^= 0xff;
                    }
                    self.inner.write(page_id, &old)
                }
            }
            Injection::Failure => Err(Error::io(
                ErrorKind::Interrupted,
                format!("adversarial failure writing page {} of {}", page_id, self.path().display()),
            )),
            Injection::Error => Err(Error::io(
                ErrorKind::Other,
                format!("adversarial error writing page {} of {}", page_id, self.path().display()),
            )),
        }
    }

    fn force(&self) -> Result<()> {
        self.adversary.check("force", self.path())?;
        self.inner.force()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
