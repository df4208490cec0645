//! A CAS-locked scrape response cache, shared between every
//! connection task behind an `Arc`.
//!
//! The original, multi-process architecture holds this buffer in an
//! `mmap`-backed shared-memory segment guarded by a lock word so
//! sibling worker processes can read/write it without IPC. This
//! crate runs one process with many tokio tasks, so an `Arc`-held
//! buffer guarded by the same kind of lock word gives every sibling
//! task the identical view without needing a real shared-memory
//! segment — see DESIGN.md for the full justification.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const FREE: u8 = 0;
const IN_USE: u8 = 1;

const RESET_RETRY_SLEEP: Duration = Duration::from_millis(1);
const SCRAPE_RETRY_SLEEP: Duration = Duration::from_millis(10);

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// RAII guard over the cache's lock word. Dropping it (including on
/// an early return or panic unwind) always releases the lock, so a
/// dropped client mid-scrape can never leave the cache permanently
/// locked.
pub struct CacheLock<'a> {
    cache: &'a Cache,
}

impl Drop for CacheLock<'_> {
    fn drop(&mut self) {
        self.cache.lock_word.store(FREE, Ordering::Release);
    }
}

/// Which retry cadence a caller waiting on the lock should use.
/// Resetting (invalidating) the cache is expected to be quick, so it
/// retries faster than a full scrape would.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Reset,
    Scrape,
}

impl WaitKind {
    fn sleep_duration(self) -> Duration {
        match self {
            WaitKind::Reset => RESET_RETRY_SLEEP,
            WaitKind::Scrape => SCRAPE_RETRY_SLEEP,
        }
    }
}

/// A fixed-capacity, CAS-locked scrape response cache. Disabled
/// (`enabled = false`) when the configured `max_age` is zero or the
/// metrics port is zero; every operation on a disabled cache is a
/// no-op that reports failure, per §4.8.
pub struct Cache {
    enabled: bool,
    max_age: Duration,
    max_size: usize,
    lock_word: AtomicU8,
    valid_until: AtomicI64,
    body: Mutex<Vec<u8>>,
}

impl Cache {
    pub fn new(max_age: Duration, max_size: usize, metrics_port: u16) -> Self {
        let enabled = max_age > Duration::ZERO && metrics_port != 0;
        Cache {
            enabled,
            max_age,
            max_size,
            lock_word: AtomicU8::new(FREE),
            valid_until: AtomicI64::new(0),
            body: Mutex::new(Vec::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the cached body is fresh as of `now`.
    pub fn is_fresh(&self) -> bool {
        self.enabled && self.valid_until.load(Ordering::Acquire) > now_millis()
    }

    /// A snapshot of the currently cached body, regardless of
    /// freshness. Callers must check [`Cache::is_fresh`] first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.body.lock().expect("cache body mutex poisoned").clone()
    }

    /// Attempt to acquire the lock, retrying at `kind`'s cadence
    /// until `timeout` elapses. Returns `None` on a disabled cache
    /// or on timeout.
    pub async fn acquire(&self, kind: WaitKind, timeout: Duration) -> Option<CacheLock<'_>> {
        if !self.enabled {
            return None;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .lock_word
                .compare_exchange(FREE, IN_USE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(CacheLock { cache: self });
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(kind.sleep_duration()).await;
        }
    }

    /// Zero the body buffer and mark the cache stale. Requires the
    /// caller to hold the lock; a disabled cache no-ops.
    pub fn invalidate(&self, _guard: &CacheLock<'_>) {
        if !self.enabled {
            return;
        }
        self.body.lock().expect("cache body mutex poisoned").clear();
        self.valid_until.store(0, Ordering::Release);
    }

    /// Append `bytes` to the body buffer. If the resulting length
    /// would be `>= max_size`, invalidates instead and returns
    /// `false`. A disabled cache always returns `false`.
    pub fn append(&self, guard: &CacheLock<'_>, bytes: &[u8]) -> bool {
        if !self.enabled {
            return false;
        }
        let mut body = self.body.lock().expect("cache body mutex poisoned");
        if body.len() + bytes.len() >= self.max_size {
            drop(body);
            self.invalidate(guard);
            return false;
        }
        body.extend_from_slice(bytes);
        true
    }

    /// Mark the body valid until `max_age` from now. Requires the
    /// caller to hold the lock; a disabled cache no-ops.
    pub fn finalize(&self, _guard: &CacheLock<'_>) {
        if !self.enabled {
            return;
        }
        let valid_until = now_millis() + self.max_age.as_millis() as i64;
        self.valid_until.store(valid_until, Ordering::Release);
    }
}
