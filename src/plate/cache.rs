use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::plate::registry::RegistryLookup;
use crate::Clock;

/// Default lifetime of a cached registry answer, in seconds.
pub const DEFAULT_CACHE_TTL_SECS: f64 = 1800.0;

/// Plate → registry answer cache shared by all workers.
///
/// Both found and not-found answers are cached. An entry older than the TTL
/// is evicted on read, and every insert sweeps out the other stale entries. Concurrent misses for the same plate are collapsed:
/// one caller fetches while the others wait for its result.
pub struct PlateCache {
    ttl: f64,
    state: Mutex<CacheState>,
    ready: Condvar,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, (RegistryLookup, f64)>,
    in_flight: HashSet<String>,
}

impl CacheState {
    fn fresh(&mut self, plate: &str, now: f64, ttl: f64) -> Option<RegistryLookup> {
        let (lookup, stored_at) = self.entries.get(plate)?;
        if now - stored_at > ttl {
            self.entries.remove(plate);
            return None;
        }
        Some(lookup.clone())
    }

    fn prune(&mut self, now: f64, ttl: f64) {
        self.entries.retain(|_, (_, stored_at)| now - *stored_at <= ttl);
    }
}

/// Clears the in-flight marker even if the fetch panics.
struct InFlight<'a> {
    cache: &'a PlateCache,
    plate: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.cache.state.lock() {
            state.in_flight.remove(self.plate);
        }
        self.cache.ready.notify_all();
    }
}

impl PlateCache {
    pub fn new(ttl_secs: f64) -> Self {
        Self {
            ttl: ttl_secs,
            state: Mutex::new(CacheState::default()),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("plate cache lock poisoned"))
    }

    /// Unexpired entry for `plate`, evicting it if stale.
    pub fn get(&self, plate: &str, now: f64) -> Result<Option<RegistryLookup>> {
        Ok(self.lock()?.fresh(plate, now, self.ttl))
    }

    pub fn insert(&self, plate: &str, lookup: RegistryLookup, now: f64) -> Result<()> {
        let mut state = self.lock()?;
        state.prune(now, self.ttl);
        state.entries.insert(plate.to_string(), (lookup, now));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached answer, or the result of `fetch` stored under the current time.
    ///
    /// Returns the answer and whether it came from the cache.
    pub fn get_or_fetch<F>(&self, plate: &str, clock: &dyn Clock, fetch: F) -> Result<(RegistryLookup, bool)>
    where
        F: FnOnce() -> RegistryLookup,
    {
        let mut state = self.lock()?;
        loop {
            if let Some(hit) = state.fresh(plate, clock.now(), self.ttl) {
                return Ok((hit, true));
            }
            if state.in_flight.insert(plate.to_string()) {
                break;
            }
            state = self
                .ready
                .wait(state)
                .map_err(|_| anyhow!("plate cache lock poisoned"))?;
        }
        drop(state);

        let _in_flight = InFlight { cache: self, plate };
        let lookup = fetch();
        self.insert(plate, lookup.clone(), clock.now())?;
        Ok((lookup, false))
    }
}
