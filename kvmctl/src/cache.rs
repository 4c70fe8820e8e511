use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::hypervisor::{DomainInfo, DomainState};
use crate::metrics::MetricsRegistry;

/// Display port knowledge for one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayPort {
    /// Not looked up since the record was cached.
    Unprobed,
    /// Looked up; the VM has no usable VNC display.
    Absent,
    Port(u16),
}

/// Cached view of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub name: String,
    pub state: DomainState,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub display: DisplayPort,
}

impl From<DomainInfo> for VmRecord {
    fn from(info: DomainInfo) -> Self {
        Self {
            name: info.name,
            state: info.state,
            memory_mib: info.memory_mib,
            vcpus: info.vcpus,
            display: DisplayPort::Unprobed,
        }
    }
}

struct CacheEntry {
    record: VmRecord,
    inserted_at: Instant,
}

struct Inventory {
    names: Vec<String>,
    inserted_at: Instant,
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    inventory: Option<Inventory>,
    /// Bumped by every invalidation.
    generation: u64,
}

/// TTL + LRU bounded store of VM records for one endpoint.
///
/// An entry inserted at `t` is served until `t + ttl` (exclusive). Expired
/// entries are dropped lazily on lookup. All operations take one short
/// mutex, so readers see an entry either before or after a concurrent
/// invalidation, never half-written.
///
/// Readers that query the hypervisor take a [`generation`](Self::generation)
/// snapshot first and store results with [`put_observed`](Self::put_observed),
/// which refuses data observed before an intervening invalidation.
pub struct InfoCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_size: NonZeroUsize,
    metrics: Option<MetricsRegistry>,
}

impl InfoCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let max_size = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(max_size),
                inventory: None,
                generation: 0,
            }),
            ttl,
            max_size,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size.get()
    }

    fn is_fresh(&self, inserted_at: Instant, now: Instant) -> bool {
        now.duration_since(inserted_at) < self.ttl
    }

    fn record_lookup(&self, hit: bool) {
        if let Some(m) = &self.metrics {
            m.record_cache_lookup(hit);
        }
    }

    /// Fresh record for `name`, promoting it to most recently used.
    pub fn get(&self, name: &str) -> Option<VmRecord> {
        let now = Instant::now();
        let record = {
            let mut inner = self.inner.lock();
            let fresh = inner
                .entries
                .peek(name)
                .map(|entry| self.is_fresh(entry.inserted_at, now));
            match fresh {
                Some(true) => inner.entries.get(name).map(|e| e.record.clone()),
                Some(false) => {
                    inner.entries.pop(name);
                    debug!(vm = name, "cache entry expired");
                    None
                }
                None => None,
            }
        };
        self.record_lookup(record.is_some());
        record
    }

    /// Insert or refresh the record for `name`, evicting the least recently
    /// used entry when a new key would exceed the bound.
    pub fn put(&self, name: &str, record: VmRecord) {
        let entry = CacheEntry {
            record,
            inserted_at: Instant::now(),
        };
        let evicted = self.inner.lock().entries.push(name.to_string(), entry);
        if let Some((key, _)) = evicted {
            if key != name {
                debug!(vm = %key, "cache entry evicted");
            }
        }
    }

    /// Store a record read from the hypervisor after `observed` was taken
    /// from [`generation`](Self::generation). Dropped if anything was
    /// invalidated in between.
    pub fn put_observed(&self, observed: u64, name: &str, record: VmRecord) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != observed {
            debug!(vm = name, "discarding record observed before invalidation");
            return false;
        }
        let entry = CacheEntry {
            record,
            inserted_at: Instant::now(),
        };
        if let Some((key, _)) = inner.entries.push(name.to_string(), entry) {
            if key != name {
                debug!(vm = %key, "cache entry evicted");
            }
        }
        true
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Update a live entry in place without refreshing its timestamp.
    /// Returns false if there is no fresh entry to amend.
    pub fn amend(&self, name: &str, f: impl FnOnce(&mut VmRecord)) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.peek_mut(name) {
            Some(entry) if self.is_fresh(entry.inserted_at, now) => {
                f(&mut entry.record);
                true
            }
            _ => false,
        }
    }

    /// Remove the entry for `name`. Idempotent.
    pub fn invalidate(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        if inner.entries.pop(name).is_some() {
            debug!(vm = name, "cache entry invalidated");
        }
    }

    /// Fresh list of domain names in hypervisor order.
    pub fn inventory(&self) -> Option<Vec<String>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let fresh = inner
            .inventory
            .as_ref()
            .map(|inv| self.is_fresh(inv.inserted_at, now));
        match fresh {
            Some(true) => inner.inventory.as_ref().map(|inv| inv.names.clone()),
            Some(false) => {
                inner.inventory = None;
                None
            }
            None => None,
        }
    }

    /// Store a domain listing taken after `observed`; same rule as
    /// [`put_observed`](Self::put_observed).
    pub fn set_inventory(&self, observed: u64, names: Vec<String>) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != observed {
            return false;
        }
        inner.inventory = Some(Inventory {
            names,
            inserted_at: Instant::now(),
        });
        true
    }

    /// Append a newly created domain to a live inventory.
    pub fn note_created(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        if let Some(inv) = inner.inventory.as_mut() {
            if !inv.names.iter().any(|n| n == name) {
                inv.names.push(name.to_string());
            }
        }
    }

    pub fn invalidate_inventory(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.inventory = None;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.entries.clear();
        inner.inventory = None;
    }
}
