//! Process-wide cache of open repositories (spec.md §4.8): a
//! `Key -> Repository` map with reference-count semantics so that two
//! callers opening the same `.git` directory share one `ObjectDirectory`
//! and one `WindowCache` rather than each paying their own mmap/fd setup
//! cost.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parking_lot::Mutex as PLMutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::odb::ObjectDirectory;
use crate::window::WindowCache;

/// Default grace period an entry with a zero use-count survives before
/// [`RepositoryCache::evict_expired`] reclaims it.
pub const DEFAULT_EXPIRE_AFTER: Duration = Duration::from_secs(60 * 60);

/// A repository as the cache hands it out: its object directory plus the
/// window cache it was opened with. Cheap to clone — everything behind
/// an `Arc`.
#[derive(Clone)]
pub struct Repository {
    pub objects: Arc<ObjectDirectory>,
    pub window_cache: Arc<WindowCache>,
}

/// Canonicalised absolute path to a git-directory; equality is purely
/// path-based; two different `dir`/`dir/.git`/`dir.git` spellings that
/// resolve to the same git-directory collapse to one key.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Key(PathBuf);

impl Key {
    /// Resolve `path` the way `FileKey` does: `path` itself if it already
    /// looks like a git-directory (has an `objects` subdirectory), else
    /// `path/.git`, else the bare-sibling form `path.git`.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        for candidate in [path.to_path_buf(), path.join(".git"), bare_sibling(path)] {
            if candidate.join("objects").is_dir() {
                let canonical = candidate.canonicalize()?;
                return Ok(Key(canonical));
            }
        }
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(Key(canonical))
    }
}

fn bare_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".git");
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

struct Slot {
    repository: Repository,
    use_count: usize,
    last_closed: Option<Instant>,
}

/// A single entry's open-or-create race is resolved by the outer mutex,
/// matching spec.md §5's "single monitor per key" guidance — the map
/// itself is the monitor since open/close/evict all take it briefly and
/// never hold it across I/O beyond repository construction.
pub struct RepositoryCache {
    slots: Mutex<HashMap<Key, Slot>>,
    expire_after: Duration,
}

impl Default for RepositoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRE_AFTER)
    }
}

impl RepositoryCache {
    pub fn new(expire_after: Duration) -> Self {
        Self { slots: Mutex::new(HashMap::new()), expire_after }
    }

    /// Open `key`, constructing the repository on first use and
    /// incrementing its use count on every call thereafter.
    pub fn open(&self, key: Key) -> Result<Repository> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(&key) {
            slot.use_count += 1;
            slot.last_closed = None;
            debug!(path = %key.0.display(), use_count = slot.use_count, "repository cache hit");
            return Ok(slot.repository.clone());
        }

        let config = Config::load(key.0.join("config")).unwrap_or_default();
        let window_cache = Arc::new(WindowCache::new(config.clone()));
        let objects = ObjectDirectory::open(key.0.join("objects"), config, window_cache.clone())?;
        let repository = Repository { objects, window_cache };

        info!(path = %key.0.display(), "repository opened");
        slots.insert(key, Slot { repository: repository.clone(), use_count: 1, last_closed: None });
        Ok(repository)
    }

    /// Decrement `key`'s use count; once it reaches zero the slot becomes
    /// eligible for [`RepositoryCache::evict_expired`] after
    /// `expire_after` elapses.
    pub fn close(&self, key: &Key) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(key) {
            slot.use_count = slot.use_count.saturating_sub(1);
            if slot.use_count == 0 {
                slot.last_closed = Some(Instant::now());
            }
        }
    }

    /// Drop every slot whose use count is zero and whose `last_closed`
    /// time is older than `expire_after`. Intended to be driven by a
    /// periodic background task; this crate does not spawn one itself.
    pub fn evict_expired(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|key, slot| {
            let expired = slot.use_count == 0
                && slot.last_closed.is_some_and(|t| t.elapsed() >= self.expire_after);
            if expired {
                debug!(path = %key.0.display(), "evicting expired repository");
            }
            !expired
        });
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide singleton, swapped wholesale rather than mutated in
/// place when reconfigured (spec.md §9 design note on copy-on-write
/// singletons) — callers holding an `Arc` from before a reconfiguration
/// keep working against the old cache until they drop it.
static GLOBAL: PLMutex<Option<Arc<RepositoryCache>>> = PLMutex::new(None);

/// The current global repository cache, creating a default-configured
/// one on first access.
pub fn global() -> Arc<RepositoryCache> {
    let mut guard = GLOBAL.lock();
    guard.get_or_insert_with(|| Arc::new(RepositoryCache::default())).clone()
}

/// Atomically replace the global cache. Existing holders of the
/// previous `Arc` keep it alive until they finish with it.
pub fn set_global(cache: Arc<RepositoryCache>) {
    *GLOBAL.lock() = Some(cache);
}
