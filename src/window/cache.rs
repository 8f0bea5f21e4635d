//! Bounded cache of fixed-size byte windows over open pack files.
//!
//! Entries are partitioned into `lockCount` stripes (spec.md §4.4); a
//! reader only ever contends with another reader whose `(pack, offset)`
//! hashes to the same stripe, and even then only while that stripe's
//! window is actually being loaded from disk. Eviction first drains the
//! stripe that just grew, then sweeps the remaining stripes one lock at a
//! time until the aggregate counters are back under budget or every
//! stripe is empty; a lookup only ever holds one stripe lock at a time,
//! so this sweep cannot deadlock against a concurrent `get`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::pack::PackIdentity;
use crate::window::PackSource;

/// Backing storage for one window: either a slice of a whole-file mmap
/// or an owned heap buffer read via `pread`-equivalent positioned reads,
/// chosen by `core.packedGitMMAP` (spec.md §4.4).
enum WindowBytes {
    Mmap { map: Arc<memmap2::Mmap>, start: usize, len: usize },
    Heap(Vec<u8>),
}

impl WindowBytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            WindowBytes::Mmap { map, start, len } => &map[*start..*start + *len],
            WindowBytes::Heap(buf) => buf,
        }
    }
}

/// An immutable, aligned slice of a pack file held in the cache.
pub struct ByteWindow {
    pack: PackIdentity,
    start: u64,
    bytes: WindowBytes,
}

impl ByteWindow {
    pub fn pack(&self) -> PackIdentity {
        self.pack
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn len(&self) -> usize {
        self.bytes.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State the cache keeps per distinct pack: its open file handle (and
/// whole-file mmap, if enabled) plus how many cached windows currently
/// reference it. The handle is dropped, closing the FD, when the count
/// returns to zero.
struct OpenPack {
    file: Option<File>,
    mmap: Option<Arc<memmap2::Mmap>>,
    window_count: usize,
}

struct CacheEntry {
    pack: PackIdentity,
    start: u64,
    window: Arc<ByteWindow>,
}

/// One lock partition. Entries are ordered oldest-to-newest; a hit
/// removes and re-appends its entry so the front is always the next
/// eviction candidate.
#[derive(Default)]
struct Stripe {
    entries: Vec<CacheEntry>,
}

pub struct WindowCache {
    config: Config,
    stripes: Vec<Mutex<Stripe>>,
    packs: Mutex<HashMap<PackIdentity, OpenPack>>,
    open_bytes: AtomicU64,
    open_files: AtomicUsize,
}

impl WindowCache {
    pub fn new(config: Config) -> Self {
        let lock_count = config.packed_git_open_files.max(32);
        let stripes = (0..lock_count).map(|_| Mutex::new(Stripe::default())).collect();
        Self {
            config,
            stripes,
            packs: Mutex::new(HashMap::new()),
            open_bytes: AtomicU64::new(0),
            open_files: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn open_bytes(&self) -> u64 {
        self.open_bytes.load(Ordering::SeqCst)
    }

    pub fn open_files(&self) -> usize {
        self.open_files.load(Ordering::SeqCst)
    }

    fn stripe_index(&self, pack: PackIdentity, start: u64) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        pack.hash(&mut hasher);
        start.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    /// Fetch the window containing `offset`, loading it on a miss. The
    /// stripe lock is held across the load itself, so two concurrent
    /// misses for the same `(pack, offset)` serialise into one I/O and
    /// one insert (spec.md §5).
    pub fn get(&self, pack: &dyn PackSource, offset: u64) -> Result<Arc<ByteWindow>> {
        let window_size = self.config.packed_git_window_size as u64;
        let start = offset & !(window_size - 1);
        let identity = pack.identity();
        let idx = self.stripe_index(identity, start);
        let mut stripe = self.stripes[idx].lock();

        if let Some(pos) = stripe.entries.iter().position(|e| e.pack == identity && e.start == start) {
            let entry = stripe.entries.remove(pos);
            let window = entry.window.clone();
            stripe.entries.push(CacheEntry { pack: identity, start, window: window.clone() });
            return Ok(window);
        }

        let window = self.load_window(pack, identity, start, window_size)?;
        self.open_bytes.fetch_add(window.len() as u64, Ordering::SeqCst);
        stripe.entries.push(CacheEntry { pack: identity, start, window: window.clone() });
        debug!(pack = identity.value(), start, len = window.len(), "window loaded");

        self.evict_if_needed(idx, &mut stripe);

        Ok(window)
    }

    fn load_window(
        &self,
        pack: &dyn PackSource,
        identity: PackIdentity,
        start: u64,
        window_size: u64,
    ) -> Result<Arc<ByteWindow>> {
        let len = ((pack.len() - start).min(window_size)) as usize;

        let mut packs = self.packs.lock();
        let entry = packs.entry(identity).or_insert_with(|| OpenPack { file: None, mmap: None, window_count: 0 });

        if entry.window_count == 0 {
            let file = File::open(pack.path())?;
            if self.config.packed_git_mmap {
                // SAFETY: the pack file is not expected to be truncated or
                // rewritten while mapped; packs are append-only and replaced
                // atomically by rename, never mutated in place.
                let map = unsafe { memmap2::Mmap::map(&file)? };
                entry.mmap = Some(Arc::new(map));
            }
            entry.file = Some(file);
            self.open_files.fetch_add(1, Ordering::SeqCst);
        }
        entry.window_count += 1;

        let bytes = if let Some(map) = &entry.mmap {
            WindowBytes::Mmap { map: map.clone(), start: start as usize, len }
        } else {
            let file = entry.file.as_mut().expect("file open when mmap disabled");
            let mut buf = vec![0u8; len];
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut buf)?;
            WindowBytes::Heap(buf)
        };

        Ok(Arc::new(ByteWindow { pack: identity, start, bytes }))
    }

    fn over_budget(&self) -> bool {
        self.open_bytes.load(Ordering::SeqCst) > self.config.packed_git_limit
            || self.open_files.load(Ordering::SeqCst) > self.config.packed_git_open_files
    }

    /// Evicts until the aggregate counters are under budget. Drains
    /// `stripe` (the one the caller already holds locked) first; if that
    /// empties out while still over budget, sweeps the other stripes one
    /// lock at a time, since load can be skewed enough that a single
    /// stripe never accumulates the bulk of resident bytes or fds.
    fn evict_if_needed(&self, current_idx: usize, stripe: &mut Stripe) {
        while self.over_budget() {
            if self.evict_front(stripe) {
                continue;
            }
            if !self.evict_from_other_stripes(current_idx) {
                break;
            }
        }
    }

    fn evict_front(&self, stripe: &mut Stripe) -> bool {
        if stripe.entries.is_empty() {
            return false;
        }
        let evicted = stripe.entries.remove(0);
        self.release_entry(evicted);
        true
    }

    fn evict_from_other_stripes(&self, current_idx: usize) -> bool {
        for i in 0..self.stripes.len() {
            if i == current_idx {
                continue;
            }
            let mut other = self.stripes[i].lock();
            if !other.entries.is_empty() {
                let evicted = other.entries.remove(0);
                drop(other);
                self.release_entry(evicted);
                return true;
            }
        }
        false
    }

    fn release_entry(&self, evicted: CacheEntry) {
        self.open_bytes.fetch_sub(evicted.window.len() as u64, Ordering::SeqCst);

        let mut packs = self.packs.lock();
        if let Some(entry) = packs.get_mut(&evicted.pack) {
            entry.window_count -= 1;
            if entry.window_count == 0 {
                entry.file = None;
                entry.mmap = None;
                self.open_files.fetch_sub(1, Ordering::SeqCst);
                warn!(pack = evicted.pack.value(), "closed pack fd after last window evicted");
            }
        }
    }
}
