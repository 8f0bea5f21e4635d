//! Composition of loose objects, packs, and alternates into a single
//! lookup surface (spec.md §4.7).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{OdbError, Result};
use crate::loose::{LooseObjectLoader, ObjectType};
use crate::odb::backend::{LoadedObject, ObjectBackend};
use crate::oid::{AbbreviatedObjectId, ObjectId};
use crate::pack::delta::ExternalBaseResolver;
use crate::pack::{PackFile, PackIndex};
use crate::window::{WindowCache, WindowCursor};

/// An immutable snapshot of the packs found under `objects/pack/` the
/// last time it was scanned, plus the directory mtime that snapshot was
/// taken against (spec.md §4.7, `PackList`).
struct PackList {
    scanned_at: SystemTime,
    packs: Vec<Arc<PackFile>>,
}

/// Composes a primary loose+pack object store with zero or more
/// alternates, read from `objects/info/alternates`.
pub struct ObjectDirectory {
    objects_dir: PathBuf,
    loose: LooseObjectLoader,
    config: Config,
    cache: Arc<WindowCache>,
    packs: RwLock<PackList>,
    alternates: RwLock<Option<Arc<Vec<Arc<ObjectDirectory>>>>>,
}

impl ObjectDirectory {
    pub fn open(objects_dir: impl Into<PathBuf>, config: Config, cache: Arc<WindowCache>) -> Result<Arc<Self>> {
        let objects_dir = objects_dir.into();
        let loose = LooseObjectLoader::new(&objects_dir, config.compression_level);
        let packs = scan_packs(&objects_dir, &config, &cache)?;

        Ok(Arc::new(Self {
            objects_dir,
            loose,
            config,
            cache,
            packs: RwLock::new(packs),
            alternates: RwLock::new(None),
        }))
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub fn loose(&self) -> &LooseObjectLoader {
        &self.loose
    }

    fn identity_path(&self) -> PathBuf {
        self.objects_dir.canonicalize().unwrap_or_else(|_| self.objects_dir.clone())
    }

    /// Lazily loaded, immutable snapshot of this directory's alternates.
    pub fn alternates(&self) -> Arc<Vec<Arc<ObjectDirectory>>> {
        if let Some(existing) = self.alternates.read().unwrap().clone() {
            return existing;
        }
        let loaded = Arc::new(self.load_alternates());
        *self.alternates.write().unwrap() = Some(loaded.clone());
        loaded
    }

    fn load_alternates(&self) -> Vec<Arc<ObjectDirectory>> {
        let path = self.objects_dir.join("info").join("alternates");
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut out = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let alt_path = if Path::new(line).is_absolute() {
                PathBuf::from(line)
            } else {
                self.objects_dir.join(line)
            };
            match ObjectDirectory::open(alt_path.clone(), self.config.clone(), self.cache.clone()) {
                Ok(dir) => out.push(dir),
                Err(err) => warn!(path = %alt_path.display(), %err, "failed to open alternate"),
            }
        }
        out
    }

    /// Rescan `objects/pack/` once if the directory's mtime has changed
    /// since the cached snapshot was taken (the `tryAgain` indirection of
    /// spec.md §4.7, bounded to one retry per lookup per the open
    /// question in spec.md §9).
    fn refresh_pack_list(&self) -> Result<()> {
        let pack_dir = self.objects_dir.join("pack");
        let current_mtime = fs::metadata(&pack_dir).and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
        let stale = { self.packs.read().unwrap().scanned_at < current_mtime };
        if stale {
            let fresh = scan_packs(&self.objects_dir, &self.config, &self.cache)?;
            *self.packs.write().unwrap() = fresh;
        }
        Ok(())
    }

    fn pack_snapshot(&self) -> Vec<Arc<PackFile>> {
        self.packs.read().unwrap().packs.clone()
    }

    fn has_object_visited(&self, id: &ObjectId, visited: &mut HashSet<PathBuf>) -> bool {
        if !visited.insert(self.identity_path()) {
            return false;
        }
        if self.loose.has(id) {
            return true;
        }
        if self.pack_snapshot().iter().any(|pack| pack.has_object(id)) {
            return true;
        }
        self.alternates().iter().any(|alt| alt.has_object_visited(id, visited))
    }

    fn open_visited(
        &self,
        id: &ObjectId,
        cursor: &mut WindowCursor<'_>,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<LoadedObject> {
        if !visited.insert(self.identity_path()) {
            return Err(OdbError::MissingObject(*id));
        }

        if self.loose.has(id) {
            let obj = self.loose.read(id)?;
            return Ok(LoadedObject { object_type: obj.object_type, data: obj.data });
        }

        let mut tried_rescan = false;
        loop {
            for pack in self.pack_snapshot() {
                match pack.open_object(id, cursor, Some(self as &dyn ExternalBaseResolver)) {
                    Ok(obj) => return Ok(LoadedObject { object_type: obj.object_type, data: obj.data }),
                    Err(OdbError::MissingObject(_)) => continue,
                    Err(OdbError::PackInvalid(path)) => {
                        debug!(path = %path.display(), "skipping sticky-invalid pack");
                        continue;
                    }
                    Err(OdbError::CorruptObject(reason)) => {
                        warn!(%reason, "pack entry corrupt, trying remaining sources");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            if tried_rescan {
                break;
            }
            tried_rescan = true;
            self.refresh_pack_list()?;
        }

        for alt in self.alternates().iter() {
            if let Ok(obj) = alt.open_visited(id, cursor, visited) {
                return Ok(obj);
            }
        }

        Err(OdbError::MissingObject(*id))
    }

    /// Every pack (local and alternate) that contains `id`, for tooling
    /// that needs every copy rather than the first hit.
    pub fn open_all_packs(&self, id: &ObjectId, cursor: &mut WindowCursor<'_>) -> Vec<LoadedObject> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        self.collect_all_packs(id, cursor, &mut visited, &mut out);
        out
    }

    fn collect_all_packs(
        &self,
        id: &ObjectId,
        cursor: &mut WindowCursor<'_>,
        visited: &mut HashSet<PathBuf>,
        out: &mut Vec<LoadedObject>,
    ) {
        if !visited.insert(self.identity_path()) {
            return;
        }
        for pack in self.pack_snapshot() {
            if let Ok(obj) = pack.open_object(id, cursor, Some(self as &dyn ExternalBaseResolver)) {
                out.push(LoadedObject { object_type: obj.object_type, data: obj.data });
            }
        }
        for alt in self.alternates().iter() {
            alt.collect_all_packs(id, cursor, visited, out);
        }
    }

    /// Every loose copy of `id` (local and alternate), for
    /// [`ObjectBackend::open_all`]. Separate from [`Self::collect_all_packs`]
    /// since `openAllPacks` is spec'd as a pack-only enumeration.
    fn collect_all_loose(&self, id: &ObjectId, visited: &mut HashSet<PathBuf>, out: &mut Vec<LoadedObject>) {
        if !visited.insert(self.identity_path()) {
            return;
        }
        if self.loose.has(id) {
            if let Ok(obj) = self.loose.read(id) {
                out.push(LoadedObject { object_type: obj.object_type, data: obj.data });
            }
        }
        for alt in self.alternates().iter() {
            alt.collect_all_loose(id, visited, out);
        }
    }

    /// Resolve an abbreviated id against loose objects and packs, local
    /// and alternate. Fails with `Ambiguous` if more than one full id
    /// matches, `MissingObject` if none does.
    pub fn resolve_abbreviated(&self, abbrev: &AbbreviatedObjectId) -> Result<ObjectId> {
        let mut visited = HashSet::new();
        let mut matches = Vec::new();
        self.collect_abbreviated_visited(abbrev, &mut visited, &mut matches);
        matches.sort();
        matches.dedup();

        match matches.len() {
            0 => Err(OdbError::MissingObject(abbrev.zero_padded())),
            1 => Ok(matches[0]),
            _ => Err(OdbError::Ambiguous(abbrev.to_string())),
        }
    }

    fn collect_abbreviated_visited(
        &self,
        abbrev: &AbbreviatedObjectId,
        visited: &mut HashSet<PathBuf>,
        out: &mut Vec<ObjectId>,
    ) {
        if !visited.insert(self.identity_path()) {
            return;
        }
        out.extend(scan_loose_prefix(&self.objects_dir, abbrev));
        for pack in self.pack_snapshot() {
            out.extend(pack.index().find_by_prefix(abbrev));
        }
        for alt in self.alternates().iter() {
            alt.collect_abbreviated_visited(abbrev, visited, out);
        }
    }
}

/// Loose ids under `objects_dir` matching `abbrev`, read directly from
/// the one fan-out subdirectory the abbreviation's first byte names
/// rather than walking the whole loose tree.
fn scan_loose_prefix(objects_dir: &Path, abbrev: &AbbreviatedObjectId) -> Vec<ObjectId> {
    let fan_out_dir = objects_dir.join(format!("{:02x}", abbrev.first_byte()));
    let entries = match fs::read_dir(&fan_out_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let Some(rest) = entry.path().file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };
        if let Ok(id) = ObjectId::from_hex(&format!("{:02x}{rest}", abbrev.first_byte())) {
            if abbrev.matches(&id) {
                out.push(id);
            }
        }
    }
    out
}

impl ObjectBackend for ObjectDirectory {
    fn has_object(&self, id: &ObjectId) -> bool {
        let mut visited = HashSet::new();
        self.has_object_visited(id, &mut visited)
    }

    fn open(&self, id: &ObjectId, cursor: &mut WindowCursor<'_>) -> Result<LoadedObject> {
        let mut visited = HashSet::new();
        self.open_visited(id, cursor, &mut visited)
    }

    /// Every copy of `id` across loose storage and packs, local and
    /// alternate, rather than the default trait behaviour of stopping at
    /// the first hit.
    fn open_all(&self, id: &ObjectId, cursor: &mut WindowCursor<'_>) -> Vec<LoadedObject> {
        let mut out = Vec::new();
        let mut loose_visited = HashSet::new();
        self.collect_all_loose(id, &mut loose_visited, &mut out);
        out.extend(self.open_all_packs(id, cursor));
        out
    }
}

/// Used by [`PackFile`] to resolve a REF_DELTA base that's absent from
/// its own pack (a thin pack) by falling back to the composed database.
/// Runs its own scratch cursor so it doesn't need to re-borrow the
/// caller's, and swallows lookup failures to `None` per the "missing
/// from one source is not fatal" propagation rule (spec.md §7).
impl ExternalBaseResolver for ObjectDirectory {
    fn resolve(&self, id: &ObjectId) -> Option<(ObjectType, Vec<u8>)> {
        let mut cursor = WindowCursor::new(&self.cache);
        self.open(id, &mut cursor).ok().map(|obj| (obj.object_type, obj.data))
    }
}

fn scan_packs(objects_dir: &Path, config: &Config, cache: &Arc<WindowCache>) -> Result<PackList> {
    let pack_dir = objects_dir.join("pack");
    let scanned_at = fs::metadata(&pack_dir).and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);

    let mut packs = Vec::new();
    let entries = match fs::read_dir(&pack_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(PackList { scanned_at, packs }),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("idx") {
            continue;
        }
        let pack_path = path.with_extension("pack");
        if !pack_path.is_file() {
            continue;
        }
        match PackIndex::open(&path).and_then(|index| {
            PackFile::open(&pack_path, Arc::new(index), config.delta_base_cache_limit)
        }) {
            Ok(pack) => packs.push(Arc::new(pack)),
            Err(err) => warn!(path = %pack_path.display(), %err, "skipping unreadable pack"),
        }
    }
    let _ = cache;

    Ok(PackList { scanned_at, packs })
}
