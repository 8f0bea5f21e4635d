//! A snapshot view over an [`ObjectDirectory`] that assumes loose objects
//! are written once and never removed mid-lifetime (spec.md §4.7): it
//! walks `objects/<xx>/` once at construction and serves loose lookups
//! from that in-memory set from then on, never re-reading the directory.
//! Packs are still consulted live, since `ObjectDirectory` itself already
//! rescans those on a miss.

use std::fs;
use std::sync::Arc;

use crate::error::Result;
use crate::odb::backend::{LoadedObject, ObjectBackend};
use crate::odb::directory::ObjectDirectory;
use crate::oid::ObjectId;
use crate::oid_map::{ObjectIdKeyed, ObjectIdMap};
use crate::window::WindowCursor;

struct LooseEntry(ObjectId);

impl ObjectIdKeyed for LooseEntry {
    fn object_id(&self) -> &ObjectId {
        &self.0
    }
}

/// Read-only snapshot of which ids are loose, taken once at construction.
pub struct CachedObjectDirectory {
    inner: Arc<ObjectDirectory>,
    loose_ids: ObjectIdMap<LooseEntry>,
}

impl CachedObjectDirectory {
    pub fn snapshot(inner: Arc<ObjectDirectory>) -> Self {
        let mut loose_ids = ObjectIdMap::new();
        for id in scan_loose_ids(&inner) {
            loose_ids.add_if_absent(LooseEntry(id));
        }
        Self { inner, loose_ids }
    }

    pub fn inner(&self) -> &Arc<ObjectDirectory> {
        &self.inner
    }
}

fn scan_loose_ids(dir: &ObjectDirectory) -> Vec<ObjectId> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir.objects_dir()) {
        Ok(entries) => entries,
        Err(_) => return out,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(fan_out_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if fan_out_name.len() != 2 || !fan_out_name.bytes().all(|b| b.is_ascii_hexdigit()) {
            continue;
        }
        let Ok(sub_entries) = fs::read_dir(&path) else { continue };
        for sub in sub_entries.flatten() {
            let Some(rest) = sub.path().file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };
            if let Ok(id) = ObjectId::from_hex(&format!("{fan_out_name}{rest}")) {
                out.push(id);
            }
        }
    }
    out
}

impl ObjectBackend for CachedObjectDirectory {
    fn has_object(&self, id: &ObjectId) -> bool {
        self.loose_ids.contains(id) || self.inner.has_object(id)
    }

    fn open(&self, id: &ObjectId, cursor: &mut WindowCursor<'_>) -> Result<LoadedObject> {
        if self.loose_ids.contains(id) {
            let obj = self.inner.loose().read(id)?;
            return Ok(LoadedObject { object_type: obj.object_type, data: obj.data });
        }
        self.inner.open(id, cursor)
    }
}
