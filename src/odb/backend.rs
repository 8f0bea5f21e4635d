//! The `ObjectBackend` capability set (spec.md §9 design note): rather
//! than an inheritance hierarchy of database subclasses, every source of
//! objects — a bare loose+pack directory, a cached snapshot of one, an
//! alternate view, or the composition of all three — implements the same
//! three operations.

use crate::error::{OdbError, Result};
use crate::loose::ObjectType;
use crate::oid::ObjectId;
use crate::window::WindowCursor;

/// A fully materialized object plus the type it was stored as.
#[derive(Debug, Clone)]
pub struct LoadedObject {
    pub object_type: ObjectType,
    pub data: Vec<u8>,
}

/// Capability set shared by every kind of object source.
pub trait ObjectBackend: Send + Sync {
    fn has_object(&self, id: &ObjectId) -> bool;

    fn open(&self, id: &ObjectId, cursor: &mut WindowCursor<'_>) -> Result<LoadedObject>;

    /// Enumerate every underlying source (local and alternate) that
    /// contains `id`; used by tooling that needs every copy rather than
    /// the first hit (e.g. repack).
    fn open_all(&self, id: &ObjectId, cursor: &mut WindowCursor<'_>) -> Vec<LoadedObject> {
        match self.open(id, cursor) {
            Ok(obj) => vec![obj],
            Err(_) => Vec::new(),
        }
    }

    /// Open `id` and verify its stored type matches `expected`, the way
    /// `cat-file <type> <id>` validates the caller's assumption about an
    /// object rather than trusting it.
    fn open_expecting(
        &self,
        id: &ObjectId,
        expected: ObjectType,
        cursor: &mut WindowCursor<'_>,
    ) -> Result<LoadedObject> {
        let obj = self.open(id, cursor)?;
        if obj.object_type != expected {
            return Err(OdbError::IncorrectObjectType { id: *id, expected: expected.name() });
        }
        Ok(obj)
    }
}
