//! Pack file reading: index lookup, object header framing, and delta
//! reconstruction.

pub mod delta;
pub mod file;
pub mod index;

pub use delta::{ExternalBaseResolver};
pub use file::PackFile;
pub use index::{IndexVersion, PackIndex};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Identity of an open pack file, used as the first half of window-cache
/// and delta-base-cache keys. Derived from the canonicalized path rather
/// than inode numbers, which aren't portably available through `std`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackIdentity(u64);

impl PackIdentity {
    pub fn from_path(path: &Path) -> Self {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Self::from_path_bytes(canonical.to_string_lossy().as_bytes())
    }

    pub fn from_path_bytes(bytes: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A decoded pack object header: type/delta-base information plus the
/// offset where the object's zlib stream begins.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectHeader {
    pub kind: ObjectHeaderKind,
    pub inflated_size: u64,
    /// Offset within the pack where the zlib stream (or, for deltas, the
    /// base reference) begins.
    pub data_offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ObjectHeaderKind {
    Whole(crate::loose::ObjectType),
    OfsDelta,
    RefDelta,
}

/// Parse the variable-length type+size header at the start of `buf`
/// (which must hold at least the header and, for OFS_DELTA, the
/// following backward-offset varint). `object_offset` is this object's
/// absolute offset in the pack, needed to resolve OFS_DELTA's relative
/// base and to compute `data_offset`.
pub(crate) fn parse_object_header(
    buf: &[u8],
    object_offset: u64,
) -> crate::error::Result<(ObjectHeader, Option<u64>, Option<crate::oid::ObjectId>)> {
    use crate::error::OdbError;

    let first = *buf.first().ok_or_else(|| OdbError::CorruptObject("truncated object header".into()))?;
    let type_code = (first >> 4) & 0x7;
    let mut size = (first & 0x0f) as u64;
    let mut shift = 4u32;
    let mut pos = 1usize;
    let mut cont = first & 0x80 != 0;
    while cont {
        let byte = *buf
            .get(pos)
            .ok_or_else(|| OdbError::CorruptObject("truncated object header".into()))?;
        pos += 1;
        size |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        cont = byte & 0x80 != 0;
    }

    match type_code {
        1..=4 => {
            let object_type = match type_code {
                1 => crate::loose::ObjectType::Commit,
                2 => crate::loose::ObjectType::Tree,
                3 => crate::loose::ObjectType::Blob,
                4 => crate::loose::ObjectType::Tag,
                _ => unreachable!(),
            };
            Ok((
                ObjectHeader {
                    kind: ObjectHeaderKind::Whole(object_type),
                    inflated_size: size,
                    data_offset: object_offset + pos as u64,
                },
                None,
                None,
            ))
        }
        6 => {
            let (rel_offset, consumed) = delta::read_ofs_delta_offset(buf, pos)?;
            pos += consumed;
            let base_offset = object_offset
                .checked_sub(rel_offset)
                .filter(|&base| base < object_offset)
                .ok_or_else(|| OdbError::CorruptObject("OFS_DELTA base offset out of range".into()))?;
            Ok((
                ObjectHeader {
                    kind: ObjectHeaderKind::OfsDelta,
                    inflated_size: size,
                    data_offset: object_offset + pos as u64,
                },
                Some(base_offset),
                None,
            ))
        }
        7 => {
            if buf.len() < pos + 20 {
                return Err(OdbError::CorruptObject("truncated REF_DELTA base id".into()));
            }
            let base_id = crate::oid::ObjectId::from_raw(buf, pos);
            pos += 20;
            Ok((
                ObjectHeader {
                    kind: ObjectHeaderKind::RefDelta,
                    inflated_size: size,
                    data_offset: object_offset + pos as u64,
                },
                None,
                Some(base_id),
            ))
        }
        other => Err(OdbError::CorruptObject(format!("invalid pack object type code {other}"))),
    }
}
