//! Segmented open-addressed map keyed by [`ObjectId`].
//!
//! During pack and revision walks hundreds of millions of id lookups can
//! occur; per-entry overhead dominates at that scale. Rather than rehash
//! into one large contiguous array on growth (which would copy every
//! stored value), entries live in a directory of fixed-size segments.
//! Growing the table doubles the segment count and relinks the existing
//! boxed entries into their new buckets — only pointers move, never the
//! values themselves.

use crate::oid::ObjectId;

/// Types stored in an [`ObjectIdMap`] must expose the id they are keyed
/// by, the same way every packed/loose object entry naturally carries
/// its own hash.
pub trait ObjectIdKeyed {
    fn object_id(&self) -> &ObjectId;
}

/// log2 of the number of slots in one segment.
const SEGMENT_BITS: u32 = 11;
/// 2048 entries per segment.
const SEGMENT_SIZE: usize = 1 << SEGMENT_BITS;
/// Grow once the table is more than 3/4 full.
const LOAD_FACTOR_NUM: usize = 3;
const LOAD_FACTOR_DEN: usize = 4;

struct Entry<V> {
    value: V,
    next: Option<Box<Entry<V>>>,
}

/// Open-addressed, segmented hash map from [`ObjectId`] to `V`.
pub struct ObjectIdMap<V: ObjectIdKeyed> {
    directory: Vec<Box<[Option<Box<Entry<V>>>]>>,
    mask: usize,
    len: usize,
}

impl<V: ObjectIdKeyed> Default for ObjectIdMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: ObjectIdKeyed> ObjectIdMap<V> {
    pub fn new() -> Self {
        Self { directory: vec![Self::empty_segment()], mask: SEGMENT_SIZE - 1, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn empty_segment() -> Box<[Option<Box<Entry<V>>>]> {
        let mut v = Vec::with_capacity(SEGMENT_SIZE);
        v.resize_with(SEGMENT_SIZE, || None);
        v.into_boxed_slice()
    }

    fn addr(&self, id: &ObjectId) -> usize {
        id.hash_word() as usize & self.mask
    }

    fn locate(addr: usize) -> (usize, usize) {
        (addr >> SEGMENT_BITS, addr & (SEGMENT_SIZE - 1))
    }

    pub fn get(&self, id: &ObjectId) -> Option<&V> {
        let (seg, off) = Self::locate(self.addr(id));
        let mut cur = self.directory[seg][off].as_deref();
        while let Some(entry) = cur {
            if entry.value.object_id() == id {
                return Some(&entry.value);
            }
            cur = entry.next.as_deref();
        }
        None
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Insert `v`, chaining onto any existing bucket. Does not check for
    /// an existing entry with the same id; callers that care use
    /// [`ObjectIdMap::add_if_absent`].
    pub fn insert(&mut self, v: V) {
        self.grow_if_needed();
        let id = *v.object_id();
        let (seg, off) = Self::locate(self.addr(&id));
        let slot = &mut self.directory[seg][off];
        let next = slot.take();
        *slot = Some(Box::new(Entry { value: v, next }));
        self.len += 1;
    }

    /// Insert `v` unless an entry with the same id already exists, in
    /// which case the existing entry is returned untouched.
    pub fn add_if_absent(&mut self, v: V) -> &V {
        let id = *v.object_id();
        if self.contains(&id) {
            return self.get(&id).unwrap();
        }
        self.insert(v);
        self.get(&id).unwrap()
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.directory.iter().flat_map(|segment| {
            segment.iter().flat_map(|slot| {
                std::iter::successors(slot.as_deref(), |e| e.next.as_deref()).map(|e| &e.value)
            })
        })
    }

    fn grow_if_needed(&mut self) {
        let capacity = self.mask + 1;
        if self.len + 1 <= capacity * LOAD_FACTOR_NUM / LOAD_FACTOR_DEN {
            return;
        }

        let new_mask = (capacity * 2) - 1;
        let new_segments = (capacity * 2) / SEGMENT_SIZE;
        let mut new_directory: Vec<Box<[Option<Box<Entry<V>>>]>> =
            (0..new_segments).map(|_| Self::empty_segment()).collect();

        for segment in std::mem::take(&mut self.directory) {
            for slot in Vec::from(segment) {
                let mut cur = slot;
                while let Some(mut entry) = cur {
                    cur = entry.next.take();
                    let new_addr = entry.value.object_id().hash_word() as usize & new_mask;
                    let (seg, off) = Self::locate(new_addr);
                    let dest = &mut new_directory[seg][off];
                    entry.next = dest.take();
                    *dest = Some(entry);
                }
            }
        }

        self.directory = new_directory;
        self.mask = new_mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    struct Entry {
        id: ObjectId,
        value: u64,
    }

    impl ObjectIdKeyed for Entry {
        fn object_id(&self) -> &ObjectId {
            &self.id
        }
    }

    fn id_for(n: u64) -> ObjectId {
        let mut hasher = Sha1::new();
        hasher.update(n.to_le_bytes());
        ObjectId::from_sha1(hasher.finalize())
    }

    #[test]
    fn insert_then_get_returns_exact_entry() {
        let mut map = ObjectIdMap::new();
        let id = id_for(42);
        map.insert(Entry { id, value: 42 });
        assert_eq!(map.get(&id).unwrap().value, 42);
    }

    #[test]
    fn add_if_absent_never_replaces() {
        let mut map = ObjectIdMap::new();
        let id = id_for(1);
        map.add_if_absent(Entry { id, value: 1 });
        map.add_if_absent(Entry { id, value: 999 });
        assert_eq!(map.get(&id).unwrap().value, 1);
    }

    #[test]
    fn grows_past_one_segment_without_losing_entries() {
        let mut map = ObjectIdMap::new();
        const N: u64 = 10_000;
        for i in 0..N {
            map.insert(Entry { id: id_for(i), value: i });
        }

        assert_eq!(map.len(), N as usize);
        for i in 0..N {
            assert_eq!(map.get(&id_for(i)).unwrap().value, i);
        }
        assert!(map.get(&id_for(N + 1)).is_none());

        let mut seen: Vec<u64> = map.iter().map(|e| e.value).collect();
        seen.sort_unstable();
        let expected: Vec<u64> = (0..N).collect();
        assert_eq!(seen, expected);
    }
}
