//! Parsing and lookup for `.idx` pack index files, versions 1 and 2.
//!
//! Loaded once and held for the lifetime of the owning [`super::file::PackFile`].
//! Layout is documented in full in the crate-level pack format notes; in
//! short: a 256-entry fan-out table narrows a binary search over a
//! sorted id array to the objects sharing a first byte.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{OdbError, Result};
use crate::oid::{AbbreviatedObjectId, ObjectId};

pub const V2_MAGIC: [u8; 4] = [0xff, 0x74, 0x4f, 0x63];
const FAN_OUT_ENTRIES: usize = 256;
const FAN_OUT_BYTES: usize = FAN_OUT_ENTRIES * 4;
const ID_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexVersion {
    V1,
    V2,
}

/// An immutable, fully parsed pack index.
pub struct PackIndex {
    version: IndexVersion,
    fan_out: [u32; FAN_OUT_ENTRIES],
    ids: Vec<ObjectId>,
    offsets: Vec<u64>,
    crc32: Option<Vec<u32>>,
    pack_checksum: [u8; ID_LEN],
    idx_checksum: [u8; ID_LEN],
    path: PathBuf,
    /// Index positions sorted by pack offset, built lazily for
    /// `find_object` (offset -> id) lookups.
    reverse: OnceLock<Vec<u32>>,
}

impl PackIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        Self::parse(data, path)
    }

    fn parse(data: Vec<u8>, path: PathBuf) -> Result<Self> {
        if data.len() >= 4 && data[0..4] == V2_MAGIC {
            Self::parse_v2(&data, path)
        } else {
            Self::parse_v1(&data, path)
        }
    }

    fn parse_v1(data: &[u8], path: PathBuf) -> Result<Self> {
        if data.len() < FAN_OUT_BYTES + 2 * ID_LEN {
            return Err(OdbError::CorruptObject("pack index v1 truncated".into()));
        }

        let fan_out = read_fan_out(data, 0)?;
        let n = fan_out[255] as usize;
        let records_start = FAN_OUT_BYTES;
        let record_len = 4 + ID_LEN;
        let records_end = records_start + n * record_len;
        let trailer_start = records_end;

        if data.len() < trailer_start + 2 * ID_LEN {
            return Err(OdbError::CorruptObject("pack index v1 truncated records".into()));
        }

        let mut ids = Vec::with_capacity(n);
        let mut offsets = Vec::with_capacity(n);
        for i in 0..n {
            let rec = &data[records_start + i * record_len..][..record_len];
            let offset = u32::from_be_bytes([rec[0], rec[1], rec[2], rec[3]]) as u64;
            let id = ObjectId::from_raw(rec, 4);
            offsets.push(offset);
            ids.push(id);
        }
        verify_ascending(&ids)?;

        let mut pack_checksum = [0u8; ID_LEN];
        pack_checksum.copy_from_slice(&data[trailer_start..trailer_start + ID_LEN]);
        let mut idx_checksum = [0u8; ID_LEN];
        idx_checksum.copy_from_slice(&data[trailer_start + ID_LEN..trailer_start + 2 * ID_LEN]);

        Ok(Self {
            version: IndexVersion::V1,
            fan_out,
            ids,
            offsets,
            crc32: None,
            pack_checksum,
            idx_checksum,
            path,
            reverse: OnceLock::new(),
        })
    }

    fn parse_v2(data: &[u8], path: PathBuf) -> Result<Self> {
        if data.len() < 8 {
            return Err(OdbError::CorruptObject("pack index v2 truncated header".into()));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != 2 {
            return Err(OdbError::UnsupportedFormat(format!(
                "unsupported pack index version {version}"
            )));
        }

        let fan_out = read_fan_out(data, 8)?;
        let n = fan_out[255] as usize;

        let ids_start = 8 + FAN_OUT_BYTES;
        let ids_end = ids_start + n * ID_LEN;
        let crc_start = ids_end;
        let crc_end = crc_start + n * 4;
        let off32_start = crc_end;
        let off32_end = off32_start + n * 4;

        if data.len() < off32_end {
            return Err(OdbError::CorruptObject("pack index v2 truncated tables".into()));
        }

        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            ids.push(ObjectId::from_raw(&data[ids_start..ids_end], i * ID_LEN));
        }
        verify_ascending(&ids)?;

        let mut crc32 = Vec::with_capacity(n);
        for i in 0..n {
            let rec = &data[crc_start + i * 4..][..4];
            crc32.push(u32::from_be_bytes([rec[0], rec[1], rec[2], rec[3]]));
        }

        // Count how many offsets need the 64-bit overflow table so we
        // know where it ends before reading the trailer.
        let mut large_count = 0usize;
        let mut offsets32 = Vec::with_capacity(n);
        for i in 0..n {
            let rec = &data[off32_start + i * 4..][..4];
            let raw = u32::from_be_bytes([rec[0], rec[1], rec[2], rec[3]]);
            offsets32.push(raw);
            if raw & 0x8000_0000 != 0 {
                large_count = large_count.max(((raw & 0x7fff_ffff) as usize) + 1);
            }
        }

        let off64_start = off32_end;
        let off64_end = off64_start + large_count * 8;
        let trailer_start = off64_end;
        if data.len() < trailer_start + 2 * ID_LEN {
            return Err(OdbError::CorruptObject(
                "pack index v2 truncated offset table or trailer".into(),
            ));
        }

        let mut offsets = Vec::with_capacity(n);
        for raw in offsets32 {
            if raw & 0x8000_0000 != 0 {
                let idx64 = (raw & 0x7fff_ffff) as usize;
                let pos = off64_start + idx64 * 8;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&data[pos..pos + 8]);
                offsets.push(u64::from_be_bytes(buf));
            } else {
                offsets.push(raw as u64);
            }
        }

        let mut pack_checksum = [0u8; ID_LEN];
        pack_checksum.copy_from_slice(&data[trailer_start..trailer_start + ID_LEN]);
        let mut idx_checksum = [0u8; ID_LEN];
        idx_checksum.copy_from_slice(&data[trailer_start + ID_LEN..trailer_start + 2 * ID_LEN]);

        Ok(Self {
            version: IndexVersion::V2,
            fan_out,
            ids,
            offsets,
            crc32: Some(crc32),
            pack_checksum,
            idx_checksum,
            path,
            reverse: OnceLock::new(),
        })
    }

    pub fn version(&self) -> IndexVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pack_checksum(&self) -> [u8; ID_LEN] {
        self.pack_checksum
    }

    pub fn idx_checksum(&self) -> [u8; ID_LEN] {
        self.idx_checksum
    }

    fn fan_out_range(&self, first_byte: u8) -> (usize, usize) {
        let hi = self.fan_out[first_byte as usize] as usize;
        let lo = if first_byte == 0 { 0 } else { self.fan_out[first_byte as usize - 1] as usize };
        (lo, hi)
    }

    fn position_of(&self, id: &ObjectId) -> Option<usize> {
        let (lo, hi) = self.fan_out_range(id.first_byte());
        self.ids[lo..hi].binary_search(id).ok().map(|i| i + lo)
    }

    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        self.position_of(id).map(|i| self.offsets[i])
    }

    pub fn find_crc32(&self, id: &ObjectId) -> Option<u32> {
        let i = self.position_of(id)?;
        self.crc32.as_ref().map(|c| c[i])
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.position_of(id).is_some()
    }

    /// Every id in this index matching `abbrev`, for abbreviated-id
    /// resolution. Narrowed to the fan-out range sharing the
    /// abbreviation's first byte before the per-id prefix compare.
    pub fn find_by_prefix(&self, abbrev: &AbbreviatedObjectId) -> Vec<ObjectId> {
        let (lo, hi) = self.fan_out_range(abbrev.first_byte());
        self.ids[lo..hi].iter().copied().filter(|id| abbrev.matches(id)).collect()
    }

    /// Resolve a pack offset back to the object id stored there, building
    /// the (offset, id) reverse mapping on first use.
    pub fn find_object(&self, offset: u64) -> Option<ObjectId> {
        let reverse = self.reverse.get_or_init(|| {
            let mut order: Vec<u32> = (0..self.ids.len() as u32).collect();
            order.sort_unstable_by_key(|&i| self.offsets[i as usize]);
            order
        });
        let idx = reverse
            .binary_search_by_key(&offset, |&i| self.offsets[i as usize])
            .ok()?;
        Some(self.ids[reverse[idx] as usize])
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, u64, Option<u32>)> + '_ {
        (0..self.ids.len()).map(move |i| {
            (self.ids[i], self.offsets[i], self.crc32.as_ref().map(|c| c[i]))
        })
    }
}

fn read_fan_out(data: &[u8], start: usize) -> Result<[u32; FAN_OUT_ENTRIES]> {
    if data.len() < start + FAN_OUT_BYTES {
        return Err(OdbError::CorruptObject("pack index fan-out table truncated".into()));
    }
    let mut table = [0u32; FAN_OUT_ENTRIES];
    for (i, slot) in table.iter_mut().enumerate() {
        let off = start + i * 4;
        *slot = u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
    }
    Ok(table)
}

fn verify_ascending(ids: &[ObjectId]) -> Result<()> {
    if ids.windows(2).any(|w| w[0] >= w[1]) {
        return Err(OdbError::CorruptObject("pack index ids are not strictly ascending".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assemble a well-formed v2 `.idx` file for a given id/offset/crc
    /// set. `ids` must already be sorted ascending, as a real index
    /// always is; tests that want to exercise the ascending-order
    /// invariant pass unsorted ids on purpose.
    fn build_v2_index_bytes(
        ids: &[ObjectId],
        offsets: &[u64],
        crcs: &[u32],
        pack_checksum: [u8; 20],
        idx_checksum_seed: [u8; 20],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&V2_MAGIC);
        out.extend_from_slice(&2u32.to_be_bytes());

        let mut fan_out = [0u32; FAN_OUT_ENTRIES];
        for id in ids {
            for slot in fan_out.iter_mut().skip(id.first_byte() as usize) {
                *slot += 1;
            }
        }
        for count in fan_out {
            out.extend_from_slice(&count.to_be_bytes());
        }

        for id in ids {
            out.extend_from_slice(&id.as_bytes());
        }
        for crc in crcs {
            out.extend_from_slice(&crc.to_be_bytes());
        }
        for &offset in offsets {
            assert!(offset <= 0x7fff_ffff, "test fixture does not support 64-bit offsets");
            out.extend_from_slice(&(offset as u32).to_be_bytes());
        }

        out.extend_from_slice(&pack_checksum);
        out.extend_from_slice(&idx_checksum_seed);
        out
    }

    #[test]
    fn round_trips_v2_lookup() {
        let ids: Vec<ObjectId> = (0u8..10).map(|i| ObjectId::from_bytes([i; 20])).collect();
        let offsets: Vec<u64> = (0..10).map(|i| 12 + i as u64 * 100).collect();
        let crcs: Vec<u32> = (0..10).map(|i| i as u32 * 7).collect();

        let bytes = build_v2_index_bytes(&ids, &offsets, &crcs, [0xaa; 20], [0xbb; 20]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack.idx");
        std::fs::write(&path, &bytes).unwrap();

        let index = PackIndex::open(&path).unwrap();
        assert_eq!(index.version(), IndexVersion::V2);
        assert_eq!(index.len(), 10);

        for (i, id) in ids.iter().enumerate() {
            assert_eq!(index.find_offset(id), Some(offsets[i]));
            assert_eq!(index.find_crc32(id), Some(crcs[i]));
            assert_eq!(index.find_object(offsets[i]), Some(*id));
        }

        let missing = ObjectId::from_bytes([0xff; 20]);
        assert_eq!(index.find_offset(&missing), None);
    }

    #[test]
    fn find_by_prefix_narrows_to_matching_ids() {
        let ids: Vec<ObjectId> = (0u8..10).map(|i| ObjectId::from_bytes([i; 20])).collect();
        let offsets: Vec<u64> = (0..10).map(|i| 12 + i as u64 * 100).collect();
        let crcs: Vec<u32> = (0..10).map(|i| i as u32 * 7).collect();

        let bytes = build_v2_index_bytes(&ids, &offsets, &crcs, [0xaa; 20], [0xbb; 20]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack.idx");
        std::fs::write(&path, &bytes).unwrap();
        let index = PackIndex::open(&path).unwrap();

        let abbrev = crate::oid::AbbreviatedObjectId::from_hex(&ids[3].name()[..4]).unwrap();
        assert_eq!(index.find_by_prefix(&abbrev), vec![ids[3]]);

        let none = crate::oid::AbbreviatedObjectId::from_hex("ffff").unwrap();
        assert!(index.find_by_prefix(&none).is_empty());
    }

    #[test]
    fn rejects_non_ascending_ids() {
        let ids = vec![ObjectId::from_bytes([5; 20]), ObjectId::from_bytes([1; 20])];
        let bytes = build_v2_index_bytes(&ids, &[12, 50], &[0, 0], [0; 20], [0; 20]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack.idx");
        std::fs::write(&path, &bytes).unwrap();
        assert!(PackIndex::open(&path).is_err());
    }
}
