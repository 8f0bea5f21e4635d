//! `.pack` file reading: header/trailer validation, object header
//! parsing, and delta-chain resolution on top of the windowed cache.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tracing::{info, instrument, warn};

use crate::error::{OdbError, Result};
use crate::loose::ObjectType;
use crate::oid::ObjectId;
use crate::pack::delta::{apply_delta, DeltaBaseCache, ExternalBaseResolver};
use crate::pack::index::PackIndex;
use crate::pack::{parse_object_header, ObjectHeaderKind, PackIdentity};
use crate::window::{PackSource, WindowCursor};

const MAX_HEADER_BYTES: usize = 32;

/// A fully materialized object read from a pack, whole or
/// delta-reconstructed.
#[derive(Debug, Clone)]
pub struct PackedObject {
    pub object_type: ObjectType,
    pub data: Vec<u8>,
}

/// An open, validated `.pack` file paired with its `.idx`.
pub struct PackFile {
    path: PathBuf,
    identity: PackIdentity,
    index: Arc<PackIndex>,
    len: u64,
    version: u32,
    /// Sticky: once a structural failure is observed, this pack is
    /// rejected by all future lookups until the process re-opens it
    /// (spec.md §4.3).
    valid: AtomicBool,
    delta_base_cache: Mutex<DeltaBaseCache>,
}

impl PackSource for PackFile {
    fn identity(&self) -> PackIdentity {
        self.identity
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn len(&self) -> u64 {
        self.len
    }
}

impl PackFile {
    #[instrument(skip(index), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, index: Arc<PackIndex>, delta_base_cache_limit: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();

        if len < 12 + 20 {
            return Err(OdbError::PackMismatch(path));
        }

        let mut header = [0u8; 12];
        file.read_exact(&mut header)?;
        if &header[0..4] != b"PACK" {
            return Err(OdbError::PackMismatch(path));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let obj_count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        if !(2..=3).contains(&version) || obj_count as usize != index.len() {
            return Err(OdbError::PackMismatch(path));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha1::new();
        std::io::copy(&mut (&mut file).take(len - 20), &mut hasher)?;
        let computed: [u8; 20] = hasher.finalize().into();

        let mut trailer = [0u8; 20];
        file.read_exact(&mut trailer)?;

        if trailer != computed || trailer != index.pack_checksum() {
            return Err(OdbError::PackMismatch(path));
        }

        let identity = PackIdentity::from_path(&path);
        info!(objects = index.len(), version, "pack opened");

        Ok(Self {
            path,
            identity,
            index,
            len,
            version,
            valid: AtomicBool::new(true),
            delta_base_cache: Mutex::new(DeltaBaseCache::new(delta_base_cache_limit)),
        })
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn check_valid(&self) -> Result<()> {
        if self.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OdbError::PackInvalid(self.path.clone()))
        }
    }

    fn mark_invalid(&self) {
        warn!(path = %self.path.display(), "pack marked invalid after structural failure");
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.valid.load(Ordering::SeqCst) && self.index.contains(id)
    }

    pub fn open_object(
        &self,
        id: &ObjectId,
        cursor: &mut WindowCursor<'_>,
        resolver: Option<&dyn ExternalBaseResolver>,
    ) -> Result<PackedObject> {
        self.check_valid()?;
        let offset = self.index.find_offset(id).ok_or_else(|| OdbError::MissingObject(*id))?;
        self.open_at_offset(offset, cursor, resolver)
    }

    #[instrument(skip(self, cursor, resolver))]
    pub fn open_at_offset(
        &self,
        offset: u64,
        cursor: &mut WindowCursor<'_>,
        resolver: Option<&dyn ExternalBaseResolver>,
    ) -> Result<PackedObject> {
        self.check_valid()?;
        match self.resolve(offset, cursor, resolver) {
            Ok(obj) => Ok(obj),
            Err(err @ OdbError::CorruptObject(_)) => {
                self.mark_invalid();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn read_header_buf(&self, offset: u64, cursor: &mut WindowCursor<'_>) -> Result<Vec<u8>> {
        let remaining = (self.len - offset).min(MAX_HEADER_BYTES as u64) as usize;
        let mut buf = vec![0u8; remaining];
        cursor.copy(self, offset, &mut buf)?;
        Ok(buf)
    }

    /// Walk the delta chain (if any) rooted at `offset` down to a whole
    /// object, then apply deltas back outward, caching each
    /// reconstructed level (spec.md §4.3).
    fn resolve(
        &self,
        offset: u64,
        cursor: &mut WindowCursor<'_>,
        resolver: Option<&dyn ExternalBaseResolver>,
    ) -> Result<PackedObject> {
        let mut chain: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut cur_offset = offset;
        let mut visited = std::collections::HashSet::new();

        let (object_type, mut data) = loop {
            if !visited.insert(cur_offset) {
                return Err(OdbError::CorruptObject("delta base cycle detected".into()));
            }

            if let Some(cached) = self.delta_base_cache.lock().get(self.identity, cur_offset) {
                break ((*cached).0, cached.1.clone());
            }

            let header_buf = self.read_header_buf(cur_offset, cursor)?;
            let (header, ofs_base, ref_base) = parse_object_header(&header_buf, cur_offset)?;

            match header.kind {
                ObjectHeaderKind::Whole(object_type) => {
                    let mut out = vec![0u8; header.inflated_size as usize];
                    cursor.inflate(self, header.data_offset, &mut out)?;
                    break (object_type, out);
                }
                ObjectHeaderKind::OfsDelta => {
                    let base_offset = ofs_base.expect("ofs delta carries a base offset");
                    let mut delta_bytes = vec![0u8; header.inflated_size as usize];
                    cursor.inflate(self, header.data_offset, &mut delta_bytes)?;
                    chain.push((cur_offset, delta_bytes));
                    cur_offset = base_offset;
                }
                ObjectHeaderKind::RefDelta => {
                    let base_id = ref_base.expect("ref delta carries a base id");
                    let mut delta_bytes = vec![0u8; header.inflated_size as usize];
                    cursor.inflate(self, header.data_offset, &mut delta_bytes)?;

                    if let Some(base_offset) = self.index.find_offset(&base_id) {
                        chain.push((cur_offset, delta_bytes));
                        cur_offset = base_offset;
                    } else {
                        let resolver = resolver.ok_or(OdbError::MissingObject(base_id))?;
                        let (object_type, base_bytes) =
                            resolver.resolve(&base_id).ok_or(OdbError::MissingObject(base_id))?;
                        chain.push((cur_offset, delta_bytes));
                        break (object_type, base_bytes);
                    }
                }
            }
        };

        while let Some((off, delta_bytes)) = chain.pop() {
            data = apply_delta(&data, &delta_bytes)?;
            self.delta_base_cache.lock().insert(self.identity, off, Arc::new((object_type, data.clone())));
        }

        Ok(PackedObject { object_type, data })
    }

    /// Stream the compressed representation of `id` verbatim to `out`,
    /// verifying CRC32 over `[objectStart, nextObjectStart)` when the
    /// index carries it.
    pub fn copy_raw_to<W: std::io::Write>(
        &self,
        id: &ObjectId,
        out: &mut W,
        cursor: &mut WindowCursor<'_>,
    ) -> Result<()> {
        self.check_valid()?;
        let offset = self.index.find_offset(id).ok_or_else(|| OdbError::MissingObject(*id))?;
        let expected_crc = self.index.find_crc32(id);

        let header_buf = self.read_header_buf(offset, cursor)?;
        let (header, _, _) = parse_object_header(&header_buf, offset)?;
        let consumed = cursor.inflate_verify(self, header.data_offset)?;
        let object_end = header.data_offset + consumed;
        let raw_len = (object_end - offset) as usize;

        let mut raw = vec![0u8; raw_len];
        cursor.copy(self, offset, &mut raw)?;

        if let Some(expected) = expected_crc {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&raw);
            let actual = hasher.finalize();
            if actual != expected {
                self.mark_invalid();
                return Err(OdbError::CorruptObject(format!(
                    "CRC32 mismatch for {id}: expected {expected:08x}, got {actual:08x}"
                )));
            }
        }

        out.write_all(&raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::window::WindowCache;

    fn object_header_bytes(object_type: u8, size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut byte = (object_type << 4) | (size as u8 & 0x0f);
        let mut rest = size >> 4;
        if rest > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        while rest > 0 {
            let mut b = (rest & 0x7f) as u8;
            rest >>= 7;
            if rest > 0 {
                b |= 0x80;
            }
            out.push(b);
        }
        out
    }

    fn build_pack(objects: &[(u8, &[u8])]) -> (tempfile::TempDir, PathBuf, Vec<(ObjectId, u64, u32)>) {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(b"PACK");
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(&(objects.len() as u32).to_be_bytes());

        let mut records = Vec::new();
        for (object_type, payload) in objects {
            let offset = body.len() as u64;
            body.extend(object_header_bytes(*object_type, payload.len()));
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload).unwrap();
            let compressed = encoder.finish().unwrap();

            let object_start = offset as usize;
            body.extend_from_slice(&compressed);
            let crc = {
                let mut h = crc32fast::Hasher::new();
                h.update(&body[object_start..]);
                h.finalize()
            };

            let type_name = match object_type {
                1 => "commit",
                2 => "tree",
                3 => "blob",
                4 => "tag",
                _ => unreachable!(),
            };
            let mut sha = Sha1::new();
            sha.update(format!("{type_name} {}\0", payload.len()));
            sha.update(payload);
            let id = ObjectId::from_sha1(sha.finalize());

            records.push((id, offset, crc));
        }

        let mut hasher = Sha1::new();
        hasher.update(&body);
        let checksum: [u8; 20] = hasher.finalize().into();
        body.extend_from_slice(&checksum);

        let pack_path = dir.path().join("pack-test.pack");
        std::fs::write(&pack_path, &body).unwrap();

        (dir, pack_path, records)
    }

    fn build_index(records: &[(ObjectId, u64, u32)], pack_checksum: [u8; 20]) -> Vec<u8> {
        let mut sorted = records.to_vec();
        sorted.sort_by_key(|(id, _, _)| *id);

        let mut out = Vec::new();
        out.extend_from_slice(&crate::pack::index::V2_MAGIC);
        out.extend_from_slice(&2u32.to_be_bytes());

        let mut fan_out = [0u32; 256];
        for (id, _, _) in &sorted {
            for slot in fan_out.iter_mut().skip(id.first_byte() as usize) {
                *slot += 1;
            }
        }
        for count in fan_out {
            out.extend_from_slice(&count.to_be_bytes());
        }
        for (id, _, _) in &sorted {
            out.extend_from_slice(&id.as_bytes());
        }
        for (_, _, crc) in &sorted {
            out.extend_from_slice(&crc.to_be_bytes());
        }
        for (_, offset, _) in &sorted {
            out.extend_from_slice(&(*offset as u32).to_be_bytes());
        }
        out.extend_from_slice(&pack_checksum);
        out.extend_from_slice(&[0u8; 20]);
        out
    }

    #[test]
    fn opens_whole_object_pack_and_reads_blob() {
        let payload = b"hello from a pack\n".as_slice();
        let (dir, pack_path, records) = build_pack(&[(3, payload)]);
        let pack_bytes = std::fs::read(&pack_path).unwrap();
        let checksum: [u8; 20] = pack_bytes[pack_bytes.len() - 20..].try_into().unwrap();

        let idx_bytes = build_index(&records, checksum);
        let idx_path = dir.path().join("pack-test.idx");
        std::fs::write(&idx_path, &idx_bytes).unwrap();

        let index = Arc::new(PackIndex::open(&idx_path).unwrap());
        let pack = PackFile::open(&pack_path, index, 10 * 1024 * 1024).unwrap();

        let cache = WindowCache::new(Config::default());
        let mut cursor = WindowCursor::new(&cache);

        let (id, _, _) = records[0];
        assert!(pack.has_object(&id));
        let obj = pack.open_object(&id, &mut cursor, None).unwrap();
        assert_eq!(obj.object_type, ObjectType::Blob);
        assert_eq!(obj.data, payload);
    }

    #[test]
    fn copy_raw_to_detects_crc_corruption() {
        let payload = b"some blob contents".as_slice();
        let (dir, pack_path, records) = build_pack(&[(3, payload)]);
        let mut pack_bytes = std::fs::read(&pack_path).unwrap();

        // Corrupt one byte inside the compressed object region (well
        // after the 12-byte header, well before the trailer) and
        // re-derive the pack checksum so the whole-pack check still
        // passes and only the per-object CRC check is exercised.
        pack_bytes[20] ^= 0xff;
        let mut hasher = Sha1::new();
        hasher.update(&pack_bytes[..pack_bytes.len() - 20]);
        let recomputed: [u8; 20] = hasher.finalize().into();
        pack_bytes.truncate(pack_bytes.len() - 20);
        pack_bytes.extend_from_slice(&recomputed);
        std::fs::write(&pack_path, &pack_bytes).unwrap();

        let idx_bytes = build_index(&records, recomputed);
        let idx_path = dir.path().join("pack-test.idx");
        std::fs::write(&idx_path, &idx_bytes).unwrap();

        let index = Arc::new(PackIndex::open(&idx_path).unwrap());
        let pack = PackFile::open(&pack_path, index, 10 * 1024 * 1024).unwrap();
        let cache = WindowCache::new(Config::default());
        let mut cursor = WindowCursor::new(&cache);

        let (id, _, _) = records[0];
        let mut sink = Vec::new();
        assert!(pack.copy_raw_to(&id, &mut sink, &mut cursor).is_err());
    }
}
