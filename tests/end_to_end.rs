//! End-to-end scenarios built against on-disk fixture repositories
//! constructed in-process rather than checked-in binary packs.

use std::io::Write as _;
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};

use packed_odb::config::Config;
use packed_odb::error::OdbError;
use packed_odb::loose::{LooseObjectLoader, ObjectType};
use packed_odb::odb::{ObjectBackend, ObjectDirectory};
use packed_odb::oid::ObjectId;
use packed_odb::pack::{PackFile, PackIndex};
use packed_odb::window::{WindowCache, WindowCursor};

fn whole_object_header(object_type: u8, size: usize) -> Vec<u8> {
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

fn zlib(payload: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap()
}

fn id_for(object_type: &str, payload: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(format!("{object_type} {}\0", payload.len()));
    hasher.update(payload);
    ObjectId::from_sha1(hasher.finalize())
}

/// Finalizes `body` (already containing the 12-byte PACK header and all
/// object records) by appending the trailing SHA-1 and writing both the
/// `.pack` and a matching v2 `.idx` to `dir`.
fn finalize_pack(
    dir: &std::path::Path,
    name: &str,
    mut body: Vec<u8>,
    records: &mut [(ObjectId, u64, u32)],
) -> (std::path::PathBuf, std::path::PathBuf) {
    let mut hasher = Sha1::new();
    hasher.update(&body);
    let checksum: [u8; 20] = hasher.finalize().into();
    body.extend_from_slice(&checksum);

    let pack_path = dir.join(format!("{name}.pack"));
    std::fs::write(&pack_path, &body).unwrap();

    records.sort_by_key(|(id, _, _)| *id);
    let mut idx = Vec::new();
    idx.extend_from_slice(&packed_odb::pack::index::V2_MAGIC);
    idx.extend_from_slice(&2u32.to_be_bytes());
    let mut fan_out = [0u32; 256];
    for (id, _, _) in records.iter() {
        for slot in fan_out.iter_mut().skip(id.first_byte() as usize) {
            *slot += 1;
        }
    }
    for count in fan_out {
        idx.extend_from_slice(&count.to_be_bytes());
    }
    for (id, _, _) in records.iter() {
        idx.extend_from_slice(&id.as_bytes());
    }
    for (_, _, crc) in records.iter() {
        idx.extend_from_slice(&crc.to_be_bytes());
    }
    for (_, offset, _) in records.iter() {
        idx.extend_from_slice(&(*offset as u32).to_be_bytes());
    }
    idx.extend_from_slice(&checksum);
    idx.extend_from_slice(&[0u8; 20]);

    let idx_path = dir.join(format!("{name}.idx"));
    std::fs::write(&idx_path, &idx).unwrap();

    (pack_path, idx_path)
}

#[test]
fn e1_blob_hash_and_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let loader = LooseObjectLoader::new(dir.path(), 6);

    let id = loader.write(ObjectType::Blob, b"hello\n").unwrap();
    assert_eq!(id.name(), "ce013625030ba8dba906f756967f9e9ca394464a");

    let read_back = loader.read(&id).unwrap();
    assert_eq!(read_back.object_type, ObjectType::Blob);
    assert_eq!(read_back.data, b"hello\n");
}

#[test]
fn e2_pack_with_commit_references_empty_tree() {
    let dir = tempfile::tempdir().unwrap();

    let empty_tree_payload: &[u8] = b"";
    let tree_id = id_for("tree", empty_tree_payload);
    assert_eq!(tree_id.name(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");

    let commit_payload = format!(
        "tree {}\nauthor a <a@example.com> 0 +0000\ncommitter a <a@example.com> 0 +0000\n\nempty\n",
        tree_id
    );

    let mut body = Vec::new();
    body.extend_from_slice(b"PACK");
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(&2u32.to_be_bytes());
    let mut records = Vec::new();

    for (code, name, payload) in [(2u8, "tree", empty_tree_payload), (1u8, "commit", commit_payload.as_bytes())] {
        let offset = body.len() as u64;
        body.extend(whole_object_header(code, payload.len()));
        let start = body.len();
        body.extend(zlib(payload));
        let mut h = crc32fast::Hasher::new();
        h.update(&body[start..]);
        records.push((id_for(name, payload), offset, h.finalize()));
    }

    let (pack_path, idx_path) = finalize_pack(dir.path(), "commit-tree", body, &mut records);

    let index = Arc::new(PackIndex::open(&idx_path).unwrap());
    let pack = PackFile::open(&pack_path, index, 10 * 1024 * 1024).unwrap();
    assert!(pack.has_object(&tree_id));

    let cache = WindowCache::new(Config::default());
    let mut cursor = WindowCursor::new(&cache);
    let tree = pack.open_object(&tree_id, &mut cursor, None).unwrap();
    assert!(tree.data.is_empty());
}

#[test]
fn e3_ofs_delta_chain_reconstructs_exact_bytes() {
    let dir = tempfile::tempdir().unwrap();

    let base_payload = vec![b'a'; 1024];
    let mut expected = base_payload.clone();
    expected[512] = b'b';

    fn varint(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
        out
    }

    let mut delta = Vec::new();
    delta.extend(varint(1024));
    delta.extend(varint(1024));
    delta.push(0x80 | 0x20); // size1 byte present (size=512), offset omitted (offset 0)
    delta.push(2);
    delta.push(1);
    delta.push(b'b');
    delta.push(0x80 | 0x01 | 0x02 | 0x10 | 0x20); // offset0+offset1 present (offset=513), size0+size1 present (size=511)
    delta.push(1);
    delta.push(2);
    delta.push(511u16 as u8);
    delta.push((511u16 >> 8) as u8);

    let mut body = Vec::new();
    body.extend_from_slice(b"PACK");
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(&2u32.to_be_bytes());
    let mut records = Vec::new();

    let base_offset = body.len() as u64;
    body.extend(whole_object_header(3, base_payload.len()));
    let start = body.len();
    body.extend(zlib(&base_payload));
    let mut h = crc32fast::Hasher::new();
    h.update(&body[start..]);
    records.push((id_for("blob", &base_payload), base_offset, h.finalize()));

    let delta_offset = body.len() as u64;
    let rel_offset = delta_offset - base_offset;
    // OFS_DELTA object header: type code 6, then size of inflated delta
    // stream, then the backward-offset varint (biased encoding).
    let mut header = whole_object_header(6, delta.len());
    let mut ofs_bytes = Vec::new();
    {
        let mut value = rel_offset;
        let mut stack = vec![(value & 0x7f) as u8];
        value >>= 7;
        while value > 0 {
            value -= 1;
            stack.push(0x80 | (value & 0x7f) as u8);
            value >>= 7;
        }
        stack.reverse();
        ofs_bytes.extend(stack);
    }
    header.extend(ofs_bytes);
    body.extend(header);
    let start = body.len();
    body.extend(zlib(&delta));
    let mut h = crc32fast::Hasher::new();
    h.update(&body[start..]);
    // The index only needs an id distinct from the base to look this
    // entry up by id; it doesn't need to match the id a real pack would
    // assign to a delta-encoded object.
    let delta_id = id_for("blob", &expected);
    records.push((delta_id, delta_offset, h.finalize()));

    let (pack_path, idx_path) = finalize_pack(dir.path(), "ofs-delta", body, &mut records);

    let index = Arc::new(PackIndex::open(&idx_path).unwrap());
    let pack = PackFile::open(&pack_path, index, 10 * 1024 * 1024).unwrap();

    let cache = WindowCache::new(Config::default());
    let mut cursor = WindowCursor::new(&cache);
    let reconstructed = pack.open_object(&delta_id, &mut cursor, None).unwrap();

    assert_eq!(&reconstructed.data[0..512], &expected[0..512]);
    assert_eq!(reconstructed.data[512], b'b');
    assert_eq!(&reconstructed.data[513..1024], &expected[513..1024]);
}

#[test]
fn e3b_deep_ofs_delta_chain_reconstructs_exact_bytes() {
    const DEPTH: usize = 50;
    const BASE_LEN: usize = 64;

    fn single_byte_flip_delta(len: usize, flip_at: usize, new_byte: u8) -> Vec<u8> {
        fn copy_op(offset: usize, size: usize) -> Vec<u8> {
            if offset == 0 {
                vec![0x80 | 0x10, size as u8]
            } else {
                vec![0x80 | 0x01 | 0x10, offset as u8, size as u8]
            }
        }

        fn varint(mut value: u64) -> Vec<u8> {
            let mut out = Vec::new();
            loop {
                let mut byte = (value & 0x7f) as u8;
                value >>= 7;
                if value != 0 {
                    byte |= 0x80;
                }
                out.push(byte);
                if value == 0 {
                    break;
                }
            }
            out
        }

        let mut delta = Vec::new();
        delta.extend(varint(len as u64));
        delta.extend(varint(len as u64));
        if flip_at > 0 {
            delta.extend(copy_op(0, flip_at));
        }
        delta.push(1);
        delta.push(new_byte);
        if flip_at + 1 < len {
            delta.extend(copy_op(flip_at + 1, len - flip_at - 1));
        }
        delta
    }

    fn ofs_delta_header_and_body(rel_offset: u64, delta: &[u8]) -> Vec<u8> {
        let mut out = whole_object_header(6, delta.len());
        let mut value = rel_offset;
        let mut stack = vec![(value & 0x7f) as u8];
        value >>= 7;
        while value > 0 {
            value -= 1;
            stack.push(0x80 | (value & 0x7f) as u8);
            value >>= 7;
        }
        stack.reverse();
        out.extend(stack);
        out.extend(zlib(delta));
        out
    }

    let dir = tempfile::tempdir().unwrap();

    let mut body = Vec::new();
    body.extend_from_slice(b"PACK");
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(&(DEPTH as u32 + 1).to_be_bytes());

    let mut payload = vec![b'a'; BASE_LEN];
    let base_offset = body.len() as u64;
    body.extend(whole_object_header(3, payload.len()));
    body.extend(zlib(&payload));

    let mut prev_offset = base_offset;
    let mut final_crc = 0u32;
    for depth in 0..DEPTH {
        let flip_at = depth % BASE_LEN;
        let new_byte = b'a' + (depth % 26) as u8;
        let delta = single_byte_flip_delta(payload.len(), flip_at, new_byte);
        payload[flip_at] = new_byte;

        let compressed = zlib(&delta);
        let mut h = crc32fast::Hasher::new();
        h.update(&compressed);
        final_crc = h.finalize();

        let this_offset = body.len() as u64;
        body.extend(ofs_delta_header_and_body(this_offset - prev_offset, &delta));
        prev_offset = this_offset;
    }

    let final_id = id_for("blob", &payload);
    let mut records = vec![(final_id, prev_offset, final_crc)];

    let (pack_path, idx_path) = finalize_pack(dir.path(), "deep-ofs-delta", body, &mut records);

    let index = Arc::new(PackIndex::open(&idx_path).unwrap());
    let pack = PackFile::open(&pack_path, index, 10 * 1024 * 1024).unwrap();

    let cache = WindowCache::new(Config::default());
    let mut cursor = WindowCursor::new(&cache);
    let reconstructed = pack.open_object(&final_id, &mut cursor, None).unwrap();

    assert_eq!(reconstructed.data, payload);
}

#[test]
fn e5_crc_corruption_fails_both_copy_raw_and_open() {
    let dir = tempfile::tempdir().unwrap();
    let payload = b"a blob that will be corrupted on disk".as_slice();

    let mut body = Vec::new();
    body.extend_from_slice(b"PACK");
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(&1u32.to_be_bytes());
    let offset = body.len() as u64;
    body.extend(whole_object_header(3, payload.len()));
    let start = body.len();
    body.extend(zlib(payload));
    let mut h = crc32fast::Hasher::new();
    h.update(&body[start..]);
    let crc = h.finalize();
    let id = id_for("blob", payload);

    // Corrupt one byte inside the compressed region, then patch the pack
    // trailer so only the per-object CRC check is exercised.
    let corrupt_at = start + 2;
    body[corrupt_at] ^= 0xff;
    let mut hasher = Sha1::new();
    hasher.update(&body);
    let checksum: [u8; 20] = hasher.finalize().into();
    body.extend_from_slice(&checksum);

    let pack_path = dir.path().join("crc.pack");
    std::fs::write(&pack_path, &body).unwrap();
    let idx_path = dir.path().join("crc.idx");
    let recomputed = checksum;

    let mut idx = Vec::new();
    idx.extend_from_slice(&packed_odb::pack::index::V2_MAGIC);
    idx.extend_from_slice(&2u32.to_be_bytes());
    let mut fan_out = [0u32; 256];
    for slot in fan_out.iter_mut().skip(id.first_byte() as usize) {
        *slot += 1;
    }
    for count in fan_out {
        idx.extend_from_slice(&count.to_be_bytes());
    }
    idx.extend_from_slice(&id.as_bytes());
    idx.extend_from_slice(&crc.to_be_bytes());
    idx.extend_from_slice(&(offset as u32).to_be_bytes());
    idx.extend_from_slice(&recomputed);
    idx.extend_from_slice(&[0u8; 20]);
    std::fs::write(&idx_path, &idx).unwrap();

    let index = Arc::new(PackIndex::open(&idx_path).unwrap());
    let pack = PackFile::open(&pack_path, index, 10 * 1024 * 1024).unwrap();
    let cache = WindowCache::new(Config::default());
    let mut cursor = WindowCursor::new(&cache);

    let mut sink = Vec::new();
    assert!(matches!(pack.copy_raw_to(&id, &mut sink, &mut cursor), Err(OdbError::CorruptObject(_))));

    // The pack is now sticky-invalid after the first structural failure;
    // open a fresh one to exercise the inflation path independently.
    let index2 = Arc::new(PackIndex::open(&idx_path).unwrap());
    let pack2 = PackFile::open(&pack_path, index2, 10 * 1024 * 1024).unwrap();
    let mut cursor2 = WindowCursor::new(&cache);
    let result = pack2.open_object(&id, &mut cursor2, None);
    assert!(result.is_err());
}

#[test]
fn e6_alternate_cycle_terminates_with_missing_object() {
    let dir = tempfile::tempdir().unwrap();
    let a_objects = dir.path().join("a").join("objects");
    let b_objects = dir.path().join("b").join("objects");
    std::fs::create_dir_all(a_objects.join("pack")).unwrap();
    std::fs::create_dir_all(a_objects.join("info")).unwrap();
    std::fs::create_dir_all(b_objects.join("pack")).unwrap();
    std::fs::create_dir_all(b_objects.join("info")).unwrap();
    std::fs::write(a_objects.join("info").join("alternates"), format!("{}\n", b_objects.display())).unwrap();
    std::fs::write(b_objects.join("info").join("alternates"), format!("{}\n", a_objects.display())).unwrap();

    let cache = Arc::new(WindowCache::new(Config::default()));
    let a = ObjectDirectory::open(&a_objects, Config::default(), cache).unwrap();

    let missing = ObjectId::from_hex("000000000000000000000000000000000000000a").unwrap();
    assert!(!a.has_object(&missing));

    let scratch_cache = WindowCache::new(Config::default());
    let mut cursor = WindowCursor::new(&scratch_cache);
    assert!(matches!(a.open(&missing, &mut cursor), Err(OdbError::MissingObject(_))));
}
