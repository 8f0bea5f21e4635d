//! Reading and writing of loose (one-object-per-file) objects.
//!
//! A loose object on disk is one of two encodings. The legacy and by far
//! the more common one wraps an ASCII `"<type> <size>\0<payload>"` header
//! and the payload together in a single zlib stream; it's detected by the
//! classic zlib magic (`0x78` with a checksum-divisible-by-31 second
//! byte). The modern encoding reuses the pack object header's
//! variable-length type+size framing ahead of a zlib stream that holds
//! exactly the payload. This crate always *writes* the legacy encoding
//! (the one real Git tooling expects) but reads both.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use io_tee::TeeWriter;
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;

use crate::error::{OdbError, Result};
use crate::oid::ObjectId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectType {
    fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            other => Err(OdbError::CorruptObject(format!("invalid object type code {other}"))),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ObjectType {
    type Err = OdbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "commit" => Ok(Self::Commit),
            "tree" => Ok(Self::Tree),
            "blob" => Ok(Self::Blob),
            "tag" => Ok(Self::Tag),
            other => Err(OdbError::CorruptObject(format!("unrecognized object type {other}"))),
        }
    }
}

/// A fully materialized loose object: its type and decompressed payload.
#[derive(Debug, Clone)]
pub struct LooseObject {
    pub object_type: ObjectType,
    pub data: Vec<u8>,
}

/// Reads and writes loose objects rooted at an `objects/` directory.
pub struct LooseObjectLoader {
    objects_dir: PathBuf,
    compression_level: u32,
}

impl LooseObjectLoader {
    pub fn new(objects_dir: impl Into<PathBuf>, compression_level: u32) -> Self {
        Self { objects_dir: objects_dir.into(), compression_level }
    }

    pub fn path_for(&self, id: &ObjectId) -> PathBuf {
        let (dir, file) = id.loose_path();
        self.objects_dir.join(dir).join(file)
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        self.path_for(id).is_file()
    }

    pub fn read(&self, id: &ObjectId) -> Result<LooseObject> {
        let path = self.path_for(id);
        let mut raw = Vec::new();
        File::open(&path)?.read_to_end(&mut raw)?;
        decode(&raw)
    }

    /// Write `object_type`/`data` as a loose object, returning its id.
    /// If an object with the same content already exists, the freshly
    /// compressed tempfile is discarded and the existing id is returned.
    pub fn write(&self, object_type: ObjectType, data: &[u8]) -> Result<ObjectId> {
        let header = format!("{object_type} {}\0", data.len());

        let mut temp = NamedTempFile::new_in(&self.objects_dir)?;
        let mut hasher = Sha1::new();
        {
            let mut encoder =
                ZlibEncoder::new(&mut temp, Compression::new(self.compression_level));
            let mut tee = TeeWriter::new(&mut hasher, &mut encoder);
            tee.write_all(header.as_bytes())?;
            tee.write_all(data)?;
            encoder.try_finish()?;
        }
        let id = ObjectId::from_sha1(hasher.finalize());

        let path = self.path_for(&id);
        if path.is_file() {
            return Ok(id);
        }

        let dir = path.parent().expect("loose object path always has a parent");
        match fs::create_dir(dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(OdbError::Io(err)),
        }

        match fs::rename(temp.path(), &path) {
            Ok(()) => {
                temp.keep().ok();
            }
            Err(err) if path.is_file() => {
                // Lost a race with another writer producing the same
                // content; their file is just as valid as ours.
                let _ = err;
            }
            Err(err) => return Err(OdbError::Io(err)),
        }

        Ok(id)
    }
}

/// Decode the raw (still on-disk) bytes of a loose object.
pub fn decode(raw: &[u8]) -> Result<LooseObject> {
    if raw.len() < 2 {
        return Err(OdbError::CorruptObject("loose object truncated".into()));
    }

    if raw[0] == 0x78 && (u16::from_be_bytes([raw[0], raw[1]]) % 31 == 0) {
        decode_legacy(raw)
    } else {
        decode_modern(raw)
    }
}

fn decode_legacy(raw: &[u8]) -> Result<LooseObject> {
    let mut decoder = ZlibDecoder::new(raw);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| OdbError::CorruptObject(format!("zlib stream: {e}")))?;

    let space = inflated
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| OdbError::CorruptObject("missing type in loose object header".into()))?;
    let nul = inflated[space..]
        .iter()
        .position(|&b| b == 0)
        .map(|i| i + space)
        .ok_or_else(|| OdbError::CorruptObject("missing NUL in loose object header".into()))?;

    let object_type: ObjectType = std::str::from_utf8(&inflated[..space])
        .map_err(|_| OdbError::CorruptObject("non-utf8 object type".into()))?
        .parse()?;
    let size: usize = std::str::from_utf8(&inflated[space + 1..nul])
        .map_err(|_| OdbError::CorruptObject("non-utf8 object size".into()))?
        .parse()
        .map_err(|_| OdbError::CorruptObject("invalid object size".into()))?;

    let payload = &inflated[nul + 1..];
    if payload.len() != size {
        return Err(OdbError::CorruptObject(format!(
            "declared size {size} does not match inflated length {}",
            payload.len()
        )));
    }

    Ok(LooseObject { object_type, data: payload.to_vec() })
}

fn decode_modern(raw: &[u8]) -> Result<LooseObject> {
    // Same variable-length framing as a pack object header: bit 7 of
    // each byte is the continuation flag, bits 4-6 of the first byte are
    // the type, and the remaining bits are size, 7 more per continuation
    // byte.
    let mut pos = 0usize;
    let first = *raw.get(pos).ok_or_else(|| OdbError::CorruptObject("empty loose object".into()))?;
    pos += 1;

    let object_type = ObjectType::from_code((first >> 4) & 0x7)?;
    let mut size = (first & 0x0f) as u64;
    let mut shift = 4u32;
    let mut cont = first & 0x80 != 0;
    while cont {
        let byte = *raw
            .get(pos)
            .ok_or_else(|| OdbError::CorruptObject("truncated loose object header".into()))?;
        pos += 1;
        size |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        cont = byte & 0x80 != 0;
    }

    let mut decoder = ZlibDecoder::new(&raw[pos..]);
    let mut payload = Vec::with_capacity(size as usize);
    decoder
        .read_to_end(&mut payload)
        .map_err(|e| OdbError::CorruptObject(format!("zlib stream: {e}")))?;

    if payload.len() as u64 != size {
        return Err(OdbError::CorruptObject(format!(
            "declared size {size} does not match inflated length {}",
            payload.len()
        )));
    }

    Ok(LooseObject { object_type, data: payload })
}
