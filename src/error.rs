//! Error kinds for the object storage engine.
//!
//! Every fallible operation in this crate returns [`OdbError`]. The
//! variants map directly onto the error kinds a composed object database
//! needs to distinguish: a missing object is not fatal to a lookup, a
//! corrupt pack is fatal to that pack but not to the surrounding database,
//! and an `Io` failure always propagates.

use std::path::PathBuf;

use crate::oid::ObjectId;

#[derive(Debug, thiserror::Error)]
pub enum OdbError {
    #[error("corrupt object: {0}")]
    CorruptObject(String),

    #[error("object not found: {0}")]
    MissingObject(ObjectId),

    #[error("object {id} is not a {expected}")]
    IncorrectObjectType { id: ObjectId, expected: &'static str },

    #[error("pack {0} is invalid and has been permanently rejected")]
    PackInvalid(PathBuf),

    #[error("pack/index checksum mismatch for {0}")]
    PackMismatch(PathBuf),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("abbreviated id {0} is ambiguous")]
    Ambiguous(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OdbError>;
