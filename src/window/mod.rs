//! The windowed mmap/pread cache that sits between pack object parsing
//! and the filesystem.

pub mod cache;
pub mod cursor;

pub use cache::{ByteWindow, WindowCache};
pub use cursor::WindowCursor;

use std::path::Path;

use crate::pack::PackIdentity;

/// What [`WindowCache`] needs to know about a pack in order to serve
/// windows over it; implemented by [`crate::pack::PackFile`]. Kept as a
/// trait so the cache module doesn't need to depend on the full pack
/// parsing machinery.
pub trait PackSource {
    fn identity(&self) -> PackIdentity;
    fn path(&self) -> &Path;
    fn len(&self) -> u64;
}
