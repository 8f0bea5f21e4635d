use eyre::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::pack::{PackFile, PackIndex};
use crate::window::{WindowCache, WindowCursor};

/// Given a `.idx` index file, verify that the corresponding packfile
/// exists, that its header/trailer/index checksums agree, and that
/// every object's compressed bytes pass CRC32.
pub fn run(index_file: &str) -> Result<()> {
    let index_path: &Path = index_file.as_ref();
    let pack_path = index_path.with_extension("pack");

    let index = Arc::new(PackIndex::open(index_path).context("open pack index")?);
    let object_count = index.len();
    let pack = PackFile::open(&pack_path, index, 10 * 1024 * 1024).context("open pack file")?;

    let cache = WindowCache::new(Default::default());
    let mut cursor = WindowCursor::new(&cache);

    let mut checked = 0usize;
    for (id, _offset, _crc) in pack.index().iter() {
        let mut sink = std::io::sink();
        pack.copy_raw_to(&id, &mut sink, &mut cursor)
            .with_context(|| format!("verify {id}"))?;
        checked += 1;
    }

    println!("{pack_path}: ok, {checked}/{object_count} objects verified", pack_path = pack_path.display());

    Ok(())
}
