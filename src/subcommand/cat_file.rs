use eyre::{Context, Result};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::odb::{ObjectBackend, ObjectDirectory};
use crate::oid::ObjectId;
use crate::window::{WindowCache, WindowCursor};

/// Prints a loose or packed object's raw contents. Tree/commit semantic
/// parsing stays out of scope, so this always dumps bytes rather than
/// pretty-printing tree entries or commit headers. When `expect_type` is
/// given (`cat-file <type> <object>`, mirroring real git), the object's
/// stored type must match it or the lookup fails.
pub fn run(pretty: bool, expect_type: Option<&str>, object_hash: &str) -> Result<()> {
    eyre::ensure!(pretty || expect_type.is_some(), "either -p or an expected type is required");

    let id = ObjectId::from_hex(object_hash).context("parse object id")?;

    let config = Config::load(Path::new(".git").join("config")).unwrap_or_default();
    let cache = Arc::new(WindowCache::new(config.clone()));
    let objects = ObjectDirectory::open(Path::new(".git").join("objects"), config, cache.clone())
        .context("open object directory")?;

    let mut cursor = WindowCursor::new(&cache);
    let object = match expect_type {
        Some(type_name) => {
            let expected = type_name.parse().context("parse expected object type")?;
            objects
                .open_expecting(&id, expected, &mut cursor)
                .with_context(|| format!("open object {object_hash} as {type_name}"))?
        }
        None => objects.open(&id, &mut cursor).with_context(|| format!("open object {object_hash}"))?,
    };

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&object.data).context("write contents to stdout")?;

    Ok(())
}
