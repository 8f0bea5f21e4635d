use eyre::{Context, Result};
use sha1::{Digest, Sha1};
use std::fs;
use std::path::Path;

use crate::config;
use crate::loose::{LooseObjectLoader, ObjectType};
use crate::oid::ObjectId;

pub fn run(write: bool, path: &str) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("read {path}"))?;

    let hash = if write {
        let objects_dir = Path::new(".git").join("objects");
        let loader = LooseObjectLoader::new(objects_dir, config::DEFAULT_COMPRESSION_LEVEL);
        loader.write(ObjectType::Blob, &data).context("write loose blob")?
    } else {
        let mut hasher = Sha1::new();
        hasher.update(format!("blob {}\0", data.len()));
        hasher.update(&data);
        ObjectId::from_sha1(hasher.finalize())
    };

    println!("{hash}");

    Ok(())
}
