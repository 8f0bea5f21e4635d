//! Git-compatible object storage: content addressing, loose and packed
//! object access, the windowed pack cache, and their composition into a
//! searchable object database.

pub mod config;
pub mod error;
pub mod loose;
pub mod odb;
pub mod oid;
pub mod oid_map;
pub mod pack;
pub mod repo_cache;
pub mod subcommand;
pub mod window;
