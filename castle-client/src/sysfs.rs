//! Collection-name discovery (§6.5).
//!
//! Enumerates `/sys/fs/<engine>/collections/<hex-id>/name` the way the reference stack walks
//! its own sysfs tree: a plain directory scan plus a one-line file read per entry, no caching
//! (the collection set changes rarely and this is not called from any hot path).

use std::path::Path;

use castle_proto::constants::SYSFS_COLLECTIONS_DIR;

/// One discovered collection: its id (parsed from the hex directory name) and name (the
/// first line of its `name` file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub id: u32,
    pub name: String,
}

/// Scans the collections directory, skipping (with a warning) any entry whose directory name
/// isn't valid hex or whose `name` file is missing/unreadable — a partially-populated sysfs
/// tree during engine startup should not make the whole scan fail.
pub fn list_collections() -> std::io::Result<Vec<CollectionInfo>> {
    list_collections_under(Path::new(SYSFS_COLLECTIONS_DIR))
}

fn list_collections_under(root: &Path) -> std::io::Result<Vec<CollectionInfo>> {
    let mut found = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(hex_id) = file_name.to_str() else { continue };
        let Ok(id) = u32::from_str_radix(hex_id, 16) else {
            log::warn!("skipping non-hex collection directory {hex_id:?}");
            continue;
        };
        let name_path = entry.path().join("name");
        match std::fs::read_to_string(&name_path) {
            Ok(contents) => {
                let name = contents.lines().next().unwrap_or("").to_string();
                found.push(CollectionInfo { id, name });
            }
            Err(e) => {
                log::warn!("skipping collection {id:x}: {e}");
            }
        }
    }
    Ok(found)
}

/// Looks up a single collection by name, returning its id.
pub fn find_collection_id(name: &str) -> std::io::Result<Option<u32>> {
    Ok(list_collections()?.into_iter().find(|c| c.name == name).map(|c| c.id))
}
