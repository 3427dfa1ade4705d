//! Device-number ↔ path translation (§4.6, §10.5).
//!
//! `claim`/`attach`/`detach`/`snapshot` are control-plane calls keyed by a device number
//! (`u32`), but applications more often have a device *path* in hand (something they
//! mounted, something a config file named). Two directions of translation are needed, and
//! the original (original_source/`castle_convenience.c:665-696`) treats them asymmetrically:
//!
//! - path → devno: [`device_number_for_path`], a `stat(2)` on the path's `st_rdev`
//!   (`castle_device_to_devno`). Not cached — the original calls `stat` fresh every time,
//!   since what a path refers to can change underneath it.
//! - devno → path: [`DeviceRegistry::path_for_minor`], which caches formatted
//!   `/dev/<engine>-<minor>` paths indexed by minor number the same way the original did it
//!   (`castle_devno_to_device`'s `devnames` table) — a growable table, one formatted
//!   `String` per minor ever looked up, so repeated lookups for the same minor don't
//!   re-allocate.
//!
//! `castle_client::ops`'s `claim_dev`/`attach_dev`/`detach_dev`/`snapshot_dev` wrappers are
//! what actually chain these with the [`castle_proto::control`] opcodes
//! (`castle_claim_dev`/`castle_attach_dev`/`castle_detach_dev`/`castle_snapshot_dev`,
//! original_source/`castle_convenience.c:703-725`).

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Mutex;

use castle_proto::constants::DEVICE_PATH_PREFIX;

use crate::error::Result;

/// Resolves `path`'s device number via `stat(2)` (`st_rdev`), mirroring the original's
/// `castle_device_to_devno`. This is the input half of `claim_dev`/`detach_dev`/
/// `snapshot_dev`: each of those control calls is keyed by a device number, not a path.
pub fn device_number_for_path(path: &Path) -> Result<u32> {
    let meta = std::fs::metadata(path)?;
    Ok(meta.rdev() as u32)
}

/// Lazily-grown, minor-indexed cache of formatted device paths.
pub struct DeviceRegistry {
    cache: Mutex<Vec<Option<String>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        DeviceRegistry { cache: Mutex::new(Vec::new()) }
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the formatted path for `minor`, growing the cache if this minor hasn't been
    /// looked up before.
    pub fn path_for_minor(&self, minor: u32) -> String {
        let mut cache = self.cache.lock().expect("device registry mutex poisoned");
        let idx = minor as usize;
        if idx >= cache.len() {
            cache.resize(idx + 1, None);
        }
        if cache[idx].is_none() {
            cache[idx] = Some(format!("{DEVICE_PATH_PREFIX}{minor}"));
        }
        cache[idx].clone().expect("just inserted")
    }

    /// Parses a minor number back out of a path produced by [`DeviceRegistry::path_for_minor`]
    /// (or any path sharing the same prefix+minor convention).
    pub fn minor_for_path(path: &str) -> Option<u32> {
        path.strip_prefix(DEVICE_PATH_PREFIX)?.parse().ok()
    }
}
