//! Example CLI agent: connects to a live castle engine device, optionally claims a disk
//! slave by path, and exercises the point get/replace/remove and iterator convenience calls
//! (C6). This is a demonstration of the library's public surface, not part of the core it
//! ships alongside.

use std::env;
use std::path::PathBuf;

use castle_client::{CastleOptions, Connection, Dim};
use castle_proto::constants::CONTROL_DEVICE_PATH;
use log::{error, info};

mod logger;

const BUFFERS_PER_CLASS: usize = 4;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _logger = logger::init_logger()?;

    let device_path = find_device_path();
    info!("connecting to {}", device_path.display());

    let options = CastleOptions::default();
    let conn = match Connection::connect(&device_path, &options, BUFFERS_PER_CLASS) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to connect to {}: {e}", device_path.display());
            return Err(e.into());
        }
    };
    info!("connected, ring capacity {}", options.ring.capacity);

    if let Some(slave_path) = env::var_os("CASTLE_SLAVE_DEVICE") {
        let slave_path = PathBuf::from(slave_path);
        match castle_client::ops::claim_dev(&conn, &slave_path) {
            Ok(slave_id) => info!("claimed slave {} as id {:#x}", slave_path.display(), slave_id),
            Err(e) => error!("failed to claim slave {}: {e}", slave_path.display()),
        }
    } else {
        info!("CASTLE_SLAVE_DEVICE not set, skipping slave claim");
    }

    let collection_id = 0x42;
    let key: Vec<Dim> = vec![Dim::new(b"users"), Dim::new(b"alice")];

    castle_client::ops::replace(&conn, collection_id, &key, b"v1")?;
    info!("replace ok");

    let value = castle_client::ops::get(&conn, collection_id, &key)?;
    info!("get returned {} bytes: {:?}", value.len(), String::from_utf8_lossy(&value));

    castle_client::ops::remove(&conn, collection_id, &key)?;
    info!("remove ok");

    let start: Vec<Dim> = vec![Dim::new(b"k"), Dim::new(b"0")];
    let end: Vec<Dim> = vec![Dim::new(b"k"), Dim::new(b"9")];
    match castle_client::ops::get_slice(&conn, collection_id, &start, &end, 100, 64 * 1024) {
        Ok(entries) => info!("get_slice returned {} entries", entries.len()),
        Err(e) => info!("get_slice returned no data ({e}), this is expected against an empty range"),
    }

    conn.disconnect();
    info!("disconnected cleanly");
    Ok(())
}

/// Resolves the device node to connect to: an override environment variable, falling back
/// to the engine's default control device path.
fn find_device_path() -> PathBuf {
    if let Some(path) = env::var_os("CASTLE_DEVICE") {
        return PathBuf::from(path);
    }
    PathBuf::from(CONTROL_DEVICE_PATH)
}
