//! Device key material on disk.
//!
//! The key file is JSON [`KeyMaterial`] written once with owner-only
//! permissions. It is never regenerated while the store holds data for the
//! device it names.

use crate::persistence::{SqliteStore, META_LOCAL_DEVICE};
use opsync_core::{EventLog, KeyMaterial, KeyStore, SyncError};
use std::path::Path;
use tracing::info;

/// Load the device key file, creating it on first run.
///
/// # Errors
///
/// Returns [`SyncError::Key`] if the file is unreadable or malformed, if it is
/// missing while the store already holds data, or if it names a different
/// device than the store.
pub fn load_or_create(path: &Path, store: &SqliteStore) -> Result<KeyStore, SyncError> {
    let recorded = store.local_device()?;

    if path.exists() {
        let keys = read_key_file(path)?;
        match recorded {
            Some(device) if device != keys.device_id() => {
                return Err(SyncError::Key(format!(
                    "key file {} belongs to {} but the event log belongs to {device}",
                    path.display(),
                    keys.device_id()
                )));
            }
            Some(_) => {}
            None => store.set_meta(META_LOCAL_DEVICE, &keys.device_id().to_string())?,
        }
        return Ok(keys);
    }

    if let Some(device) = recorded {
        return Err(SyncError::Key(format!(
            "key file {} is missing but the event log holds data for {device}",
            path.display()
        )));
    }
    if !store.is_empty()? {
        return Err(SyncError::Key(format!(
            "key file {} is missing but the event log is not empty",
            path.display()
        )));
    }

    let keys = KeyStore::generate_for_host(&hostname());
    write_key_file(path, &keys, false)?;
    store.set_meta(META_LOCAL_DEVICE, &keys.device_id().to_string())?;
    info!(device_id = %keys.device_id(), path = %path.display(), "device identity created");
    Ok(keys)
}

/// Read key material from a file.
///
/// # Errors
///
/// Returns [`SyncError::Key`] if the file cannot be read or parsed.
pub fn read_key_file(path: &Path) -> Result<KeyStore, SyncError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Key(format!("failed to read {}: {e}", path.display())))?;
    let material: KeyMaterial = serde_json::from_str(&contents)
        .map_err(|e| SyncError::Key(format!("malformed key file {}: {e}", path.display())))?;
    KeyStore::from_material(&material)
}

/// Write key material with owner-only permissions.
///
/// Refuses to overwrite an existing file unless `replace` is set.
///
/// # Errors
///
/// Returns [`SyncError::Key`] if the file cannot be written.
pub fn write_key_file(path: &Path, keys: &KeyStore, replace: bool) -> Result<(), SyncError> {
    let io_err = |e: std::io::Error| SyncError::Key(format!("failed to write {}: {e}", path.display()));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_private_dir(parent).map_err(io_err)?;
    }

    let contents = serde_json::to_string_pretty(&keys.to_material())?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    if replace {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    use std::io::Write;
    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(contents.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    Ok(())
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Host name used to derive a new device id.
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
