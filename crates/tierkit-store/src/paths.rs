use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::store::Store;

pub const DATABASE_FILE: &str = "subscriptions.db";
pub const CATALOG_FILE: &str = "catalog.toml";

/// `~/.tierkit`, falling back to the working directory when no home is set.
pub fn default_base_dir() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".tierkit")
}

pub fn database_path(base_dir: &Path) -> PathBuf {
    base_dir.join(DATABASE_FILE)
}

pub fn catalog_path(base_dir: &Path) -> PathBuf {
    base_dir.join(CATALOG_FILE)
}

/// Open the subscription database under `base_dir`, creating the directory.
pub fn open_in_dir(base_dir: &Path) -> Result<Store> {
    fs::create_dir_all(base_dir).map_err(|e| {
        StoreError::InvalidData(format!("failed to create {}: {e}", base_dir.display()))
    })?;
    Store::open(&database_path(base_dir))
}
