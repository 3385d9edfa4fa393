//! TOML catalog definitions.
//!
//! ```toml
//! [tiers.free]
//! name = "Free"
//! permissions = ["read"]
//! features = { api_access = false }
//! limits = { api_calls_per_day = 100 }
//!
//! [tiers.pro]
//! name = "Pro"
//! inherits_from = "free"
//! features = { api_access = true }
//! limits = { api_calls_per_day = 1000 }
//!
//! [addons.agent_pack]
//! name = "Agent Pack"
//! permissions = ["agent_run"]
//! limits = { api_calls_per_day = 500 }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tierkit_core::{AddonConfig, Catalog, TierConfig};

use crate::error::CatalogFileError;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    tiers: BTreeMap<String, TierConfig>,
    #[serde(default)]
    addons: BTreeMap<String, AddonConfig>,
}

/// Parse and validate a catalog from TOML text.
pub fn parse_catalog(content: &str) -> Result<Catalog, CatalogFileError> {
    let file: CatalogFile = toml::from_str(content)?;
    let catalog = Catalog::new(file.tiers, file.addons)?;

    for (tier, parent) in catalog.dangling_parents() {
        tracing::warn!("tier '{tier}' inherits from undefined tier '{parent}'; chain stops there");
    }

    Ok(catalog)
}

/// Read, parse and validate the catalog at `path`.
pub fn load_catalog(path: &Path) -> Result<Catalog, CatalogFileError> {
    let content = fs::read_to_string(path).map_err(|source| CatalogFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let catalog = parse_catalog(&content)?;
    tracing::info!(
        "loaded catalog {}: {} tiers, {} addons",
        path.display(),
        catalog.tiers().len(),
        catalog.addons().len()
    );
    Ok(catalog)
}
