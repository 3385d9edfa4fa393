//! Tier and add-on definitions, plus the swappable handle the engine reads.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;

use crate::model::{AddonConfig, TierConfig, UNLIMITED};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("tier inheritance cycle: {}", .path.join(" -> "))]
    InheritanceCycle { path: Vec<String> },
    #[error("invalid limit {key} = {value} on {owner} (expected >= 0 or -1 for unlimited)")]
    InvalidLimit {
        owner: String,
        key: String,
        value: i64,
    },
}

/// Immutable set of tier and add-on definitions.
///
/// Construction validates the whole catalog, so a bad definition fails at
/// load time rather than on the first request that touches it.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Catalog {
    tiers: BTreeMap<String, TierConfig>,
    addons: BTreeMap<String, AddonConfig>,
}

impl Catalog {
    pub fn new(
        tiers: BTreeMap<String, TierConfig>,
        addons: BTreeMap<String, AddonConfig>,
    ) -> Result<Self, CatalogError> {
        let catalog = Self { tiers, addons };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for (id, tier) in &self.tiers {
            check_limits(&format!("tier '{id}'"), &tier.limits)?;
            self.tier_chain(id)?;
        }
        for (id, addon) in &self.addons {
            check_limits(&format!("addon '{id}'"), &addon.limits)?;
        }
        Ok(())
    }

    pub fn tier(&self, id: &str) -> Option<&TierConfig> {
        self.tiers.get(id)
    }

    pub fn addon(&self, id: &str) -> Option<&AddonConfig> {
        self.addons.get(id)
    }

    pub fn tier_ids(&self) -> impl Iterator<Item = &str> {
        self.tiers.keys().map(String::as_str)
    }

    pub fn addon_ids(&self) -> impl Iterator<Item = &str> {
        self.addons.keys().map(String::as_str)
    }

    pub fn tiers(&self) -> &BTreeMap<String, TierConfig> {
        &self.tiers
    }

    pub fn addons(&self) -> &BTreeMap<String, AddonConfig> {
        &self.addons
    }

    /// Inheritance chain for `id`, root ancestor first, `id` itself last.
    ///
    /// A parent missing from the catalog ends the chain. An unknown `id`
    /// yields an empty chain. Revisiting a tier is a cycle.
    pub fn tier_chain<'a>(
        &'a self,
        id: &'a str,
    ) -> Result<Vec<(&'a str, &'a TierConfig)>, CatalogError> {
        let mut chain: Vec<(&str, &TierConfig)> = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = id;

        while let Some((key, tier)) = self.tiers.get_key_value(current) {
            if !visited.insert(key.as_str()) {
                let mut path: Vec<String> = chain.iter().map(|(k, _)| k.to_string()).collect();
                path.push(key.clone());
                return Err(CatalogError::InheritanceCycle { path });
            }
            chain.push((key.as_str(), tier));
            match tier.inherits_from.as_deref() {
                Some(parent) => current = parent,
                None => break,
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// `(tier, parent)` pairs whose parent is not defined. These truncate
    /// the chain silently at resolution time, so loaders surface them.
    pub fn dangling_parents(&self) -> Vec<(&str, &str)> {
        self.tiers
            .iter()
            .filter_map(|(id, tier)| {
                let parent = tier.inherits_from.as_deref()?;
                (!self.tiers.contains_key(parent)).then_some((id.as_str(), parent))
            })
            .collect()
    }
}

fn check_limits(owner: &str, limits: &BTreeMap<String, i64>) -> Result<(), CatalogError> {
    for (key, &value) in limits {
        if value < 0 && value != UNLIMITED {
            return Err(CatalogError::InvalidLimit {
                owner: owner.to_string(),
                key: key.clone(),
                value,
            });
        }
    }
    Ok(())
}

/// Shared, atomically replaceable catalog.
///
/// Readers take an `Arc` snapshot and keep it for the whole computation;
/// `replace` swaps in a new catalog without touching snapshots in flight.
#[derive(Clone, Debug, Default)]
pub struct SharedCatalog {
    current: Arc<RwLock<Arc<Catalog>>>,
}

impl SharedCatalog {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Install `catalog` and return the one it replaced.
    pub fn replace(&self, catalog: Catalog) -> Arc<Catalog> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(catalog))
    }
}
