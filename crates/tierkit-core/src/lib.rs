//! Subscription entitlement engine.
//!
//! Resolves an account's effective features, limits and permissions from a
//! tier (with single inheritance), purchased add-ons, and per-account
//! overrides, then answers yes/no questions through stateless guards.
//!
//! Zero I/O: catalogs and subscriptions are handed in, never loaded here.

pub mod catalog;
pub mod engine;
pub mod gate;
pub mod model;
pub mod timestamp;

pub use catalog::{Catalog, CatalogError, SharedCatalog};
pub use engine::{EntitlementEngine, MissingTierPolicy, ResolveError, compose_limit, resolve};
pub use gate::{
    GateError, Requirement, enforce_limit, guarded, require_feature, require_feature_enabled,
    require_permission,
};
pub use model::{
    AddonConfig, ComputedEntitlements, FeatureValue, Subscription, TierConfig, UNLIMITED,
};
pub use timestamp::{format_unix, now_iso8601, unix_now};
