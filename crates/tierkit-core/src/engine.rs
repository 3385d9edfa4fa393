//! Entitlement resolution: tier chain, then add-ons, then per-account overrides.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::catalog::{Catalog, CatalogError, SharedCatalog};
use crate::model::{ComputedEntitlements, FeatureValue, Subscription, UNLIMITED};
use crate::timestamp::now_iso8601;

/// What to do when a subscription's own tier is not in the catalog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingTierPolicy {
    /// Resolve to empty entitlements (nothing contributed by any tier).
    #[default]
    Empty,
    /// Refuse to resolve with [`ResolveError::UnknownTier`].
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("account '{account_id}' references unknown tier '{tier}'")]
    UnknownTier { account_id: String, tier: String },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Entry point for entitlement computation against a shared catalog.
#[derive(Clone, Debug, Default)]
pub struct EntitlementEngine {
    catalog: SharedCatalog,
    policy: MissingTierPolicy,
}

impl EntitlementEngine {
    pub fn new(catalog: SharedCatalog) -> Self {
        Self {
            catalog,
            policy: MissingTierPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MissingTierPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> MissingTierPolicy {
        self.policy
    }

    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    /// Resolve `subscription` against a single catalog snapshot.
    pub fn compute_entitlements(
        &self,
        subscription: &Subscription,
    ) -> Result<ComputedEntitlements, ResolveError> {
        let snapshot = self.catalog.snapshot();
        resolve(&snapshot, subscription, self.policy)
    }
}

/// Working state while layering tiers, add-ons and overrides.
#[derive(Default)]
struct Accumulator {
    features: BTreeMap<String, FeatureValue>,
    limits: BTreeMap<String, i64>,
    permissions: Vec<String>,
}

impl Accumulator {
    fn overwrite_features(&mut self, features: &BTreeMap<String, FeatureValue>) {
        for (key, value) in features {
            self.features.insert(key.clone(), value.clone());
        }
    }

    fn overwrite_limits(&mut self, limits: &BTreeMap<String, i64>) {
        for (key, &value) in limits {
            self.limits.insert(key.clone(), value);
        }
    }

    fn add_limits(&mut self, limits: &BTreeMap<String, i64>) {
        for (key, &value) in limits {
            self.limits
                .entry(key.clone())
                .and_modify(|existing| *existing = compose_limit(*existing, value))
                .or_insert(value);
        }
    }

    fn grant(&mut self, permissions: &BTreeSet<String>) {
        self.permissions.extend(permissions.iter().cloned());
    }
}

/// Additive limit composition. Unlimited absorbs; sums saturate.
pub fn compose_limit(existing: i64, added: i64) -> i64 {
    if existing == UNLIMITED || added == UNLIMITED {
        UNLIMITED
    } else {
        existing.saturating_add(added)
    }
}

/// Resolve `subscription` into entitlements using `catalog` as it is now.
///
/// Order of application:
/// 1. tier chain, root ancestor first (descendants overwrite ancestors),
/// 2. add-ons in lexicographic id order (features overwrite, limits add),
/// 3. `custom_features`, which always win.
///
/// Unknown add-ons contribute nothing. An unknown subscription tier yields
/// empty tier contributions unless `policy` is [`MissingTierPolicy::Reject`].
pub fn resolve(
    catalog: &Catalog,
    subscription: &Subscription,
    policy: MissingTierPolicy,
) -> Result<ComputedEntitlements, ResolveError> {
    if policy == MissingTierPolicy::Reject && catalog.tier(&subscription.tier).is_none() {
        return Err(ResolveError::UnknownTier {
            account_id: subscription.account_id.clone(),
            tier: subscription.tier.clone(),
        });
    }

    let mut acc = Accumulator::default();

    for (_, tier) in catalog.tier_chain(&subscription.tier)? {
        acc.overwrite_features(&tier.features);
        acc.overwrite_limits(&tier.limits);
        acc.grant(&tier.permissions);
    }

    // BTreeSet iteration is sorted, which fixes the tie-break between
    // add-ons that set the same feature: the greatest id wins.
    for addon in subscription
        .addons
        .iter()
        .filter_map(|id| catalog.addon(id))
    {
        acc.overwrite_features(&addon.features);
        acc.add_limits(&addon.limits);
        acc.grant(&addon.permissions);
    }

    acc.overwrite_features(&subscription.custom_features);

    Ok(ComputedEntitlements {
        account_id: subscription.account_id.clone(),
        tier: subscription.tier.clone(),
        addons: subscription.addons.clone(),
        features: acc.features,
        limits: acc.limits,
        permissions: acc.permissions.into_iter().collect(),
        computed_at: now_iso8601(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddonConfig, TierConfig};

    fn catalog(tiers: Vec<(&str, TierConfig)>, addons: Vec<(&str, AddonConfig)>) -> Catalog {
        Catalog::new(
            tiers
                .into_iter()
                .map(|(id, t)| (id.to_string(), t))
                .collect(),
            addons
                .into_iter()
                .map(|(id, a)| (id.to_string(), a))
                .collect(),
        )
        .unwrap()
    }

    fn resolve_default(catalog: &Catalog, sub: &Subscription) -> ComputedEntitlements {
        resolve(catalog, sub, MissingTierPolicy::Empty).unwrap()
    }

    #[test]
    fn test_child_tier_overrides_parent() {
        let cat = catalog(
            vec![
                (
                    "a",
                    TierConfig::new("A").feature("x", "parent").feature("y", 1),
                ),
                ("b", TierConfig::new("B").inherits("a").feature("x", "child")),
            ],
            vec![],
        );

        let ent = resolve_default(&cat, &Subscription::new("acct", "b"));
        assert_eq!(ent.check_feature("x"), Some(&FeatureValue::from("child")));
        assert_eq!(ent.check_feature("y"), Some(&FeatureValue::Int(1)));
    }

    #[test]
    fn test_child_limit_overwrites_not_adds() {
        let cat = catalog(
            vec![
                ("free", TierConfig::new("Free").limit("calls", 100)),
                ("pro", TierConfig::new("Pro").inherits("free").limit("calls", 1000)),
            ],
            vec![],
        );

        let ent = resolve_default(&cat, &Subscription::new("acct", "pro"));
        assert_eq!(ent.check_limit("calls"), 1000);
    }

    #[test]
    fn test_missing_ancestor_truncates() {
        let cat = catalog(
            vec![(
                "b",
                TierConfig::new("B")
                    .inherits("ghost")
                    .feature("x", true)
                    .limit("calls", 5)
                    .permission("read"),
            )],
            vec![],
        );

        let ent = resolve(&cat, &Subscription::new("acct", "b"), MissingTierPolicy::Reject).unwrap();
        assert_eq!(ent.features.len(), 1);
        assert_eq!(ent.limits, BTreeMap::from([("calls".to_string(), 5)]));
        assert_eq!(ent.permissions, BTreeSet::from(["read".to_string()]));
    }

    #[test]
    fn test_unknown_tier_empty_by_default() {
        let cat = catalog(vec![("free", TierConfig::new("Free").feature("x", true))], vec![]);
        let ent = resolve_default(&cat, &Subscription::new("acct", "typo"));

        assert!(ent.features.is_empty());
        assert!(ent.limits.is_empty());
        assert!(ent.permissions.is_empty());
        assert_eq!(ent.tier, "typo");
    }

    #[test]
    fn test_unknown_tier_still_gets_addons_and_overrides() {
        let cat = catalog(
            vec![],
            vec![("pack", AddonConfig::new("Pack").limit("calls", 50))],
        );
        let sub = Subscription::new("acct", "typo")
            .with_addon("pack")
            .with_custom_feature("beta", true);

        let ent = resolve_default(&cat, &sub);
        assert_eq!(ent.check_limit("calls"), 50);
        assert_eq!(ent.check_feature("beta"), Some(&FeatureValue::Bool(true)));
    }

    #[test]
    fn test_unknown_tier_rejected_in_strict_mode() {
        let cat = Catalog::empty();
        let err = resolve(&cat, &Subscription::new("acct", "typo"), MissingTierPolicy::Reject)
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownTier {
                account_id: "acct".to_string(),
                tier: "typo".to_string(),
            }
        );
    }

    #[test]
    fn test_addon_limits_add() {
        let cat = catalog(
            vec![("pro", TierConfig::new("Pro").limit("api_calls_per_day", 100))],
            vec![("boost", AddonConfig::new("Boost").limit("api_calls_per_day", 50))],
        );
        let ent = resolve_default(&cat, &Subscription::new("acct", "pro").with_addon("boost"));
        assert_eq!(ent.check_limit("api_calls_per_day"), 150);
    }

    #[test]
    fn test_addon_introduces_new_limit() {
        let cat = catalog(
            vec![("pro", TierConfig::new("Pro"))],
            vec![("storage", AddonConfig::new("Storage").limit("storage_gb", 20))],
        );
        let ent = resolve_default(&cat, &Subscription::new("acct", "pro").with_addon("storage"));
        assert_eq!(ent.check_limit("storage_gb"), 20);
    }

    #[test]
    fn test_unlimited_absorbs_both_ways() {
        let cat = catalog(
            vec![
                ("capped", TierConfig::new("Capped").limit("x", 100)),
                ("open", TierConfig::new("Open").limit("x", UNLIMITED)),
            ],
            vec![
                ("unlimited", AddonConfig::new("Unlimited").limit("x", UNLIMITED)),
                ("fifty", AddonConfig::new("Fifty").limit("x", 50)),
            ],
        );

        let ent = resolve_default(&cat, &Subscription::new("a", "capped").with_addon("unlimited"));
        assert_eq!(ent.check_limit("x"), UNLIMITED);

        let ent = resolve_default(&cat, &Subscription::new("b", "open").with_addon("fifty"));
        assert_eq!(ent.check_limit("x"), UNLIMITED);
    }

    #[test]
    fn test_addon_feature_overrides_tier() {
        let cat = catalog(
            vec![("pro", TierConfig::new("Pro").feature("agents", false))],
            vec![("agent_pack", AddonConfig::new("Agents").feature("agents", true))],
        );
        let ent = resolve_default(&cat, &Subscription::new("acct", "pro").with_addon("agent_pack"));
        assert_eq!(ent.check_feature("agents"), Some(&FeatureValue::Bool(true)));
    }

    #[test]
    fn test_addon_feature_conflict_is_deterministic() {
        let cat = catalog(
            vec![("pro", TierConfig::new("Pro"))],
            vec![
                ("alpha", AddonConfig::new("Alpha").feature("region", "us")),
                ("beta", AddonConfig::new("Beta").feature("region", "eu")),
            ],
        );
        let forward = Subscription::new("acct", "pro").with_addon("alpha").with_addon("beta");
        let backward = Subscription::new("acct", "pro").with_addon("beta").with_addon("alpha");

        let a = resolve_default(&cat, &forward);
        let b = resolve_default(&cat, &backward);
        assert_eq!(a.check_feature("region"), Some(&FeatureValue::from("eu")));
        assert_eq!(a.features, b.features);
    }

    #[test]
    fn test_unknown_addon_ignored() {
        let cat = catalog(vec![("pro", TierConfig::new("Pro").limit("calls", 10))], vec![]);
        let ent = resolve_default(&cat, &Subscription::new("acct", "pro").with_addon("retired"));
        assert_eq!(ent.check_limit("calls"), 10);
        assert!(ent.addons.contains("retired"));
    }

    #[test]
    fn test_custom_override_wins() {
        let cat = catalog(
            vec![("pro", TierConfig::new("Pro").feature("beta", false))],
            vec![("labs", AddonConfig::new("Labs").feature("beta", false))],
        );
        let sub = Subscription::new("acct", "pro")
            .with_addon("labs")
            .with_custom_feature("beta", true);
        let ent = resolve_default(&cat, &sub);
        assert_eq!(ent.check_feature("beta"), Some(&FeatureValue::Bool(true)));
    }

    #[test]
    fn test_permissions_union_dedup() {
        let cat = catalog(
            vec![("pro", TierConfig::new("Pro").permission("read"))],
            vec![(
                "writer",
                AddonConfig::new("Writer").permission("read").permission("write"),
            )],
        );
        let ent = resolve_default(&cat, &Subscription::new("acct", "pro").with_addon("writer"));
        assert_eq!(
            ent.permissions,
            BTreeSet::from(["read".to_string(), "write".to_string()])
        );
    }

    #[test]
    fn test_ancestor_permissions_inherited() {
        let cat = catalog(
            vec![
                ("free", TierConfig::new("Free").permission("read")),
                ("pro", TierConfig::new("Pro").inherits("free").permission("export")),
            ],
            vec![],
        );
        let ent = resolve_default(&cat, &Subscription::new("acct", "pro"));
        assert!(ent.check_permission("read"));
        assert!(ent.check_permission("export"));
    }

    #[test]
    fn test_compose_limit_saturates() {
        assert_eq!(compose_limit(i64::MAX, 1), i64::MAX);
        assert_eq!(compose_limit(3, 4), 7);
        assert_eq!(compose_limit(0, UNLIMITED), UNLIMITED);
    }

    #[test]
    fn test_engine_sees_replaced_catalog() {
        let shared = SharedCatalog::new(catalog(
            vec![("pro", TierConfig::new("Pro").limit("calls", 10))],
            vec![],
        ));
        let engine = EntitlementEngine::new(shared.clone());
        let sub = Subscription::new("acct", "pro");

        assert_eq!(engine.compute_entitlements(&sub).unwrap().check_limit("calls"), 10);

        shared.replace(catalog(
            vec![("pro", TierConfig::new("Pro").limit("calls", 20))],
            vec![],
        ));
        assert_eq!(engine.compute_entitlements(&sub).unwrap().check_limit("calls"), 20);
    }

    #[test]
    fn test_engine_policy() {
        let engine = EntitlementEngine::new(SharedCatalog::default())
            .with_policy(MissingTierPolicy::Reject);
        assert_eq!(engine.policy(), MissingTierPolicy::Reject);
        assert!(engine
            .compute_entitlements(&Subscription::new("acct", "free"))
            .is_err());
    }
}
