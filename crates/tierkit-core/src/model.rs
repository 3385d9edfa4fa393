use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::timestamp::now_iso8601;

/// Limit value meaning "no cap". Absorbing under add-on composition.
pub const UNLIMITED: i64 = -1;

/// The setting a tier, add-on or override assigns to a feature key.
///
/// Serialized untagged, so catalogs and JSON output carry bare values:
/// `beta = true`, `max_seats = 5`, `region = "eu"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Bool(b) => write!(f, "{b}"),
            FeatureValue::Int(n) => write!(f, "{n}"),
            FeatureValue::Float(x) => write!(f, "{x}"),
            FeatureValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for FeatureValue {
    type Err = std::convert::Infallible;

    /// `true`/`false` → Bool, integers → Int, other numerics → Float,
    /// anything else is kept as Text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(b) = trimmed.parse::<bool>() {
            return Ok(FeatureValue::Bool(b));
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            return Ok(FeatureValue::Int(n));
        }
        if let Ok(x) = trimmed.parse::<f64>()
            && x.is_finite()
        {
            return Ok(FeatureValue::Float(x));
        }
        Ok(FeatureValue::Text(trimmed.to_string()))
    }
}

impl From<bool> for FeatureValue {
    fn from(b: bool) -> Self {
        FeatureValue::Bool(b)
    }
}

impl From<i64> for FeatureValue {
    fn from(n: i64) -> Self {
        FeatureValue::Int(n)
    }
}

impl From<&str> for FeatureValue {
    fn from(s: &str) -> Self {
        FeatureValue::Text(s.to_string())
    }
}

/// Static definition of a subscription tier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits_from: Option<String>,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureValue>,
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl TierConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn inherits(mut self, parent: &str) -> Self {
        self.inherits_from = Some(parent.to_string());
        self
    }

    pub fn feature(mut self, key: &str, value: impl Into<FeatureValue>) -> Self {
        self.features.insert(key.to_string(), value.into());
        self
    }

    pub fn limit(mut self, key: &str, value: i64) -> Self {
        self.limits.insert(key.to_string(), value);
        self
    }

    pub fn permission(mut self, permission: &str) -> Self {
        self.permissions.insert(permission.to_string());
        self
    }
}

/// Static definition of a purchasable add-on. Add-ons never inherit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddonConfig {
    pub name: String,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureValue>,
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl AddonConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn feature(mut self, key: &str, value: impl Into<FeatureValue>) -> Self {
        self.features.insert(key.to_string(), value.into());
        self
    }

    pub fn limit(mut self, key: &str, value: i64) -> Self {
        self.limits.insert(key.to_string(), value);
        self
    }

    pub fn permission(mut self, permission: &str) -> Self {
        self.permissions.insert(permission.to_string());
        self
    }
}

/// One account's purchased state. Read-only input to the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub account_id: String,
    pub tier: String,
    /// Ordered set: duplicates collapse and iteration is lexicographic.
    #[serde(default)]
    pub addons: BTreeSet<String>,
    #[serde(default)]
    pub custom_features: BTreeMap<String, FeatureValue>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Subscription {
    pub fn new(account_id: &str, tier: &str) -> Self {
        let now = now_iso8601();
        Self {
            account_id: account_id.to_string(),
            tier: tier.to_string(),
            addons: BTreeSet::new(),
            custom_features: BTreeMap::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn with_addon(mut self, addon: &str) -> Self {
        self.addons.insert(addon.to_string());
        self
    }

    pub fn with_custom_feature(mut self, key: &str, value: impl Into<FeatureValue>) -> Self {
        self.custom_features.insert(key.to_string(), value.into());
        self
    }
}

/// Point-in-time answer to "what can this account do right now".
///
/// Built fresh by every resolution and never mutated afterwards. Any change
/// to the catalog or to the subscription invalidates it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputedEntitlements {
    pub account_id: String,
    pub tier: String,
    pub addons: BTreeSet<String>,
    pub features: BTreeMap<String, FeatureValue>,
    pub limits: BTreeMap<String, i64>,
    pub permissions: BTreeSet<String>,
    pub computed_at: String,
}

impl ComputedEntitlements {
    pub fn check_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// `None` means the feature is not configured at all, which is distinct
    /// from being configured to `false`.
    pub fn check_feature(&self, feature: &str) -> Option<&FeatureValue> {
        self.features.get(feature)
    }

    /// Absent limits mean zero allowance.
    pub fn check_limit(&self, limit: &str) -> i64 {
        self.limits.get(limit).copied().unwrap_or(0)
    }

    /// Usage equal to the limit is already at capacity.
    pub fn is_within_limit(&self, limit: &str, current_usage: u64) -> bool {
        match self.check_limit(limit) {
            UNLIMITED => true,
            allowed if allowed < 0 => false,
            allowed => current_usage < allowed as u64,
        }
    }

    /// Units left before the limit is reached; `None` when unlimited.
    pub fn remaining(&self, limit: &str, current_usage: u64) -> Option<u64> {
        match self.check_limit(limit) {
            UNLIMITED => None,
            allowed => Some((allowed.max(0) as u64).saturating_sub(current_usage)),
        }
    }
}
