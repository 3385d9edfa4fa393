//! Guards a request layer applies before running a protected operation.
//!
//! Every guard takes `Option<&ComputedEntitlements>`: `None` means the caller
//! has no resolvable subscription and fails as `Unauthenticated`, never as
//! `Forbidden`.

use thiserror::Error;

use crate::model::{ComputedEntitlements, FeatureValue};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateError {
    #[error("unauthenticated: no entitlements resolved for caller")]
    Unauthenticated,
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
    #[error("quota exceeded: {usage}/{allowed} for {limit}")]
    QuotaExceeded {
        limit: String,
        usage: u64,
        allowed: i64,
    },
}

impl GateError {
    /// Stable machine-readable kind, for logs and transport mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::Unauthenticated => "unauthenticated",
            GateError::Forbidden { .. } => "forbidden",
            GateError::QuotaExceeded { .. } => "quota_exceeded",
        }
    }
}

fn authenticated(
    entitlements: Option<&ComputedEntitlements>,
) -> Result<&ComputedEntitlements, GateError> {
    entitlements.ok_or(GateError::Unauthenticated)
}

pub fn require_permission(
    entitlements: Option<&ComputedEntitlements>,
    permission: &str,
) -> Result<(), GateError> {
    let ent = authenticated(entitlements)?;
    if ent.check_permission(permission) {
        Ok(())
    } else {
        Err(GateError::Forbidden {
            reason: format!("missing permission '{permission}'"),
        })
    }
}

/// Passes only when the feature resolves to exactly `expected`.
pub fn require_feature(
    entitlements: Option<&ComputedEntitlements>,
    feature: &str,
    expected: &FeatureValue,
) -> Result<(), GateError> {
    let ent = authenticated(entitlements)?;
    match ent.check_feature(feature) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(GateError::Forbidden {
            reason: format!("feature '{feature}' is {actual}, requires {expected}"),
        }),
        None => Err(GateError::Forbidden {
            reason: format!("feature '{feature}' is not available"),
        }),
    }
}

pub fn require_feature_enabled(
    entitlements: Option<&ComputedEntitlements>,
    feature: &str,
) -> Result<(), GateError> {
    require_feature(entitlements, feature, &FeatureValue::Bool(true))
}

pub fn enforce_limit(
    entitlements: Option<&ComputedEntitlements>,
    limit: &str,
    current_usage: u64,
) -> Result<(), GateError> {
    let ent = authenticated(entitlements)?;
    if ent.is_within_limit(limit, current_usage) {
        Ok(())
    } else {
        Err(GateError::QuotaExceeded {
            limit: limit.to_string(),
            usage: current_usage,
            allowed: ent.check_limit(limit),
        })
    }
}

/// A single precondition on a protected operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    Permission(String),
    Feature { key: String, expected: FeatureValue },
    Limit { key: String, usage: u64 },
}

impl Requirement {
    pub fn permission(permission: &str) -> Self {
        Requirement::Permission(permission.to_string())
    }

    pub fn feature_enabled(key: &str) -> Self {
        Requirement::Feature {
            key: key.to_string(),
            expected: FeatureValue::Bool(true),
        }
    }

    pub fn limit(key: &str, usage: u64) -> Self {
        Requirement::Limit {
            key: key.to_string(),
            usage,
        }
    }

    pub fn check(&self, entitlements: Option<&ComputedEntitlements>) -> Result<(), GateError> {
        match self {
            Requirement::Permission(p) => require_permission(entitlements, p),
            Requirement::Feature { key, expected } => require_feature(entitlements, key, expected),
            Requirement::Limit { key, usage } => enforce_limit(entitlements, key, *usage),
        }
    }
}

/// Run `op` only if every requirement passes; otherwise return the first
/// failure without calling `op`.
pub fn guarded<T>(
    entitlements: Option<&ComputedEntitlements>,
    requirements: &[Requirement],
    op: impl FnOnce(&ComputedEntitlements) -> T,
) -> Result<T, GateError> {
    let ent = authenticated(entitlements)?;
    for requirement in requirements {
        requirement.check(Some(ent))?;
    }
    Ok(op(ent))
}
