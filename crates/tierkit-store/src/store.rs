use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use tierkit_core::{FeatureValue, Subscription, now_iso8601};

use crate::error::{Result, StoreError};
use crate::schema;

/// SQLite-backed subscription records, keyed by account id.
///
/// The store never consults the catalog: whether a tier or add-on id exists
/// is the caller's concern.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // --- Create / delete ---

    pub fn create_subscription(&self, sub: &Subscription) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE account_id = ?1)",
            [&sub.account_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::InvalidData(format!(
                "subscription already exists for account '{}'",
                sub.account_id
            )));
        }

        let now = now_iso8601();
        let created_at = non_empty_or(&sub.created_at, &now);
        let updated_at = non_empty_or(&sub.updated_at, created_at);
        tx.execute(
            "INSERT INTO subscriptions (account_id, tier, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![sub.account_id, sub.tier, created_at, updated_at],
        )?;

        for addon in &sub.addons {
            tx.execute(
                "INSERT INTO subscription_addons (account_id, addon_id) VALUES (?1, ?2)",
                params![sub.account_id, addon],
            )?;
        }

        for (feature, value) in &sub.custom_features {
            tx.execute(
                "INSERT INTO custom_features (account_id, feature, value) VALUES (?1, ?2, ?3)",
                params![sub.account_id, feature, encode_value(value)?],
            )?;
        }

        tx.commit()?;
        tracing::debug!(account = %sub.account_id, tier = %sub.tier, "created subscription");
        Ok(())
    }

    /// Returns `false` when there was nothing to delete.
    pub fn delete_subscription(&self, account_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM subscriptions WHERE account_id = ?1",
            [account_id],
        )?;
        Ok(rows > 0)
    }

    // --- Load ---

    pub fn get_subscription(&self, account_id: &str) -> Result<Option<Subscription>> {
        let row: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT tier, created_at, updated_at FROM subscriptions WHERE account_id = ?1",
                [account_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((tier, created_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(Subscription {
            account_id: account_id.to_string(),
            tier,
            addons: self.load_addons(account_id)?,
            custom_features: self.load_custom_features(account_id)?,
            created_at,
            updated_at,
        }))
    }

    fn load_addons(&self, account_id: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT addon_id FROM subscription_addons WHERE account_id = ?1")?;
        let addons = stmt
            .query_map([account_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(addons)
    }

    fn load_custom_features(&self, account_id: &str) -> Result<BTreeMap<String, FeatureValue>> {
        let mut stmt = self
            .conn
            .prepare("SELECT feature, value FROM custom_features WHERE account_id = ?1")?;
        let rows: Vec<(String, String)> = stmt
            .query_map([account_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(feature, raw)| {
                let value = decode_value(&raw).map_err(|e| {
                    StoreError::InvalidData(format!(
                        "custom feature '{feature}' on '{account_id}': {e}"
                    ))
                })?;
                Ok((feature, value))
            })
            .collect()
    }

    pub fn list_accounts(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT account_id FROM subscriptions ORDER BY account_id")?;
        let accounts = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(accounts)
    }

    /// Number of subscriptions per tier id, including ids the current
    /// catalog may no longer define.
    pub fn tier_counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tier, COUNT(*) FROM subscriptions GROUP BY tier")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(counts)
    }

    // --- Targeted updates ---

    pub fn set_tier(&self, account_id: &str, tier: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE subscriptions SET tier = ?1, updated_at = ?2 WHERE account_id = ?3",
            params![tier, now_iso8601(), account_id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(account_id.to_string()));
        }
        Ok(())
    }

    /// Returns `false` if the account already held the add-on.
    pub fn add_addon(&self, account_id: &str, addon_id: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        touch_on(&tx, account_id)?;
        let rows = tx.execute(
            "INSERT OR IGNORE INTO subscription_addons (account_id, addon_id) VALUES (?1, ?2)",
            params![account_id, addon_id],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }

    /// Returns `false` if the account did not hold the add-on.
    pub fn remove_addon(&self, account_id: &str, addon_id: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        touch_on(&tx, account_id)?;
        let rows = tx.execute(
            "DELETE FROM subscription_addons WHERE account_id = ?1 AND addon_id = ?2",
            params![account_id, addon_id],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn set_custom_feature(
        &self,
        account_id: &str,
        feature: &str,
        value: &FeatureValue,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        touch_on(&tx, account_id)?;
        tx.execute(
            "INSERT OR REPLACE INTO custom_features (account_id, feature, value) VALUES (?1, ?2, ?3)",
            params![account_id, feature, encode_value(value)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns `false` if no override was set for `feature`.
    pub fn unset_custom_feature(&self, account_id: &str, feature: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        touch_on(&tx, account_id)?;
        let rows = tx.execute(
            "DELETE FROM custom_features WHERE account_id = ?1 AND feature = ?2",
            params![account_id, feature],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }
}

fn touch_on(conn: &Connection, account_id: &str) -> Result<()> {
    let rows = conn.execute(
        "UPDATE subscriptions SET updated_at = ?1 WHERE account_id = ?2",
        params![now_iso8601(), account_id],
    )?;
    if rows == 0 {
        return Err(StoreError::NotFound(account_id.to_string()));
    }
    Ok(())
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}

fn encode_value(value: &FeatureValue) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::InvalidData(format!("unencodable feature value: {e}")))
}

fn decode_value(raw: &str) -> serde_json::Result<FeatureValue> {
    serde_json::from_str(raw)
}
