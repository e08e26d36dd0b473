//! API-key authentication and key administration
//!
//! Keys are presented as `Authorization: Bearer <key>` or `X-API-Key`. The
//! full key is `keyId.secret`: the public prefix indexes the persistent
//! store, the secret is hashed with SHA-256 and compared in constant time.
//! Only the hash ever touches disk.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::adapters::hex_string;
use crate::error::{RouterError, RouterResult};
use crate::limiter::{TierLimits, UsageSnapshot};
use crate::store::PersistentMap;
use crate::types::{AuthContext, Tier};

/// Public key-id prefix
const KEY_ID_PREFIX: &str = "sb";

/// Persisted API-key record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    /// SHA-256 hex of the secret half
    pub hashed_secret: String,
    pub customer: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Per-key limit overrides; tier defaults apply when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quotas: Option<TierLimits>,
    #[serde(default)]
    pub usage_counters: UsageSnapshot,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
}

impl ApiKeyRecord {
    /// Effective limits: per-key override or tier defaults
    pub fn limits(&self) -> TierLimits {
        self.quotas.unwrap_or_else(|| TierLimits::for_tier(self.tier))
    }
}

fn hash_secret(secret: &str) -> String {
    hex_string(&Sha256::digest(secret.as_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    ring::constant_time::verify_slices_are_equal(a.as_bytes(), b.as_bytes()).is_ok()
}

/// Manages API-key records over the persistent map
pub struct ApiKeyManager {
    store: PersistentMap,
}

impl ApiKeyManager {
    pub fn new(store: PersistentMap) -> Self {
        Self { store }
    }

    /// Seed keys from the `API_KEYS` environment list. Each entry is either
    /// a full `keyId.secret` pair (re-derives the stored hash) or a bare
    /// secret (key id derived from its hash). Seeded keys land in the basic
    /// tier.
    pub async fn seed(&self, keys: &[String]) -> RouterResult<()> {
        for raw in keys {
            let (key_id, secret) = match raw.split_once('.') {
                Some((id, secret)) => (id.to_string(), secret.to_string()),
                None => {
                    let digest = hash_secret(raw);
                    (format!("{}-{}", KEY_ID_PREFIX, &digest[..12]), raw.clone())
                }
            };
            if self.store.get(&key_id).await.is_some() {
                continue;
            }
            let record = ApiKeyRecord {
                key_id: key_id.clone(),
                hashed_secret: hash_secret(&secret),
                customer: "seeded".to_string(),
                tier: Tier::Basic,
                created_at: Utc::now(),
                last_used_at: None,
                quotas: None,
                usage_counters: UsageSnapshot::default(),
                disabled: false,
                metadata: HashMap::new(),
                user_id: None,
                group_id: None,
            };
            self.put(&record).await?;
            info!("Seeded API key {}", key_id);
        }
        Ok(())
    }

    /// Create a new key; the full `keyId.secret` string is returned exactly
    /// once and never stored.
    pub async fn create_key(
        &self,
        customer: impl Into<String>,
        tier: Tier,
        user_id: Option<String>,
        group_id: Option<String>,
    ) -> RouterResult<(ApiKeyRecord, String)> {
        let mut id_bytes = [0u8; 6];
        let mut secret_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        rand::thread_rng().fill_bytes(&mut secret_bytes);

        let key_id = format!("{}-{}", KEY_ID_PREFIX, hex_string(&id_bytes));
        let secret = general_purpose::URL_SAFE_NO_PAD.encode(secret_bytes);

        let record = ApiKeyRecord {
            key_id: key_id.clone(),
            hashed_secret: hash_secret(&secret),
            customer: customer.into(),
            tier,
            created_at: Utc::now(),
            last_used_at: None,
            quotas: None,
            usage_counters: UsageSnapshot::default(),
            disabled: false,
            metadata: HashMap::new(),
            user_id,
            group_id,
        };
        self.put(&record).await?;
        Ok((record, format!("{}.{}", key_id, secret)))
    }

    /// Validate a presented credential and produce the auth context
    pub async fn authenticate(&self, presented: &str) -> RouterResult<AuthContext> {
        let presented = presented
            .strip_prefix("Bearer ")
            .unwrap_or(presented)
            .trim();
        let (key_id, secret) = presented
            .split_once('.')
            .ok_or_else(|| RouterError::Auth("malformed API key".into()))?;

        let record = self
            .get(key_id)
            .await?
            .ok_or_else(|| RouterError::Auth(format!("unknown API key {}", key_id)))?;

        if !constant_time_eq(&record.hashed_secret, &hash_secret(secret)) {
            warn!("Secret mismatch for key {}", key_id);
            return Err(RouterError::Auth(format!("invalid secret for {}", key_id)));
        }
        if record.disabled {
            return Err(RouterError::Auth(format!("API key {} is disabled", key_id)));
        }

        Ok(AuthContext {
            key_id: record.key_id.clone(),
            tier: record.tier,
            user_id: record.user_id.clone(),
            group_id: record.group_id.clone(),
        })
    }

    pub async fn get(&self, key_id: &str) -> RouterResult<Option<ApiKeyRecord>> {
        match self.store.get(key_id).await {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RouterError::Internal(format!("corrupt key record: {}", e))),
            None => Ok(None),
        }
    }

    pub async fn disable_key(&self, key_id: &str) -> RouterResult<()> {
        let mut record = self
            .get(key_id)
            .await?
            .ok_or_else(|| RouterError::NotFound(format!("key {}", key_id)))?;
        record.disabled = true;
        self.put(&record).await
    }

    pub async fn delete_key(&self, key_id: &str) -> RouterResult<bool> {
        Ok(self.store.delete(key_id).await)
    }

    pub async fn list_keys(&self) -> RouterResult<Vec<ApiKeyRecord>> {
        let mut records = Vec::new();
        for value in self.store.entries().await.into_values() {
            if let Ok(record) = serde_json::from_value(value) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Stamp last-use and fold in the live usage snapshot
    pub async fn touch(&self, key_id: &str, usage: UsageSnapshot) -> RouterResult<()> {
        if let Some(mut record) = self.get(key_id).await? {
            record.last_used_at = Some(Utc::now());
            record.usage_counters = usage;
            self.put(&record).await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> RouterResult<()> {
        self.store.close().await
    }

    async fn put(&self, record: &ApiKeyRecord) -> RouterResult<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| RouterError::Internal(format!("serialize key record: {}", e)))?;
        self.store.set(record.key_id.clone(), value).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> (tempfile::TempDir, ApiKeyManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentMap::open(dir.path().join("users.json"))
            .await
            .unwrap();
        (dir, ApiKeyManager::new(store))
    }

    #[tokio::test]
    async fn test_create_and_authenticate() {
        let (_dir, manager) = manager().await;
        let (record, full_key) = manager
            .create_key("acme", Tier::Pro, Some("u1".into()), None)
            .await
            .unwrap();

        let ctx = manager.authenticate(&full_key).await.unwrap();
        assert_eq!(ctx.key_id, record.key_id);
        assert_eq!(ctx.tier, Tier::Pro);
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_bearer_prefix_stripped() {
        let (_dir, manager) = manager().await;
        let (_, full_key) = manager
            .create_key("acme", Tier::Basic, None, None)
            .await
            .unwrap();
        let ctx = manager
            .authenticate(&format!("Bearer {}", full_key))
            .await
            .unwrap();
        assert_eq!(ctx.tier, Tier::Basic);
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let (_dir, manager) = manager().await;
        let (record, _) = manager
            .create_key("acme", Tier::Basic, None, None)
            .await
            .unwrap();
        let forged = format!("{}.not-the-secret", record.key_id);
        assert!(matches!(
            manager.authenticate(&forged).await,
            Err(RouterError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_key_rejected() {
        let (_dir, manager) = manager().await;
        let (record, full_key) = manager
            .create_key("acme", Tier::Basic, None, None)
            .await
            .unwrap();
        manager.disable_key(&record.key_id).await.unwrap();
        assert!(matches!(
            manager.authenticate(&full_key).await,
            Err(RouterError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_key_rejected() {
        let (_dir, manager) = manager().await;
        assert!(matches!(
            manager.authenticate("no-dot-in-here").await,
            Err(RouterError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_secret_never_stored_in_plaintext() {
        let (_dir, manager) = manager().await;
        let (record, full_key) = manager
            .create_key("acme", Tier::Basic, None, None)
            .await
            .unwrap();
        let secret = full_key.split_once('.').unwrap().1;
        let stored = manager.get(&record.key_id).await.unwrap().unwrap();
        assert_ne!(stored.hashed_secret, secret);
        assert_eq!(stored.hashed_secret.len(), 64);
    }

    #[tokio::test]
    async fn test_seed_from_env_list() {
        let (_dir, manager) = manager().await;
        manager
            .seed(&["plain-secret".to_string(), "sb-custom.supersecret".to_string()])
            .await
            .unwrap();

        let keys = manager.list_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        let ctx = manager.authenticate("sb-custom.supersecret").await.unwrap();
        assert_eq!(ctx.tier, Tier::Basic);
    }

    #[tokio::test]
    async fn test_delete_round_trip() {
        let (_dir, manager) = manager().await;
        let (record, _) = manager
            .create_key("acme", Tier::Basic, None, None)
            .await
            .unwrap();
        assert!(manager.delete_key(&record.key_id).await.unwrap());
        assert!(manager.get(&record.key_id).await.unwrap().is_none());
    }
}
