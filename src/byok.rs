//! BYOK: per-user and per-group provider credentials
//!
//! Secrets are sealed with AES-256-GCM under a process master key before
//! they touch disk; decryption happens in memory only. Resolution returns
//! the most specific credential: the user's own key, then the group's key
//! when the user is an allowed member, then the process-default from the
//! environment.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapters::ProviderFamily;
use crate::error::{RouterError, RouterResult};
use crate::store::PersistentMap;

/// Environment variable holding the base64 master key
pub const MASTER_KEY_ENV: &str = "SWITCHBOARD_MASTER_KEY";

/// Seals and opens BYOK secrets with the process master key
pub struct SecretSealer {
    key: LessSafeKey,
}

impl SecretSealer {
    /// 32-byte master key
    pub fn new(master_key: &[u8; 32]) -> Self {
        let unbound = UnboundKey::new(&AES_256_GCM, master_key).expect("AES-256 key length");
        Self {
            key: LessSafeKey::new(unbound),
        }
    }

    /// Load the master key from the environment, or generate an ephemeral
    /// one (secrets will not survive a restart).
    pub fn from_env() -> Self {
        if let Ok(raw) = std::env::var(MASTER_KEY_ENV) {
            if let Ok(bytes) = general_purpose::STANDARD.decode(raw.trim()) {
                if bytes.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&bytes);
                    return Self::new(&key);
                }
            }
            warn!("{} is set but not a base64 32-byte key", MASTER_KEY_ENV);
        }
        warn!("No master key configured; BYOK secrets will not survive restart");
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(&key)
    }

    /// Seal a plaintext secret: base64(nonce || ciphertext || tag)
    pub fn seal(&self, plaintext: &str) -> RouterResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buffer = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| RouterError::Internal("secret sealing failed".into()))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&buffer);
        Ok(general_purpose::STANDARD.encode(out))
    }

    pub fn open(&self, sealed: &str) -> RouterResult<String> {
        let raw = general_purpose::STANDARD
            .decode(sealed)
            .map_err(|_| RouterError::Internal("sealed secret is not base64".into()))?;
        if raw.len() < NONCE_LEN {
            return Err(RouterError::Internal("sealed secret too short".into()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| RouterError::Internal("bad nonce".into()))?;

        let mut buffer = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| RouterError::Internal("secret unsealing failed".into()))?;
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| RouterError::Internal("sealed secret was not UTF-8".into()))
    }
}

/// Who a BYOK record belongs to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ByokOwner {
    User {
        user_id: String,
    },
    Group {
        group_id: String,
        allowed_users: Vec<String>,
    },
}

/// Persisted BYOK record; the secret field is sealed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByokRecord {
    pub owner: ByokOwner,
    pub provider: ProviderFamily,
    pub encrypted_secret: String,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

fn user_key(user_id: &str, provider: ProviderFamily) -> String {
    format!("user:{}:{}", user_id, provider)
}

fn group_key(group_id: &str, provider: ProviderFamily) -> String {
    format!("group:{}:{}", group_id, provider)
}

/// Encrypted credential store with precedence-based resolution
pub struct ByokStore {
    store: PersistentMap,
    sealer: SecretSealer,
}

impl ByokStore {
    pub fn new(store: PersistentMap, sealer: SecretSealer) -> Self {
        Self { store, sealer }
    }

    pub async fn set_user_key(
        &self,
        user_id: &str,
        provider: ProviderFamily,
        secret: &str,
        name: &str,
    ) -> RouterResult<()> {
        let record = ByokRecord {
            owner: ByokOwner::User {
                user_id: user_id.to_string(),
            },
            provider,
            encrypted_secret: self.sealer.seal(secret)?,
            created_at: Utc::now(),
            last_validated_at: None,
            name: name.to_string(),
            description: String::new(),
        };
        self.put(user_key(user_id, provider), &record).await
    }

    pub async fn set_group_key(
        &self,
        group_id: &str,
        allowed_users: Vec<String>,
        provider: ProviderFamily,
        secret: &str,
        name: &str,
    ) -> RouterResult<()> {
        let record = ByokRecord {
            owner: ByokOwner::Group {
                group_id: group_id.to_string(),
                allowed_users,
            },
            provider,
            encrypted_secret: self.sealer.seal(secret)?,
            created_at: Utc::now(),
            last_validated_at: None,
            name: name.to_string(),
            description: String::new(),
        };
        self.put(group_key(group_id, provider), &record).await
    }

    pub async fn delete_user_key(&self, user_id: &str, provider: ProviderFamily) -> bool {
        self.store.delete(&user_key(user_id, provider)).await
    }

    pub async fn delete_group_key(&self, group_id: &str, provider: ProviderFamily) -> bool {
        self.store.delete(&group_key(group_id, provider)).await
    }

    /// Remove a user from a group's allowed list
    pub async fn remove_group_member(
        &self,
        group_id: &str,
        provider: ProviderFamily,
        user_id: &str,
    ) -> RouterResult<()> {
        let key = group_key(group_id, provider);
        if let Some(mut record) = self.fetch(&key).await? {
            if let ByokOwner::Group { allowed_users, .. } = &mut record.owner {
                allowed_users.retain(|u| u != user_id);
            }
            self.put(key, &record).await?;
        }
        Ok(())
    }

    /// Decrypted user key, if one exists
    pub async fn get_user_key(
        &self,
        user_id: &str,
        provider: ProviderFamily,
    ) -> RouterResult<Option<String>> {
        match self.fetch(&user_key(user_id, provider)).await? {
            Some(record) => Ok(Some(self.sealer.open(&record.encrypted_secret)?)),
            None => Ok(None),
        }
    }

    /// Resolve the most specific credential for `(user, group, provider)`:
    /// user key, then group key when the user is allowed, then the process
    /// default from the environment. Local providers need no credential.
    pub async fn resolve(
        &self,
        user_id: Option<&str>,
        group_id: Option<&str>,
        provider: ProviderFamily,
    ) -> RouterResult<String> {
        if provider.is_local() {
            return Ok(String::new());
        }

        if let Some(user) = user_id {
            if let Some(secret) = self.get_user_key(user, provider).await? {
                return Ok(secret);
            }
        }

        if let Some(group) = group_id {
            if let Some(record) = self.fetch(&group_key(group, provider)).await? {
                let allowed = match (&record.owner, user_id) {
                    (ByokOwner::Group { allowed_users, .. }, Some(user)) => {
                        allowed_users.iter().any(|u| u == user)
                    }
                    (ByokOwner::Group { .. }, None) => false,
                    _ => false,
                };
                if allowed {
                    return Ok(self.sealer.open(&record.encrypted_secret)?);
                }
            }
        }

        if let Some(env_var) = provider.env_key() {
            if let Ok(secret) = std::env::var(env_var) {
                if !secret.is_empty() {
                    return Ok(secret);
                }
            }
        }

        Err(RouterError::Permission(format!(
            "no credential available for provider {}",
            provider
        )))
    }

    pub async fn close(&self) -> RouterResult<()> {
        self.store.close().await
    }

    async fn fetch(&self, key: &str) -> RouterResult<Option<ByokRecord>> {
        match self.store.get(key).await {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RouterError::Internal(format!("corrupt BYOK record: {}", e))),
            None => Ok(None),
        }
    }

    async fn put(&self, key: String, record: &ByokRecord) -> RouterResult<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| RouterError::Internal(format!("serialize BYOK record: {}", e)))?;
        self.store.set(key, value).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> SecretSealer {
        SecretSealer::new(&[7u8; 32])
    }

    async fn store() -> (tempfile::TempDir, ByokStore) {
        let dir = tempfile::tempdir().unwrap();
        let map = PersistentMap::open(dir.path().join("byok.json"))
            .await
            .unwrap();
        (dir, ByokStore::new(map, sealer()))
    }

    #[test]
    fn test_seal_open_round_trip() {
        let sealer = sealer();
        let sealed = sealer.seal("sk-super-secret").unwrap();
        assert_ne!(sealed, "sk-super-secret");
        assert_eq!(sealer.open(&sealed).unwrap(), "sk-super-secret");
    }

    #[test]
    fn test_sealed_values_differ_per_nonce() {
        let sealer = sealer();
        let a = sealer.seal("same").unwrap();
        let b = sealer.seal("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let sealer = sealer();
        let sealed = sealer.seal("secret").unwrap();
        let mut raw = general_purpose::STANDARD.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = general_purpose::STANDARD.encode(raw);
        assert!(sealer.open(&tampered).is_err());
    }

    #[tokio::test]
    async fn test_set_get_delete_round_trip() {
        let (_dir, store) = store().await;
        store
            .set_user_key("u1", ProviderFamily::OpenAi, "sk-user", "personal")
            .await
            .unwrap();
        assert_eq!(
            store
                .get_user_key("u1", ProviderFamily::OpenAi)
                .await
                .unwrap()
                .as_deref(),
            Some("sk-user")
        );
        assert!(store.delete_user_key("u1", ProviderFamily::OpenAi).await);
        assert!(store
            .get_user_key("u1", ProviderFamily::OpenAi)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_plaintext_never_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let map = PersistentMap::open(dir.path().join("byok.json"))
            .await
            .unwrap();
        let store = ByokStore::new(map, sealer());
        store
            .set_user_key("u1", ProviderFamily::OpenAi, "sk-visible-secret", "k")
            .await
            .unwrap();
        // Force a flush and read the raw file
        store.store.flush().await.unwrap();
        let raw = tokio::fs::read_to_string(dir.path().join("byok.json"))
            .await
            .unwrap();
        assert!(!raw.contains("sk-visible-secret"));
    }

    #[tokio::test]
    async fn test_resolution_precedence() {
        let (_dir, store) = store().await;
        let provider = ProviderFamily::DeepSeek;
        std::env::remove_var("DEEPSEEK_API_KEY");

        store
            .set_user_key("u1", provider, "sk-user", "mine")
            .await
            .unwrap();
        store
            .set_group_key("g1", vec!["u1".into()], provider, "sk-group", "team")
            .await
            .unwrap();

        // User key wins
        assert_eq!(
            store.resolve(Some("u1"), Some("g1"), provider).await.unwrap(),
            "sk-user"
        );

        // Without the user key the group key applies
        store.delete_user_key("u1", provider).await;
        assert_eq!(
            store.resolve(Some("u1"), Some("g1"), provider).await.unwrap(),
            "sk-group"
        );

        // Removed from the group: fall through to env, which is absent
        store
            .remove_group_member("g1", provider, "u1")
            .await
            .unwrap();
        assert!(matches!(
            store.resolve(Some("u1"), Some("g1"), provider).await,
            Err(RouterError::Permission(_))
        ));

        // Env default backstops
        std::env::set_var("DEEPSEEK_API_KEY", "sk-env");
        assert_eq!(
            store.resolve(Some("u1"), Some("g1"), provider).await.unwrap(),
            "sk-env"
        );
        std::env::remove_var("DEEPSEEK_API_KEY");
    }

    #[tokio::test]
    async fn test_group_key_requires_membership() {
        let (_dir, store) = store().await;
        let provider = ProviderFamily::Groq;
        std::env::remove_var("GROQ_API_KEY");
        store
            .set_group_key("g1", vec!["member".into()], provider, "sk-group", "team")
            .await
            .unwrap();
        assert!(store
            .resolve(Some("outsider"), Some("g1"), provider)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_local_provider_needs_no_credential() {
        let (_dir, store) = store().await;
        assert_eq!(
            store
                .resolve(None, None, ProviderFamily::LocalGguf)
                .await
                .unwrap(),
            ""
        );
    }
}
