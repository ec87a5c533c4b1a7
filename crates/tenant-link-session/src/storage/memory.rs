//! In-memory credential storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use tenant_link_core::{CredentialStore, KeyId, Payload, StorageError, TenantId};

/// In-memory storage implementation.
///
/// Useful for development and tests. Payloads are kept in their encoded
/// text form, so reads exercise the same codec as a database backend.
/// Data is lost on restart.
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<TenantId, HashMap<KeyId, String>>>,
}

impl MemoryCredentialStore {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records held for a tenant.
    #[must_use]
    pub fn record_count(&self, tenant: &TenantId) -> usize {
        self.records
            .read()
            .map(|records| records.get(tenant).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, tenant: &TenantId, key: &KeyId) -> Result<Option<Payload>, StorageError> {
        let encoded = self
            .records
            .read()
            .map_err(poisoned)?
            .get(tenant)
            .and_then(|records| records.get(key))
            .cloned();

        encoded
            .map(|text| Payload::decode(&text))
            .transpose()
            .map_err(StorageError::from)
    }

    async fn set(
        &self,
        tenant: &TenantId,
        key: &KeyId,
        payload: &Payload,
    ) -> Result<(), StorageError> {
        let encoded = payload.encode()?;

        self.records
            .write()
            .map_err(poisoned)?
            .entry(tenant.clone())
            .or_default()
            .insert(key.clone(), encoded);

        Ok(())
    }

    async fn delete(&self, tenant: &TenantId, key: &KeyId) -> Result<(), StorageError> {
        let mut records = self.records.write().map_err(poisoned)?;

        if let Some(tenant_records) = records.get_mut(tenant) {
            tenant_records.remove(key);
            if tenant_records.is_empty() {
                records.remove(tenant);
            }
        }

        Ok(())
    }

    async fn delete_tenant(&self, tenant: &TenantId) -> Result<u64, StorageError> {
        let removed = self
            .records
            .write()
            .map_err(poisoned)?
            .remove(tenant)
            .map_or(0, |records| records.len());

        Ok(removed as u64)
    }

    async fn tenants_with(&self, key: &KeyId) -> Result<Vec<TenantId>, StorageError> {
        let records = self.records.read().map_err(poisoned)?;

        let mut tenants: Vec<TenantId> = records
            .iter()
            .filter(|(_, tenant_records)| tenant_records.contains_key(key))
            .map(|(tenant, _)| tenant.clone())
            .collect();

        tenants.sort();
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::from(id)
    }

    #[tokio::test]
    async fn test_binary_payload_round_trip() {
        let store = MemoryCredentialStore::new();
        let key = KeyId::new("pre-key", Some("7"));
        let raw: Vec<u8> = (0..=255).rev().collect();
        let payload = Payload::object([
            ("keyPair", Payload::object([("private", Payload::bytes(raw.clone()))])),
            ("keyId", Payload::from(7_u64)),
        ]);

        assert_ok!(store.set(&tenant("a"), &key, &payload).await);
        let read = store.get(&tenant("a"), &key).await.unwrap().unwrap();

        assert_eq!(read, payload);
        let private = read
            .get("keyPair")
            .and_then(|k| k.get("private"))
            .and_then(Payload::as_bytes)
            .unwrap();
        assert_eq!(private, raw.as_slice());
    }

    #[tokio::test]
    async fn test_missing_key_is_absent_not_error() {
        let store = MemoryCredentialStore::new();
        let found = store.get(&tenant("a"), &KeyId::creds()).await.unwrap();
        assert!(found.is_none());

        // Stored null is distinct from absent.
        store
            .set(&tenant("a"), &KeyId::creds(), &Payload::Null)
            .await
            .unwrap();
        let found = store.get(&tenant("a"), &KeyId::creds()).await.unwrap();
        assert_eq!(found, Some(Payload::Null));
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let store = MemoryCredentialStore::new();
        assert_ok!(store.delete(&tenant("a"), &KeyId::creds()).await);
        assert_eq!(store.delete_tenant(&tenant("a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let store = MemoryCredentialStore::new();
        let creds = KeyId::creds();
        store
            .set(&tenant("a"), &creds, &Payload::from("a-creds"))
            .await
            .unwrap();
        store
            .set(&tenant("b"), &creds, &Payload::from("b-creds"))
            .await
            .unwrap();
        store
            .set(&tenant("b"), &KeyId::new("session", Some("1")), &Payload::Null)
            .await
            .unwrap();

        assert_eq!(store.delete_tenant(&tenant("b")).await.unwrap(), 2);
        assert_eq!(
            store.get(&tenant("a"), &creds).await.unwrap(),
            Some(Payload::from("a-creds"))
        );
        assert_eq!(store.tenants_with(&creds).await.unwrap(), vec![tenant("a")]);
    }
}
