//! SQLite credential storage (feature-gated).

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tenant_link_core::{CredentialStore, KeyId, Payload, StorageError, TenantId};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS credential_records (
    tenant_id  TEXT    NOT NULL,
    key_id     TEXT    NOT NULL,
    payload    TEXT    NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, key_id)
)
";

/// SQLite storage implementation.
///
/// One row per `(tenant_id, key_id)`; the payload column holds the tagged
/// JSON encoding of [`Payload`].
#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl SqliteCredentialStore {
    /// Connect to a database, creating the file if needed, and migrate.
    ///
    /// # Errors
    /// Returns error if database connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options: SqliteConnectOptions = database_url.parse().map_err(backend)?;
        let pool = SqlitePoolOptions::new()
            .connect_with(options.create_if_missing(true))
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Call [`Self::migrate`] before use.
    #[must_use]
    pub const fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the credential table if it does not exist.
    ///
    /// # Errors
    /// Returns error if the statement fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get(&self, tenant: &TenantId, key: &KeyId) -> Result<Option<Payload>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT payload FROM credential_records WHERE tenant_id = ?1 AND key_id = ?2",
        )
        .bind(tenant.as_str())
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|(text,)| Payload::decode(&text))
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

        sqlx::query(
            r"
            INSERT INTO credential_records (tenant_id, key_id, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (tenant_id, key_id)
            DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at
            ",
        )
        .bind(tenant.as_str())
        .bind(key.as_str())
        .bind(encoded)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn delete(&self, tenant: &TenantId, key: &KeyId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM credential_records WHERE tenant_id = ?1 AND key_id = ?2")
            .bind(tenant.as_str())
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn delete_tenant(&self, tenant: &TenantId) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM credential_records WHERE tenant_id = ?1")
            .bind(tenant.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(result.rows_affected())
    }

    async fn tenants_with(&self, key: &KeyId) -> Result<Vec<TenantId>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT tenant_id FROM credential_records WHERE key_id = ?1 ORDER BY tenant_id",
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.into_iter().map(|(id,)| TenantId::from(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteCredentialStore {
        // A single connection keeps the in-memory database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteCredentialStore::from_pool(pool);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_binary_payload_round_trip() {
        let store = store().await;
        let tenant = TenantId::from("acme");
        let raw: Vec<u8> = (0..=255).collect();
        let creds = Payload::object([
            ("signedIdentityKey", Payload::object([("public", Payload::bytes(raw.clone()))])),
            ("me", Payload::from("6281234567890:3@s.whatsapp.net")),
        ]);

        store.set(&tenant, &KeyId::creds(), &creds).await.unwrap();
        let read = store.get(&tenant, &KeyId::creds()).await.unwrap();
        assert_eq!(read, Some(creds));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_is_idempotent() {
        let store = store().await;
        let tenant = TenantId::from("acme");
        let key = KeyId::new("app-state-sync-key", Some("AAAAAFxV"));

        store.set(&tenant, &key, &Payload::from(1_u64)).await.unwrap();
        store.set(&tenant, &key, &Payload::from(2_u64)).await.unwrap();
        assert_eq!(store.get(&tenant, &key).await.unwrap(), Some(Payload::from(2_u64)));

        store.delete(&tenant, &key).await.unwrap();
        store.delete(&tenant, &key).await.unwrap();
        assert!(store.get(&tenant, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_tenant_and_enumerate_creds() {
        let store = store().await;
        let a = TenantId::from("a");
        let b = TenantId::from("b");
        store.set(&a, &KeyId::creds(), &Payload::Null).await.unwrap();
        store
            .set(&a, &KeyId::new("pre-key", Some("1")), &Payload::Null)
            .await
            .unwrap();
        store.set(&b, &KeyId::creds(), &Payload::Null).await.unwrap();

        assert_eq!(
            store.tenants_with(&KeyId::creds()).await.unwrap(),
            vec![a.clone(), b.clone()]
        );
        assert_eq!(store.delete_tenant(&a).await.unwrap(), 2);
        assert_eq!(store.tenants_with(&KeyId::creds()).await.unwrap(), vec![b]);
    }
}
