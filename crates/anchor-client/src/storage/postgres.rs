//! PostgreSQL storage backing
//!
//! One row per identity. The per-identity critical section is a row-level
//! lock: the transaction takes `SELECT ... FOR UPDATE` on the identity
//! row, so concurrent workers (also across processes) serialize per UUID.
//! Commit updates the chain tip and commits the transaction in one step;
//! release rolls the transaction back.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use super::{check_signature_len, Identity, IdentityLock, IdentityStore, StoreError};

/// PostgreSQL-backed identity store
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with the given DSN and bring the schema up to date
    pub async fn new(dsn: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        info!("connected to PostgreSQL database");

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identities (
                uid UUID PRIMARY KEY,
                private_key BYTEA NOT NULL,
                public_key TEXT NOT NULL,
                signature BYTEA NOT NULL,
                auth_token TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        info!("database migrations complete");
        Ok(())
    }

    fn identity_from_row(row: &sqlx::postgres::PgRow) -> Result<Identity, StoreError> {
        let identity = Identity {
            uid: row.get("uid"),
            private_key: row.get("private_key"),
            public_key: row.get("public_key"),
            signature: row.get("signature"),
            auth_token: row.get("auth_token"),
            created_at: row.get("created_at"),
        };
        check_signature_len(identity.uid, &identity.signature)?;
        Ok(identity)
    }
}

#[async_trait]
impl IdentityStore for PostgresStore {
    async fn fetch_identity(&self, uid: Uuid) -> Result<Identity, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT uid, private_key, public_key, signature, auth_token, created_at
            FROM identities
            WHERE uid = $1
            "#,
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::NotFound(uid))?;

        Self::identity_from_row(&row)
    }

    async fn store_identity(&self, identity: Identity) -> Result<(), StoreError> {
        identity.validate()?;

        let result = sqlx::query(
            r#"
            INSERT INTO identities (uid, private_key, public_key, signature, auth_token, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (uid) DO NOTHING
            "#,
        )
        .bind(identity.uid)
        .bind(&identity.private_key)
        .bind(&identity.public_key)
        .bind(&identity.signature)
        .bind(&identity.auth_token)
        .bind(identity.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(identity.uid));
        }

        info!(uid = %identity.uid, "stored identity in database");
        Ok(())
    }

    async fn lock(&self, uid: Uuid) -> Result<Box<dyn IdentityLock>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT uid, private_key, public_key, signature, auth_token, created_at
            FROM identities
            WHERE uid = $1
            FOR UPDATE
            "#,
        )
        .bind(uid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::NotFound(uid))?;

        let identity = Self::identity_from_row(&row)?;

        Ok(Box::new(PgLock { tx, identity }))
    }

    fn supports_late_registration(&self) -> bool {
        true
    }

    async fn get_auth_token(&self, uid: Uuid) -> Result<String, StoreError> {
        let row = sqlx::query("SELECT auth_token FROM identities WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::NotFound(uid))?;
        Ok(row.get("auth_token"))
    }

    async fn get_public_key(&self, uid: Uuid) -> Result<String, StoreError> {
        let row = sqlx::query("SELECT public_key FROM identities WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::NotFound(uid))?;
        Ok(row.get("public_key"))
    }

    async fn get_private_key(&self, uid: Uuid) -> Result<Vec<u8>, StoreError> {
        let row = sqlx::query("SELECT private_key FROM identities WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::NotFound(uid))?;
        Ok(row.get("private_key"))
    }

    async fn get_signature(&self, uid: Uuid) -> Result<Vec<u8>, StoreError> {
        let row = sqlx::query("SELECT signature FROM identities WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::NotFound(uid))?;
        let signature: Vec<u8> = row.get("signature");
        check_signature_len(uid, &signature)?;
        Ok(signature)
    }
}

/// Critical section backed by a row-locking transaction
struct PgLock {
    tx: Transaction<'static, Postgres>,
    identity: Identity,
}

#[async_trait]
impl IdentityLock for PgLock {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn commit(mut self: Box<Self>, new_signature: Vec<u8>) -> Result<(), StoreError> {
        check_signature_len(self.identity.uid, &new_signature)?;

        sqlx::query("UPDATE identities SET signature = $2 WHERE uid = $1")
            .bind(self.identity.uid)
            .bind(&new_signature)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}
