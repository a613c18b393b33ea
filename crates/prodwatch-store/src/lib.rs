//! Durable product and subscription storage backed by Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use prodwatch_core::{
    refresh_job_name, Artikul, CoalescePolicy, ProductRecord, ProductSnapshot, Subscription,
};
use serde_json::json;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "prodwatch-store";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage transaction could not be applied or committed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("subscription already exists for artikul {artikul}")]
    AlreadyExists { artikul: Artikul },
    #[error("no subscription found for artikul {artikul}")]
    NotFound { artikul: Artikul },
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
}

/// Write-side contract for reconciling fetched snapshots into durable rows.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Inserts or replaces the row for the snapshot's artikul. The write runs
    /// in a single transaction that commits before this returns; the new
    /// values always win.
    async fn upsert(&self, snapshot: &ProductSnapshot) -> Result<ProductRecord, StoreError>;

    async fn get(&self, artikul: Artikul) -> Result<Option<ProductRecord>, StoreError>;
}

/// Durable registry of recurring refresh jobs, one per artikul.
///
/// The registry is the single source of truth for "does a job exist": the
/// insert in [`create`](Self::create) doubles as the race-free existence
/// check for the identifier.
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    async fn lookup(&self, artikul: Artikul) -> Result<Subscription, RegistryError>;

    /// Registers a new job descriptor. Fails with `AlreadyExists` when a
    /// descriptor for the artikul is already present.
    async fn create(
        &self,
        artikul: Artikul,
        interval_secs: i64,
        coalesce: CoalescePolicy,
    ) -> Result<Subscription, RegistryError>;

    async fn remove(&self, artikul: Artikul) -> Result<(), RegistryError>;

    /// All persisted descriptors, for re-arming timers after a restart.
    async fn list(&self) -> Result<Vec<Subscription>, RegistryError>;

    /// Records a completed firing by advancing the intended next trigger
    /// time. Fails with `NotFound` when the descriptor vanished mid-flight.
    async fn mark_fired(
        &self,
        artikul: Artikul,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), RegistryError>;
}

fn new_subscription(artikul: Artikul, interval_secs: i64, coalesce: CoalescePolicy) -> Subscription {
    let now = Utc::now();
    Subscription {
        artikul,
        job_name: refresh_job_name(artikul),
        interval_secs,
        coalesce,
        invocation_args: json!({ "artikul": artikul }),
        next_run_at: now + Duration::seconds(interval_secs.max(1)),
        created_at: now,
    }
}

/// Postgres-backed implementation of both storage contracts.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the products and subscriptions tables when missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                artikul      BIGINT PRIMARY KEY,
                name         TEXT NOT NULL,
                price        BIGINT,
                rating       DOUBLE PRECISION,
                stock        BIGINT,
                last_updated TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                artikul         BIGINT PRIMARY KEY,
                job_name        TEXT NOT NULL UNIQUE,
                interval_secs   BIGINT NOT NULL,
                coalesce_policy TEXT NOT NULL,
                invocation_args JSONB NOT NULL,
                next_run_at     TIMESTAMPTZ NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, sqlx::Error> {
    Ok(Subscription {
        artikul: row.try_get("artikul")?,
        job_name: row.try_get("job_name")?,
        interval_secs: row.try_get("interval_secs")?,
        // Only one policy exists; anything persisted maps back onto it.
        coalesce: CoalescePolicy::Latest,
        invocation_args: row.try_get("invocation_args")?,
        next_run_at: row.try_get("next_run_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ProductStore for PgStore {
    async fn upsert(&self, snapshot: &ProductSnapshot) -> Result<ProductRecord, StoreError> {
        let record = ProductRecord::from_snapshot(snapshot);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO products (artikul, name, price, rating, stock, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (artikul) DO UPDATE
               SET name = EXCLUDED.name,
                   price = EXCLUDED.price,
                   rating = EXCLUDED.rating,
                   stock = EXCLUDED.stock,
                   last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(record.artikul)
        .bind(&record.name)
        .bind(record.price)
        .bind(record.rating)
        .bind(record.stock)
        .bind(record.last_updated)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(artikul = record.artikul, "upserted product row");
        Ok(record)
    }

    async fn get(&self, artikul: Artikul) -> Result<Option<ProductRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT artikul, name, price, rating, stock, last_updated
              FROM products
             WHERE artikul = $1
            "#,
        )
        .bind(artikul)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(ProductRecord {
                artikul: row.try_get("artikul")?,
                name: row.try_get("name")?,
                price: row.try_get("price")?,
                rating: row.try_get("rating")?,
                stock: row.try_get("stock")?,
                last_updated: row.try_get("last_updated")?,
            })),
        }
    }
}

#[async_trait]
impl SubscriptionRegistry for PgStore {
    async fn lookup(&self, artikul: Artikul) -> Result<Subscription, RegistryError> {
        let row = sqlx::query(
            r#"
            SELECT artikul, job_name, interval_secs, coalesce_policy,
                   invocation_args, next_run_at, created_at
              FROM subscriptions
             WHERE artikul = $1
            "#,
        )
        .bind(artikul)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(subscription_from_row(&row)?),
            None => Err(RegistryError::NotFound { artikul }),
        }
    }

    async fn create(
        &self,
        artikul: Artikul,
        interval_secs: i64,
        coalesce: CoalescePolicy,
    ) -> Result<Subscription, RegistryError> {
        let sub = new_subscription(artikul, interval_secs, coalesce);

        // The conflict target is the primary key, so concurrent creates for
        // one artikul resolve to exactly one inserted row.
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions
                   (artikul, job_name, interval_secs, coalesce_policy,
                    invocation_args, next_run_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (artikul) DO NOTHING
            "#,
        )
        .bind(sub.artikul)
        .bind(&sub.job_name)
        .bind(sub.interval_secs)
        .bind(sub.coalesce.as_str())
        .bind(&sub.invocation_args)
        .bind(sub.next_run_at)
        .bind(sub.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::AlreadyExists { artikul });
        }
        Ok(sub)
    }

    async fn remove(&self, artikul: Artikul) -> Result<(), RegistryError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE artikul = $1")
            .bind(artikul)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound { artikul });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Subscription>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT artikul, job_name, interval_secs, coalesce_policy,
                   invocation_args, next_run_at, created_at
              FROM subscriptions
             ORDER BY artikul
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(subscription_from_row(row)?);
        }
        Ok(out)
    }

    async fn mark_fired(
        &self,
        artikul: Artikul,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let result = sqlx::query("UPDATE subscriptions SET next_run_at = $2 WHERE artikul = $1")
            .bind(artikul)
            .bind(next_run_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound { artikul });
        }
        Ok(())
    }
}

/// In-process backends with the same contracts as [`PgStore`], for tests
/// that exercise the scheduler and HTTP surface without a database.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        products: Mutex<HashMap<Artikul, ProductRecord>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ProductStore for MemoryStore {
        async fn upsert(&self, snapshot: &ProductSnapshot) -> Result<ProductRecord, StoreError> {
            let record = ProductRecord::from_snapshot(snapshot);
            self.products
                .lock()
                .expect("product map lock")
                .insert(record.artikul, record.clone());
            Ok(record)
        }

        async fn get(&self, artikul: Artikul) -> Result<Option<ProductRecord>, StoreError> {
            Ok(self
                .products
                .lock()
                .expect("product map lock")
                .get(&artikul)
                .cloned())
        }
    }

    #[derive(Debug, Default)]
    pub struct MemoryRegistry {
        subs: Mutex<HashMap<Artikul, Subscription>>,
    }

    impl MemoryRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a descriptor directly, bypassing `create`; lets tests shape
        /// restart scenarios with arbitrary `next_run_at` values.
        pub fn seed(&self, sub: Subscription) {
            self.subs
                .lock()
                .expect("subscription map lock")
                .insert(sub.artikul, sub);
        }
    }

    #[async_trait]
    impl SubscriptionRegistry for MemoryRegistry {
        async fn lookup(&self, artikul: Artikul) -> Result<Subscription, RegistryError> {
            self.subs
                .lock()
                .expect("subscription map lock")
                .get(&artikul)
                .cloned()
                .ok_or(RegistryError::NotFound { artikul })
        }

        async fn create(
            &self,
            artikul: Artikul,
            interval_secs: i64,
            coalesce: CoalescePolicy,
        ) -> Result<Subscription, RegistryError> {
            let mut subs = self.subs.lock().expect("subscription map lock");
            if subs.contains_key(&artikul) {
                return Err(RegistryError::AlreadyExists { artikul });
            }
            let sub = new_subscription(artikul, interval_secs, coalesce);
            subs.insert(artikul, sub.clone());
            Ok(sub)
        }

        async fn remove(&self, artikul: Artikul) -> Result<(), RegistryError> {
            self.subs
                .lock()
                .expect("subscription map lock")
                .remove(&artikul)
                .map(|_| ())
                .ok_or(RegistryError::NotFound { artikul })
        }

        async fn list(&self) -> Result<Vec<Subscription>, RegistryError> {
            let mut out: Vec<_> = self
                .subs
                .lock()
                .expect("subscription map lock")
                .values()
                .cloned()
                .collect();
            out.sort_by_key(|s| s.artikul);
            Ok(out)
        }

        async fn mark_fired(
            &self,
            artikul: Artikul,
            next_run_at: DateTime<Utc>,
        ) -> Result<(), RegistryError> {
            let mut subs = self.subs.lock().expect("subscription map lock");
            match subs.get_mut(&artikul) {
                Some(sub) => {
                    sub.next_run_at = next_run_at;
                    Ok(())
                }
                None => Err(RegistryError::NotFound { artikul }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryRegistry, MemoryStore};
    use super::*;

    fn snapshot(artikul: Artikul, name: &str, price: i64) -> ProductSnapshot {
        ProductSnapshot {
            artikul,
            name: name.to_string(),
            price,
            rating: 4.5,
            stock: 7,
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_apart_from_the_write_stamp() {
        let store = MemoryStore::new();
        let snap = snapshot(555, "Widget", 12900);

        let first = store.upsert(&snap).await.expect("first upsert");
        let second = store.upsert(&snap).await.expect("second upsert");

        assert_eq!(first.artikul, second.artikul);
        assert_eq!(first.name, second.name);
        assert_eq!(first.price, second.price);
        assert_eq!(first.rating, second.rating);
        assert_eq!(first.stock, second.stock);
        assert!(second.last_updated >= first.last_updated);

        let stored = store.get(555).await.expect("get").expect("row");
        assert_eq!(stored.name, "Widget");
        assert_eq!(stored.price, Some(12900));
    }

    #[tokio::test]
    async fn upsert_replaces_every_field() {
        let store = MemoryStore::new();
        store
            .upsert(&snapshot(10, "Old name", 100))
            .await
            .expect("initial upsert");
        store
            .upsert(&snapshot(10, "New name", 200))
            .await
            .expect("replacing upsert");

        let stored = store.get(10).await.expect("get").expect("row");
        assert_eq!(stored.name, "New name");
        assert_eq!(stored.price, Some(200));
    }

    #[tokio::test]
    async fn create_rejects_a_second_descriptor_for_the_same_artikul() {
        let registry = MemoryRegistry::new();
        registry
            .create(12345, 1800, CoalescePolicy::Latest)
            .await
            .expect("first create");

        let err = registry
            .create(12345, 1800, CoalescePolicy::Latest)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { artikul: 12345 }));
    }

    #[tokio::test]
    async fn created_descriptor_carries_the_persisted_layout() {
        let registry = MemoryRegistry::new();
        let before = Utc::now();
        let sub = registry
            .create(555, 1800, CoalescePolicy::Latest)
            .await
            .expect("create");

        assert_eq!(sub.job_name, "product_update_555");
        assert_eq!(sub.interval_secs, 1800);
        assert_eq!(sub.coalesce, CoalescePolicy::Latest);
        assert_eq!(sub.invocation_args, serde_json::json!({ "artikul": 555 }));
        assert!(sub.next_run_at >= before + Duration::seconds(1800));
    }

    #[tokio::test]
    async fn remove_of_unknown_artikul_is_not_found() {
        let registry = MemoryRegistry::new();
        let err = registry.remove(99999).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { artikul: 99999 }));
    }

    #[tokio::test]
    async fn list_returns_descriptors_ordered_by_artikul() {
        let registry = MemoryRegistry::new();
        registry
            .create(20, 60, CoalescePolicy::Latest)
            .await
            .expect("create 20");
        registry
            .create(10, 60, CoalescePolicy::Latest)
            .await
            .expect("create 10");

        let listed = registry.list().await.expect("list");
        let artikuls: Vec<_> = listed.iter().map(|s| s.artikul).collect();
        assert_eq!(artikuls, vec![10, 20]);
    }

    #[tokio::test]
    async fn mark_fired_advances_the_next_trigger_time() {
        let registry = MemoryRegistry::new();
        registry
            .create(7, 60, CoalescePolicy::Latest)
            .await
            .expect("create");

        let next = Utc::now() + Duration::seconds(3600);
        registry.mark_fired(7, next).await.expect("mark fired");
        let sub = registry.lookup(7).await.expect("lookup");
        assert_eq!(sub.next_run_at, next);

        let err = registry
            .mark_fired(8, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { artikul: 8 }));
    }
}
