//! Core domain model for the product watch pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "prodwatch-core";

/// Unique positive identifier of one tracked product ("artikul").
pub type Artikul = i64;

/// Refresh cadence applied when a subscription does not request its own.
pub const DEFAULT_REFRESH_INTERVAL_SECS: i64 = 30 * 60;

/// Durable name of the recurring refresh job for one product.
///
/// Subscribe, unsubscribe and the persisted descriptor all derive the key
/// through this function, so a job registered by one path is always visible
/// to the others.
pub fn refresh_job_name(artikul: Artikul) -> String {
    format!("product_update_{artikul}")
}

/// Normalized representation of a product as the upstream card API currently
/// reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub artikul: Artikul,
    pub name: String,
    /// Sale price in minor currency units, as reported upstream.
    pub price: i64,
    pub rating: f64,
    /// Total quantity across warehouses.
    pub stock: i64,
    pub fetched_at: DateTime<Utc>,
}

/// Durable product row, keyed by artikul.
///
/// `price`, `rating` and `stock` are nullable in storage; rows written
/// through the reconciler always carry them, the schema merely does not
/// insist on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub artikul: Artikul,
    pub name: String,
    pub price: Option<i64>,
    pub rating: Option<f64>,
    pub stock: Option<i64>,
    pub last_updated: DateTime<Utc>,
}

impl ProductRecord {
    /// Maps a fetched snapshot onto the stored shape, stamping the write time.
    pub fn from_snapshot(snapshot: &ProductSnapshot) -> Self {
        Self {
            artikul: snapshot.artikul,
            name: snapshot.name.clone(),
            price: Some(snapshot.price),
            rating: Some(snapshot.rating),
            stock: Some(snapshot.stock),
            last_updated: Utc::now(),
        }
    }
}

/// What to do with scheduled firings that were missed while the process was
/// down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoalescePolicy {
    /// Collapse all missed firings into a single run at the latest intended
    /// trigger time.
    #[default]
    Latest,
}

impl CoalescePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
        }
    }
}

/// Durable descriptor of one recurring refresh job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub artikul: Artikul,
    pub job_name: String,
    pub interval_secs: i64,
    pub coalesce: CoalescePolicy,
    /// Payload handed to each firing; currently just `{"artikul": N}`.
    pub invocation_args: serde_json::Value,
    /// Intended time of the next firing; compared against now when the
    /// process restarts to decide whether a coalesced catch-up run is due.
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Trigger interval as a std duration, clamped to at least one second.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs.max(1) as u64)
    }
}
