//! Upstream card-API client for the product watch pipeline.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use prodwatch_core::{Artikul, ProductSnapshot};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "prodwatch-upstream";

/// Card detail endpoint; the artikul is appended as the `nm` query value.
pub const DEFAULT_CARD_BASE_URL: &str =
    "https://card.wb.ru/cards/v1/detail?appType=1&curr=rub&dest=-1257786&spp=30&nm=";

#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure or a non-success HTTP status from upstream.
    #[error("upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },
    /// Upstream answered but carried no entity for the identifier.
    #[error("no product found upstream for artikul {artikul}")]
    NotFound { artikul: Artikul },
    /// The response arrived but an expected field was absent.
    #[error("malformed upstream response: missing {field}")]
    MalformedResponse { field: &'static str },
}

/// Read-side contract against the upstream product source.
///
/// Implementations report every failure as a typed [`FetchError`]; callers
/// decide whether and when to retry.
#[async_trait]
pub trait ProductFetcher: Send + Sync {
    /// Fetches the current upstream state of one product.
    async fn fetch(&self, artikul: Artikul) -> Result<ProductSnapshot, FetchError>;
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CARD_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// `ProductFetcher` backed by the public card HTTP API.
#[derive(Debug)]
pub struct CardApiFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl CardApiFetcher {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }
}

#[async_trait]
impl ProductFetcher for CardApiFetcher {
    async fn fetch(&self, artikul: Artikul) -> Result<ProductSnapshot, FetchError> {
        let url = format!("{}{artikul}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| FetchError::UpstreamUnavailable {
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::UpstreamUnavailable {
                reason: format!("http status {status} for {url}"),
            });
        }

        let body: CardResponse =
            response
                .json()
                .await
                .map_err(|_| FetchError::MalformedResponse { field: "body" })?;

        debug!(artikul, "fetched card response");
        snapshot_from_response(artikul, body)
    }
}

/// Wire shape of the card detail response. Only the fields the reconciler
/// persists are modeled; everything is optional so that shape violations
/// surface as field-level errors instead of deserialization failures.
#[derive(Debug, Deserialize)]
struct CardResponse {
    data: Option<CardData>,
}

#[derive(Debug, Deserialize)]
struct CardData {
    #[serde(default)]
    products: Vec<CardProduct>,
}

#[derive(Debug, Deserialize)]
struct CardProduct {
    name: Option<String>,
    #[serde(rename = "salePriceU")]
    sale_price_u: Option<i64>,
    #[serde(rename = "reviewRating")]
    review_rating: Option<f64>,
    #[serde(rename = "totalQuantity")]
    total_quantity: Option<i64>,
}

/// Normalizes the first matching entity into a snapshot. An empty product
/// list is a lookup miss; a missing field is a contract violation.
fn snapshot_from_response(
    artikul: Artikul,
    response: CardResponse,
) -> Result<ProductSnapshot, FetchError> {
    let data = response
        .data
        .ok_or(FetchError::MalformedResponse { field: "data" })?;
    let product = data
        .products
        .into_iter()
        .next()
        .ok_or(FetchError::NotFound { artikul })?;

    Ok(ProductSnapshot {
        artikul,
        name: product
            .name
            .ok_or(FetchError::MalformedResponse { field: "name" })?,
        price: product
            .sale_price_u
            .ok_or(FetchError::MalformedResponse { field: "salePriceU" })?,
        rating: product
            .review_rating
            .ok_or(FetchError::MalformedResponse {
                field: "reviewRating",
            })?,
        stock: product
            .total_quantity
            .ok_or(FetchError::MalformedResponse {
                field: "totalQuantity",
            })?,
        fetched_at: Utc::now(),
    })
}
