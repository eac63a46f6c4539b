//! Market price aggregates.
//!
//! Every piece of tradeable content has one aggregate document tracking
//! its purchase and sale counts and the price derived from them. The
//! price is a pure function of the counters and is recomputed inside the
//! same transaction that applies an increment — never advanced by a blind
//! increment divorced from a fresh read, which is exactly the lost-update
//! bug this module exists to prevent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::writer::ConflictSafeWriter;
use crate::error::{Result, StoreError};
use crate::store::{DocRef, SetOptions};

/// Floor below which a price never drops.
pub const MIN_PRICE: f64 = 0.1;

/// Base price assigned to a key on first reference.
pub const DEFAULT_BASE_PRICE: f64 = 1.0;

/// Collection holding the aggregate documents.
const MARKET_COLLECTION: &str = "market_aggregates";

/// One content key's market state, as stored at
/// `market_aggregates/{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAggregate {
    /// Cumulative purchase count.
    pub purchases: i64,
    /// Cumulative sale count.
    pub sales: i64,
    /// The price the curve is anchored at.
    pub base_price: f64,
    /// The derived price; always consistent with the counters.
    pub current_price: f64,
    /// When the aggregate was last written.
    pub last_updated: DateTime<Utc>,
}

impl MarketAggregate {
    fn new_at(now: DateTime<Utc>) -> Self {
        Self {
            purchases: 0,
            sales: 0,
            base_price: DEFAULT_BASE_PRICE,
            current_price: DEFAULT_BASE_PRICE,
            last_updated: now,
        }
    }
}

/// Compute the price for the given counters.
///
/// Net demand moves the price linearly; total volume adds a dampened
/// (square-root) premium; the result never drops below [`MIN_PRICE`].
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn recompute_price(purchases: i64, sales: i64, base_price: f64) -> f64 {
    let pressure = 0.05 * (purchases - sales) as f64;
    let volume = 0.1 * (((purchases + sales).max(0)) as f64).sqrt();
    (base_price + pressure + volume).max(MIN_PRICE)
}

/// Normalize a raw content key into a document id.
///
/// Lowercases, and collapses each run of non-alphanumeric characters into
/// a single `-`, trimming any at the ends.
#[must_use]
pub fn normalize_market_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !key.is_empty() {
                key.push('-');
            }
            pending_dash = false;
            for lower in ch.to_lowercase() {
                if lower.is_alphanumeric() {
                    key.push(lower);
                }
            }
        } else {
            pending_dash = true;
        }
    }
    key
}

/// Transactionally maintained market aggregates.
#[derive(Debug, Clone)]
pub struct MarketBoard {
    writer: ConflictSafeWriter,
}

impl MarketBoard {
    /// Create a market board over the given writer.
    #[must_use]
    pub fn new(writer: ConflictSafeWriter) -> Self {
        Self { writer }
    }

    fn aggregate_ref(key: &str) -> DocRef {
        DocRef::new(MARKET_COLLECTION, normalize_market_key(key))
    }

    /// Apply purchase/sale deltas to a key's aggregate and recompute its
    /// price, all in one transaction.
    ///
    /// A new key is initialized with zero counters and the default base
    /// price before the deltas apply. On a conflicting concurrent
    /// increment the whole read-compute-write cycle re-runs from the
    /// latest committed state, so no increment is ever lost.
    pub async fn update_market_aggregate(
        &self,
        key: &str,
        buy_delta: i64,
        sell_delta: i64,
    ) -> Result<MarketAggregate> {
        let doc = Self::aggregate_ref(key);
        let name = format!("market:update:{}", doc.id);

        self.writer
            .safe_transaction(&name, |txn| {
                let doc = doc.clone();
                async move {
                    let now = Utc::now();
                    let mut aggregate = match txn.get(&doc).await? {
                        Some(found) => serde_json::from_value::<MarketAggregate>(found.data)
                            .map_err(StoreError::from)?,
                        None => MarketAggregate::new_at(now),
                    };

                    aggregate.purchases += buy_delta;
                    aggregate.sales += sell_delta;
                    aggregate.current_price = recompute_price(
                        aggregate.purchases,
                        aggregate.sales,
                        aggregate.base_price,
                    );
                    aggregate.last_updated = now;

                    txn.set(
                        &doc,
                        serde_json::to_value(&aggregate)?,
                        SetOptions::default(),
                    )
                    .await?;
                    Ok(aggregate)
                }
            })
            .await
    }

    /// Read a key's aggregate, if it has ever been referenced.
    pub async fn fetch(&self, key: &str) -> Result<Option<MarketAggregate>> {
        let doc = Self::aggregate_ref(key);
        match self.writer.store().get(&doc).await? {
            Some(found) => Ok(Some(
                serde_json::from_value(found.data).map_err(StoreError::from)?,
            )),
            None => Ok(None),
        }
    }
}
