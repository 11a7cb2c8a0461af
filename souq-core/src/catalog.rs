//! Read-only catalog lookup, used for order-time snapshotting only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EngineResult;

/// Product attributes captured immutably onto a sub-order line at order
/// time. Later catalog edits never touch existing orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub product_id: Uuid,
    pub vendor_id: Uuid,
    pub name: String,
    pub unit_price: i64,
    pub size: Option<String>,
}

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn product(&self, id: Uuid) -> EngineResult<Option<ProductSnapshot>>;
}
