//! Postgres catalog lookup for order-time product snapshotting.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use souq_core::catalog::{CatalogLookup, ProductSnapshot};
use souq_core::EngineResult;

use crate::db_err;

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update a product listing. Existing order lines are
    /// snapshots and stay untouched.
    pub async fn upsert_product(&self, product: &ProductSnapshot) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO products (id, vendor_id, name, unit_price, size)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
                SET name = EXCLUDED.name,
                    unit_price = EXCLUDED.unit_price,
                    size = EXCLUDED.size",
        )
        .bind(product.product_id)
        .bind(product.vendor_id)
        .bind(&product.name)
        .bind(product.unit_price)
        .bind(&product.size)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    vendor_id: Uuid,
    name: String,
    unit_price: i64,
    size: Option<String>,
}

#[async_trait]
impl CatalogLookup for PgCatalog {
    async fn product(&self, id: Uuid) -> EngineResult<Option<ProductSnapshot>> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, vendor_id, name, unit_price, size FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| ProductSnapshot {
            product_id: r.id,
            vendor_id: r.vendor_id,
            name: r.name,
            unit_price: r.unit_price,
            size: r.size,
        }))
    }
}
