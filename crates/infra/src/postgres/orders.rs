use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::Row;

use augur_core::{AggregateRoot, ExpectedVersion, OrderId};
use augur_orders::{Order, OrderStatus};

use super::{decode_error, map_sqlx_error, PgBackend};
use crate::error::StoreError;
use crate::orders::OrderStore;

/// Orders as JSONB, with status and timestamps broken out for the queries.
///
/// `save` is a conditional `UPDATE` on the stored version, so two writers
/// racing on one order see exactly one `Conflict`.
pub struct PgOrderStore {
    backend: PgBackend,
}

impl PgOrderStore {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }
}

fn status_labels(statuses: &[OrderStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn decode_orders(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Order>, StoreError> {
    rows.into_iter()
        .map(|row| {
            row.try_get::<Json<Order>, _>("body")
                .map(|body| body.0)
                .map_err(|e| decode_error("order", e))
        })
        .collect()
}

impl OrderStore for PgOrderStore {
    fn insert(&self, order: Order) -> Result<(), StoreError> {
        let pool = self.backend.pool();
        self.backend
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO augur_orders (order_id, status, version, created_at, replied_at, body)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(*order.id_typed().as_uuid())
                .bind(order.status().as_str())
                .bind(order.version() as i64)
                .bind(order.created_at())
                .bind(order.replied_at())
                .bind(Json(&order))
                .execute(pool),
            )
            .map_err(|e| map_sqlx_error("insert_order", e))?;
        Ok(())
    }

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let pool = self.backend.pool();
        let row = self
            .backend
            .block_on(
                sqlx::query("SELECT body FROM augur_orders WHERE order_id = $1")
                    .bind(*order_id.as_uuid())
                    .fetch_optional(pool),
            )
            .map_err(|e| map_sqlx_error("get_order", e))?;
        row.map(|row| {
            row.try_get::<Json<Order>, _>("body")
                .map(|body| body.0)
                .map_err(|e| decode_error("order", e))
        })
        .transpose()
    }

    fn save(&self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError> {
        let pool = self.backend.pool();
        let id = order.id_typed();
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let updated = self
            .backend
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE augur_orders
                    SET status = $2, version = $3, replied_at = $4, body = $5
                    WHERE order_id = $1 AND ($6::BIGINT IS NULL OR version = $6)
                    "#,
                )
                .bind(*id.as_uuid())
                .bind(order.status().as_str())
                .bind(order.version() as i64)
                .bind(order.replied_at())
                .bind(Json(order))
                .bind(expected_version)
                .execute(pool),
            )
            .map_err(|e| map_sqlx_error("save_order", e))?;
        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let current: Option<i64> = self
            .backend
            .block_on(
                sqlx::query_scalar("SELECT version FROM augur_orders WHERE order_id = $1")
                    .bind(*id.as_uuid())
                    .fetch_optional(pool),
            )
            .map_err(|e| map_sqlx_error("save_order", e))?;
        match current {
            None => Err(StoreError::NotFound(format!("order {id}"))),
            Some(version) => Err(StoreError::Conflict(format!(
                "order {id} is at version {version}, expected {expected:?}"
            ))),
        }
    }

    fn list_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError> {
        let pool = self.backend.pool();
        let rows = self
            .backend
            .block_on(
                sqlx::query(
                    "SELECT body FROM augur_orders WHERE status = ANY($1) ORDER BY created_at, order_id",
                )
                .bind(status_labels(statuses))
                .fetch_all(pool),
            )
            .map_err(|e| map_sqlx_error("list_orders", e))?;
        decode_orders(rows)
    }

    fn count_by_status(&self) -> Result<BTreeMap<OrderStatus, usize>, StoreError> {
        let pool = self.backend.pool();
        let rows = self
            .backend
            .block_on(
                sqlx::query("SELECT status, COUNT(*) AS n FROM augur_orders GROUP BY status").fetch_all(pool),
            )
            .map_err(|e| map_sqlx_error("count_orders", e))?;

        let mut counts: BTreeMap<OrderStatus, usize> =
            OrderStatus::ALL.iter().map(|&status| (status, 0)).collect();
        for row in rows {
            let label: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
            let n: i64 = row.try_get("n").map_err(|e| decode_error("count", e))?;
            let status = OrderStatus::ALL
                .into_iter()
                .find(|s| s.as_str() == label)
                .ok_or_else(|| decode_error("status", format!("unknown status {label:?}")))?;
            counts.insert(status, n as usize);
        }
        Ok(counts)
    }

    fn recently_completed(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Order>, StoreError> {
        let pool = self.backend.pool();
        let rows = self
            .backend
            .block_on(
                sqlx::query(
                    r#"
                    SELECT body FROM augur_orders
                    WHERE status = $1 AND replied_at >= $2
                    ORDER BY replied_at DESC
                    LIMIT $3
                    "#,
                )
                .bind(OrderStatus::Completed.as_str())
                .bind(since)
                .bind(limit as i64)
                .fetch_all(pool),
            )
            .map_err(|e| map_sqlx_error("recently_completed", e))?;
        decode_orders(rows)
    }
}
