//! Startup bulk-loads of the metric taxonomy and the customer directory.
//!
//! Both sets live in the backing store and are read once at startup (and on
//! explicit admin reload), then installed wholesale into their registries.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::customers::Customer;
use crate::taxonomy::{MetricContextType, MetricTypeRow};

/// Reads all metric types with their nested context types.
pub async fn load_taxonomy(pool: &Pool, database: &str) -> Result<Vec<MetricTypeRow>> {
    let mut handle = pool
        .get_handle()
        .await
        .context("getting handle for taxonomy load")?;

    let block = handle
        .query(format!(
            "SELECT id, name FROM {database}.metric_types ORDER BY id"
        ))
        .fetch_all()
        .await
        .context("querying metric types")?;

    let mut rows = Vec::with_capacity(block.row_count());
    let mut by_id: HashMap<u32, usize> = HashMap::with_capacity(block.row_count());

    for row in block.rows() {
        let id: u32 = row.get("id").context("reading metric type id")?;
        let name: String = row.get("name").context("reading metric type name")?;
        by_id.insert(id, rows.len());
        rows.push(MetricTypeRow {
            id,
            name,
            contexts: Vec::new(),
        });
    }

    let block = handle
        .query(format!(
            "SELECT id, metric_type_id, name FROM {database}.metric_context_types ORDER BY id"
        ))
        .fetch_all()
        .await
        .context("querying metric context types")?;

    for row in block.rows() {
        let id: u32 = row.get("id").context("reading context type id")?;
        let metric_type_id: u32 = row
            .get("metric_type_id")
            .context("reading context owner id")?;
        let name: String = row.get("name").context("reading context type name")?;

        match by_id.get(&metric_type_id) {
            Some(&idx) => rows[idx].contexts.push(MetricContextType { id, name }),
            None => tracing::warn!(
                context_type_id = id,
                metric_type_id,
                "context type references an unknown metric type, skipping"
            ),
        }
    }

    Ok(rows)
}

/// Reads all customers with their tenant prefixes.
pub async fn load_customers(pool: &Pool, database: &str) -> Result<Vec<Customer>> {
    let mut handle = pool
        .get_handle()
        .await
        .context("getting handle for customer load")?;

    let block = handle
        .query(format!(
            "SELECT id, prefix FROM {database}.customers ORDER BY id"
        ))
        .fetch_all()
        .await
        .context("querying customers")?;

    let mut rows = Vec::with_capacity(block.row_count());
    for row in block.rows() {
        let id: u64 = row.get("id").context("reading customer id")?;
        let prefix: String = row.get("prefix").context("reading customer prefix")?;
        rows.push(Customer { id, prefix });
    }

    Ok(rows)
}
