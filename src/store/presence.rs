//! Presence bulk merges.
//!
//! Each entry point sends its rows as multi-row INSERTs so the store
//! performs one merge per table instead of one round trip per ping. The row
//! types are free-standing on purpose: other batch jobs can reuse these
//! merges without pulling in the aggregator.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::NaiveDate;
use clickhouse_rs::Pool;

use crate::export::health::HealthMetrics;

use super::{escape_sql, format_date, push_row_separator, StoreError};

/// Per-(customer, date) presence count row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceDailyRow {
    pub customer_id: u64,
    pub date: NaiveDate,
    pub count: u64,
    pub network_id: Option<u64>,
}

/// Per-ping presence instance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceInstanceRow {
    pub customer_id: u64,
    pub date: NaiveDate,
    pub local_number: String,
    pub network_id: Option<u64>,
}

/// Bulk-merge writer for the presence tables.
pub struct PresenceStore {
    pool: Pool,
    database: String,
    health: Option<Arc<HealthMetrics>>,
}

impl PresenceStore {
    /// Creates a new presence store over the shared pool.
    pub fn new(pool: Pool, database: String, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            pool,
            database,
            health,
        }
    }

    /// Merges one cycle's overall presence rows.
    pub async fn merge_overall(
        &self,
        daily: &[PresenceDailyRow],
        instances: &[PresenceInstanceRow],
    ) -> Result<(), StoreError> {
        self.merge(daily, instances, false).await
    }

    /// Merges one cycle's network-scoped presence rows.
    pub async fn merge_by_network(
        &self,
        daily: &[PresenceDailyRow],
        instances: &[PresenceInstanceRow],
    ) -> Result<(), StoreError> {
        self.merge(daily, instances, true).await
    }

    async fn merge(
        &self,
        daily: &[PresenceDailyRow],
        instances: &[PresenceInstanceRow],
        by_network: bool,
    ) -> Result<(), StoreError> {
        if daily.is_empty() && instances.is_empty() {
            return Ok(());
        }

        let daily_table = if by_network {
            "presence_daily_by_network"
        } else {
            "presence_daily"
        };
        let instance_table = if by_network {
            "presence_instances_by_network"
        } else {
            "presence_instances"
        };

        let mut handle = self.pool.get_handle().await?;

        if !daily.is_empty() {
            let sql = daily_sql(&self.database, daily_table, daily, by_network);
            if let Err(e) = handle.execute(sql.as_str()).await {
                self.record_error(daily_table);
                return Err(e.into());
            }
        }

        if !instances.is_empty() {
            let sql = instance_sql(&self.database, instance_table, instances, by_network);
            if let Err(e) = handle.execute(sql.as_str()).await {
                self.record_error(instance_table);
                return Err(e.into());
            }
        }

        tracing::debug!(
            daily = daily.len(),
            instances = instances.len(),
            by_network,
            "merged presence rows"
        );

        Ok(())
    }

    fn record_error(&self, table: &str) {
        if let Some(health) = &self.health {
            health.store_write_errors.with_label_values(&[table]).inc();
        }
    }
}

fn daily_sql(database: &str, table: &str, rows: &[PresenceDailyRow], by_network: bool) -> String {
    let columns = if by_network {
        "customer_id, date, network_id, count"
    } else {
        "customer_id, date, count"
    };

    let mut sql = String::with_capacity(64 + database.len() + table.len() + rows.len() * 40);
    let _ = write!(sql, "INSERT INTO {database}.{table} ({columns}) VALUES ");

    for (idx, row) in rows.iter().enumerate() {
        push_row_separator(&mut sql, idx);
        let date = format_date(row.date);
        if by_network {
            let network = row.network_id.unwrap_or(0);
            let _ = write!(
                sql,
                "({}, {date}, {network}, {})",
                row.customer_id, row.count
            );
        } else {
            let _ = write!(sql, "({}, {date}, {})", row.customer_id, row.count);
        }
    }

    sql
}

fn instance_sql(
    database: &str,
    table: &str,
    rows: &[PresenceInstanceRow],
    by_network: bool,
) -> String {
    let columns = if by_network {
        "customer_id, date, network_id, local_number"
    } else {
        "customer_id, date, local_number"
    };

    let mut sql = String::with_capacity(64 + database.len() + table.len() + rows.len() * 56);
    let _ = write!(sql, "INSERT INTO {database}.{table} ({columns}) VALUES ");

    for (idx, row) in rows.iter().enumerate() {
        push_row_separator(&mut sql, idx);
        let date = format_date(row.date);
        let local = escape_sql(&row.local_number);
        if by_network {
            let network = row.network_id.unwrap_or(0);
            let _ = write!(
                sql,
                "({}, {date}, {network}, '{local}')",
                row.customer_id
            );
        } else {
            let _ = write!(sql, "({}, {date}, '{local}')", row.customer_id);
        }
    }

    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 11, 14).expect("valid date")
    }

    #[test]
    fn test_daily_sql_overall() {
        let rows = vec![
            PresenceDailyRow {
                customer_id: 1,
                date: date(),
                count: 2,
                network_id: None,
            },
            PresenceDailyRow {
                customer_id: 2,
                date: date(),
                count: 1,
                network_id: None,
            },
        ];

        assert_eq!(
            daily_sql("telemetry", "presence_daily", &rows, false),
            "INSERT INTO telemetry.presence_daily (customer_id, date, count) VALUES \
             (1, '2023-11-14', 2), (2, '2023-11-14', 1)"
        );
    }

    #[test]
    fn test_daily_sql_by_network() {
        let rows = vec![PresenceDailyRow {
            customer_id: 1,
            date: date(),
            count: 3,
            network_id: Some(9),
        }];

        assert_eq!(
            daily_sql("telemetry", "presence_daily_by_network", &rows, true),
            "INSERT INTO telemetry.presence_daily_by_network \
             (customer_id, date, network_id, count) VALUES (1, '2023-11-14', 9, 3)"
        );
    }

    #[test]
    fn test_instance_sql_overall() {
        let rows = vec![PresenceInstanceRow {
            customer_id: 1,
            date: date(),
            local_number: "37455909314".to_string(),
            network_id: None,
        }];

        assert_eq!(
            instance_sql("telemetry", "presence_instances", &rows, false),
            "INSERT INTO telemetry.presence_instances (customer_id, date, local_number) \
             VALUES (1, '2023-11-14', '37455909314')"
        );
    }

    #[test]
    fn test_instance_sql_by_network_escapes_local_number() {
        let rows = vec![PresenceInstanceRow {
            customer_id: 1,
            date: date(),
            local_number: "o'brien".to_string(),
            network_id: Some(4),
        }];

        let sql = instance_sql("telemetry", "presence_instances_by_network", &rows, true);
        assert!(sql.contains("(1, '2023-11-14', 4, 'o\\'brien')"));
    }
}
