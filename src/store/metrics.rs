//! Metric writer.
//!
//! Persists one classified event as an additive counter merge into the
//! `metric_counters` table. The row key is (customer, metric type, context
//! type, region, date bucket, network); the value column sums on merge, so
//! application order is irrelevant to correctness.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use clickhouse_rs::Pool;

use crate::export::health::HealthMetrics;
use crate::ingest::ClassifiedEvent;

use super::{escape_sql, format_date, StoreError};

/// Writes classified events to the counter table.
pub struct MetricWriter {
    pool: Pool,
    database: String,
    health: Option<Arc<HealthMetrics>>,
}

impl MetricWriter {
    /// Creates a new metric writer over the shared pool.
    pub fn new(pool: Pool, database: String, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            pool,
            database,
            health,
        }
    }

    /// Issues one additive-upsert for the event.
    ///
    /// Pure increment: redelivery of the same logical event double-counts.
    /// No in-core retry on failure.
    pub async fn write(&self, event: &ClassifiedEvent) -> Result<(), StoreError> {
        let sql = insert_sql(&self.database, event);

        let mut handle = self.pool.get_handle().await?;

        if let Err(e) = handle.execute(sql.as_str()).await {
            self.record_error();
            return Err(e.into());
        }

        Ok(())
    }

    fn record_error(&self) {
        if let Some(health) = &self.health {
            health
                .store_write_errors
                .with_label_values(&["metric_counters"])
                .inc();
        }
    }
}

/// UTC calendar date bucket for an event timestamp.
fn date_bucket(timestamp_secs: i64) -> NaiveDate {
    DateTime::from_timestamp(timestamp_secs, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

fn insert_sql(database: &str, event: &ClassifiedEvent) -> String {
    let date = format_date(date_bucket(event.timestamp_secs));
    let local = escape_sql(&event.sender_local_id);
    let region = escape_sql(&event.region_code);
    let network = event.network_id.unwrap_or(0);

    format!(
        "INSERT INTO {database}.metric_counters (\
         customer_id, metric_type_id, metric_context_type_id, sender_local_id, \
         region_code, date, network_id, value\
         ) VALUES ({}, {}, {}, '{local}', '{region}', {date}, {network}, {})",
        event.customer_id, event.metric_type_id, event.metric_context_type_id, event.value,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ClassifiedEvent {
        ClassifiedEvent {
            customer_id: 77,
            metric_type_id: 2,
            metric_context_type_id: 20,
            region_code: "AM".to_string(),
            network_id: Some(5),
            sender_local_id: "37455909314".to_string(),
            timestamp_secs: 1_700_000_000,
            value: 42,
        }
    }

    #[test]
    fn test_date_bucket() {
        // 2023-11-14T22:13:20Z
        assert_eq!(
            date_bucket(1_700_000_000),
            NaiveDate::from_ymd_opt(2023, 11, 14).expect("valid date")
        );
        assert_eq!(
            date_bucket(0),
            NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid date")
        );
    }

    #[test]
    fn test_insert_sql() {
        let sql = insert_sql("telemetry", &event());
        assert_eq!(
            sql,
            "INSERT INTO telemetry.metric_counters (\
             customer_id, metric_type_id, metric_context_type_id, sender_local_id, \
             region_code, date, network_id, value\
             ) VALUES (77, 2, 20, '37455909314', 'AM', '2023-11-14', 5, 42)"
        );
    }

    #[test]
    fn test_insert_sql_without_network() {
        let mut e = event();
        e.network_id = None;
        let sql = insert_sql("telemetry", &e);
        assert!(sql.contains("'2023-11-14', 0, 42)"));
    }

    #[test]
    fn test_insert_sql_escapes_strings() {
        let mut e = event();
        e.region_code = "A'M".to_string();
        let sql = insert_sql("telemetry", &e);
        assert!(sql.contains("'A\\'M'"));
    }
}
