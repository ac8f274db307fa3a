//! Presence aggregation.
//!
//! Buckets a batch of presence pings by tenant and UTC calendar day, builds
//! optional network-scoped counts, and flushes both via concurrent bulk
//! merges. Counts measure ping volume per day, not distinct subscribers;
//! redelivered pings double-count (no dedup by design).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use thiserror::Error;
use tracing::debug;

use crate::customers::CustomerDirectory;
use crate::store::presence::{PresenceDailyRow, PresenceInstanceRow, PresenceStore};
use crate::store::StoreError;

/// One raw presence ping.
#[derive(Debug, Clone)]
pub struct PresencePing {
    pub tenant_prefix: String,
    pub username: String,
    /// Ping time in epoch milliseconds.
    pub created_at_ms: i64,
    pub network: Option<u64>,
}

/// One aggregation cycle's flattened output. Built fresh per cycle and
/// discarded after flush.
#[derive(Debug, Default)]
pub struct PresenceBatch {
    pub daily: Vec<PresenceDailyRow>,
    pub instances: Vec<PresenceInstanceRow>,
}

impl PresenceBatch {
    /// Whether the batch carries no rows at all.
    pub fn is_empty(&self) -> bool {
        self.daily.is_empty() && self.instances.is_empty()
    }
}

/// Failure of a presence flush. The whole input batch is lost; callers must
/// re-derive and retry it, since no partial-commit bookkeeping is kept.
#[derive(Error, Debug)]
#[error("presence flush failed for the whole batch")]
pub struct FlushError(#[from] pub StoreError);

/// Stateless aggregate-then-flush transform over presence pings.
pub struct PresenceAggregator {
    customers: Arc<CustomerDirectory>,
    store: Arc<PresenceStore>,
}

impl PresenceAggregator {
    /// Creates an aggregator over the customer directory and presence store.
    pub fn new(customers: Arc<CustomerDirectory>, store: Arc<PresenceStore>) -> Self {
        Self { customers, store }
    }

    /// Buckets pings by (customer, UTC day) into counts and instance rows.
    ///
    /// Pings with an unresolvable tenant prefix are skipped. With
    /// `by_network`, pings lacking a network id are skipped and buckets are
    /// additionally keyed by network.
    pub fn aggregate(&self, pings: &[PresencePing], by_network: bool) -> PresenceBatch {
        let mut buckets: HashMap<(u64, NaiveDate, Option<u64>), u64> = HashMap::new();
        let mut instances = Vec::new();

        for ping in pings {
            let Some(customer) = self.customers.resolve(&ping.tenant_prefix) else {
                continue;
            };

            let network = if by_network {
                match ping.network {
                    Some(n) => Some(n),
                    None => continue,
                }
            } else {
                None
            };

            let Some(date) = utc_date(ping.created_at_ms) else {
                continue;
            };

            *buckets.entry((customer.id, date, network)).or_default() += 1;
            instances.push(PresenceInstanceRow {
                customer_id: customer.id,
                date,
                local_number: ping.username.clone(),
                network_id: network,
            });
        }

        let mut daily: Vec<PresenceDailyRow> = buckets
            .into_iter()
            .map(|((customer_id, date, network_id), count)| PresenceDailyRow {
                customer_id,
                date,
                count,
                network_id,
            })
            .collect();
        daily.sort_by(|a, b| {
            (a.customer_id, a.date, a.network_id).cmp(&(b.customer_id, b.date, b.network_id))
        });

        PresenceBatch { daily, instances }
    }

    /// Flushes one cycle: the two bulk merges run concurrently and the
    /// operation succeeds only if both do.
    pub async fn flush(
        &self,
        overall: &PresenceBatch,
        network_scoped: &PresenceBatch,
    ) -> Result<(), FlushError> {
        tokio::try_join!(
            self.store.merge_overall(&overall.daily, &overall.instances),
            self.store
                .merge_by_network(&network_scoped.daily, &network_scoped.instances),
        )?;

        Ok(())
    }

    /// Aggregates a batch of pings and flushes it in one cycle.
    pub async fn aggregate_and_flush(
        &self,
        pings: &[PresencePing],
        by_network: bool,
    ) -> Result<(), FlushError> {
        let overall = self.aggregate(pings, false);
        let network_scoped = if by_network {
            self.aggregate(pings, true)
        } else {
            PresenceBatch::default()
        };

        debug!(
            pings = pings.len(),
            daily = overall.daily.len(),
            network_daily = network_scoped.daily.len(),
            "flushing presence cycle"
        );

        self.flush(&overall, &network_scoped).await
    }
}

/// UTC calendar date of an epoch-millisecond timestamp.
fn utc_date(epoch_ms: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(epoch_ms).map(|dt| dt.date_naive())
}
