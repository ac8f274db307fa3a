//! Telemetry ingestion and presence-aggregation pipeline.
//!
//! Consumes call/message activity frames from a messaging platform,
//! classifies them against a customer-specific metric taxonomy, resolves
//! the sender's tenant and region, and turns raw events into durable
//! counters plus daily presence aggregates. Delivery is at-least-once end
//! to end; counter merges are additive, so redelivery double-counts and
//! order never matters.

pub mod agent;
pub mod config;
pub mod customers;
pub mod export;
pub mod identity;
pub mod ingest;
pub mod migrate;
pub mod presence;
pub mod store;
pub mod taxonomy;
