//! Event classification.
//!
//! Derives a metric label from a decoded packet, resolves it against the
//! taxonomy registry, attributes the event to a customer via the sender's
//! tenant prefix, and attaches the sender's region. The label text matches
//! the legacy string-concatenation rule exactly; only its expression as an
//! exhaustive match is new.

use std::sync::Arc;

use thiserror::Error;

use crate::customers::CustomerDirectory;
use crate::identity::{IdentityError, IdentityResolver};
use crate::taxonomy::{TaxonomyRegistry, UnknownMetricError};

use super::frame::{parse_frame, EventPacket, FrameError};

/// One classified event, ready for the metric writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub customer_id: u64,
    pub metric_type_id: u32,
    pub metric_context_type_id: u32,
    pub region_code: String,
    pub network_id: Option<u64>,
    pub sender_local_id: String,
    pub timestamp_secs: i64,
    pub value: i64,
}

/// Classification failures. Every variant is event-scoped: the frame is
/// dropped, the pipeline keeps running.
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    UnknownMetric(#[from] UnknownMetricError),

    #[error("unknown context type {context} for metric {metric}")]
    UnknownContext { metric: String, context: String },

    #[error("no customer registered for tenant prefix {prefix}")]
    UnknownTenant { prefix: String },

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl ClassifyError {
    /// Unattributable events are dropped without a log line; taxonomy and
    /// identity failures are logged (schema skew and cache health are worth
    /// seeing).
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Frame(_) | Self::UnknownTenant { .. })
    }

    /// Stable label for the drop counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Frame(_) => "malformed_frame",
            Self::UnknownMetric(_) => "unknown_metric",
            Self::UnknownContext { .. } => "unknown_context",
            Self::UnknownTenant { .. } => "unknown_tenant",
            Self::Identity(IdentityError::EmptyUser { .. }) => "empty_user",
            Self::Identity(IdentityError::InvalidUserData { .. }) => "invalid_user_data",
            Self::Identity(IdentityError::EmptyRegionCode { .. }) => "empty_region_code",
            Self::Identity(IdentityError::Cache(_)) => "cache",
        }
    }
}

/// Derives the (label, context label, value) triple for a packet.
///
/// Legacy text preserved: `MSG` / `GROUP_MSG` for messages with the frame's
/// context verbatim; `{ctx}_CALL` for calls with the meta action as context
/// and, when a duration is present, a `DURATION_` prefix with the duration
/// as value. The group flag never reaches call labels (the legacy rule
/// assigned over it).
fn derive(packet: &EventPacket) -> (String, String, i64) {
    match packet {
        EventPacket::Message(m) => {
            let label = if m.group { "GROUP_MSG" } else { "MSG" };
            (label.to_string(), m.context.clone(), 1)
        }

        EventPacket::Call(c) => {
            let context = c.action.clone().unwrap_or_else(|| c.context.clone());
            match c.duration {
                Some(duration) => (format!("DURATION_{}_CALL", c.context), context, duration),
                None => (format!("{}_CALL", c.context), context, 1),
            }
        }
    }
}

/// Classifier over the shared registry, customer directory and resolver.
pub struct Classifier {
    registry: Arc<TaxonomyRegistry>,
    customers: Arc<CustomerDirectory>,
    resolver: Arc<IdentityResolver>,
}

impl Classifier {
    /// Creates a classifier over the given lookups.
    pub fn new(
        registry: Arc<TaxonomyRegistry>,
        customers: Arc<CustomerDirectory>,
        resolver: Arc<IdentityResolver>,
    ) -> Self {
        Self {
            registry,
            customers,
            resolver,
        }
    }

    /// Decodes and classifies one text frame.
    pub async fn classify_frame(&self, text: &str) -> Result<ClassifiedEvent, ClassifyError> {
        let packet = parse_frame(text)?;
        self.classify(&packet).await
    }

    /// Classifies a decoded packet.
    pub async fn classify(&self, packet: &EventPacket) -> Result<ClassifiedEvent, ClassifyError> {
        let (label, context, value) = derive(packet);

        let metric = self.registry.get(&label)?;
        let metric_context =
            metric
                .context(&context)
                .ok_or_else(|| ClassifyError::UnknownContext {
                    metric: label.clone(),
                    context: context.clone(),
                })?;

        let identity = self.resolver.resolve(packet.sender(), true).await?;

        let customer = self
            .customers
            .resolve(&identity.prefix)
            .ok_or_else(|| ClassifyError::UnknownTenant {
                prefix: identity.prefix.clone(),
            })?;

        Ok(ClassifiedEvent {
            customer_id: customer.id,
            metric_type_id: metric.id,
            metric_context_type_id: metric_context.id,
            region_code: identity.region_code.unwrap_or_default(),
            network_id: packet.network(),
            sender_local_id: identity.local_number,
            timestamp_secs: packet.timestamp_ms() / 1000,
            value,
        })
    }
}
