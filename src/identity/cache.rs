//! Identity cache client.
//!
//! Async redis wrapper over the subscriber hash: one `HGET` per unresolved
//! event, field keyed by the subscriber's raw id. Records are JSON-encoded
//! by the upstream platform.

use std::fmt;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;

/// Handle to the subscriber record hash in the external cache.
pub struct IdentityCache {
    conn: ConnectionManager,
    hash_key: String,
}

impl IdentityCache {
    /// Opens a managed connection to the cache.
    pub async fn connect(url: &str, hash_key: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            hash_key: hash_key.to_string(),
        })
    }

    /// Fetches the raw record for a subscriber, if present.
    pub async fn lookup(&self, raw_id: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.hget(&self.hash_key, raw_id).await
    }
}

/// Subscriber record as stored by the platform. Only the country block is
/// read here; the rest of the record belongs to other services.
#[derive(Debug, Deserialize)]
pub struct CachedSubscriber {
    #[serde(default)]
    pub country: Option<CachedCountry>,
}

/// Country block of a cached subscriber record.
#[derive(Debug, Deserialize)]
pub struct CachedCountry {
    #[serde(rename = "sortName", default)]
    pub sort_name: Option<String>,
    #[serde(rename = "regionCode", default)]
    pub region_code: Option<NumericCode>,
}

/// The embedded numeric code arrives as a number or a string depending on
/// which upstream writer produced the record.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum NumericCode {
    Int(u64),
    Text(String),
}

impl fmt::Display for NumericCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl CachedSubscriber {
    /// Extracts the region code, preferring the explicit short country name
    /// over the embedded numeric code.
    pub fn region_code(&self) -> Option<String> {
        let country = self.country.as_ref()?;
        if let Some(name) = &country.sort_name {
            if !name.is_empty() {
                return Some(name.clone());
            }
        }
        country.region_code.as_ref().map(|c| c.to_string())
    }
}

/// Decodes a raw cache payload into a subscriber record.
pub fn decode(payload: &str) -> Result<CachedSubscriber, serde_json::Error> {
    serde_json::from_str(payload)
}
