//! Metric taxonomy registry.
//!
//! Holds the canonical set of metric types, each owning a name-keyed set of
//! context types. The whole map is replaced atomically: readers racing a
//! `set_all` observe either the fully-old or the fully-new map, never a
//! partial one.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;

/// Sub-classification within a metric type (e.g. call action RINGING/END).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricContextType {
    pub id: u32,
    pub name: String,
}

/// Canonical telemetry category with its name-keyed context types.
#[derive(Debug, Clone)]
pub struct MetricType {
    pub id: u32,
    pub name: String,
    pub contexts: HashMap<String, MetricContextType>,
}

impl MetricType {
    /// Looks up a context type by name.
    pub fn context(&self, name: &str) -> Option<&MetricContextType> {
        self.contexts.get(name)
    }
}

/// One metric type as delivered by the startup bulk-load: contexts arrive as
/// an ordered list and are converted to a name-keyed map on install.
#[derive(Debug, Clone)]
pub struct MetricTypeRow {
    pub id: u32,
    pub name: String,
    pub contexts: Vec<MetricContextType>,
}

/// Lookup failure for a metric type name absent from the registry.
///
/// Event-scoped: callers drop and log the offending event, never the process.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown metric type: {name}")]
pub struct UnknownMetricError {
    pub name: String,
}

type TypeMap = HashMap<String, Arc<MetricType>>;

/// Registry of metric types behind an atomic whole-map pointer swap.
pub struct TaxonomyRegistry {
    types: ArcSwap<TypeMap>,
}

impl TaxonomyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            types: ArcSwap::from_pointee(TypeMap::new()),
        }
    }

    /// Replaces the entire registry with the given set.
    ///
    /// Full replace, not an incremental merge: callers must supply a
    /// complete, consistent set. Types absent from `rows` become
    /// unreachable after the swap.
    pub fn set_all(&self, rows: Vec<MetricTypeRow>) {
        let mut map = TypeMap::with_capacity(rows.len());
        for row in rows {
            let entry = build_type(row);
            map.insert(entry.name.clone(), Arc::new(entry));
        }
        self.types.store(Arc::new(map));
    }

    /// Merges a single type into the existing map (admin edits).
    pub fn set_one(&self, row: MetricTypeRow) {
        let mut map = TypeMap::clone(&self.types.load_full());
        let entry = build_type(row);
        map.insert(entry.name.clone(), Arc::new(entry));
        self.types.store(Arc::new(map));
    }

    /// Returns the metric type registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<MetricType>, UnknownMetricError> {
        self.types
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownMetricError {
                name: name.to_string(),
            })
    }

    /// Returns only the numeric id registered under `name`.
    pub fn get_id(&self, name: &str) -> Result<u32, UnknownMetricError> {
        self.get(name).map(|t| t.id)
    }

    /// Membership test for upstream validators.
    pub fn contains(&self, name: &str) -> bool {
        self.types.load().contains_key(name)
    }

    /// Removes an entry (admin/test only).
    pub fn remove(&self, name: &str) {
        let mut map = TypeMap::clone(&self.types.load_full());
        map.remove(name);
        self.types.store(Arc::new(map));
    }

    /// Number of registered metric types.
    pub fn len(&self) -> usize {
        self.types.load().len()
    }

    /// Whether the registry holds no types.
    pub fn is_empty(&self) -> bool {
        self.types.load().is_empty()
    }
}

impl Default for TaxonomyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_type(row: MetricTypeRow) -> MetricType {
    let mut contexts = HashMap::with_capacity(row.contexts.len());
    for ctx in row.contexts {
        contexts.insert(ctx.name.clone(), ctx);
    }
    MetricType {
        id: row.id,
        name: row.name,
        contexts,
    }
}
