//! Customer directory.
//!
//! Read-only view of the customer table keyed by tenant prefix. Loaded at
//! startup and replaced wholesale on reload, with the same atomic-swap
//! contract as the taxonomy registry.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// One customer row: numeric id plus its unique short tenant prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub id: u64,
    pub prefix: String,
}

type PrefixMap = HashMap<String, Arc<Customer>>;

/// Prefix-keyed customer lookup.
pub struct CustomerDirectory {
    customers: ArcSwap<PrefixMap>,
}

impl CustomerDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            customers: ArcSwap::from_pointee(PrefixMap::new()),
        }
    }

    /// Replaces the directory contents with the given rows.
    pub fn set_all(&self, rows: Vec<Customer>) {
        let mut map = PrefixMap::with_capacity(rows.len());
        for row in rows {
            map.insert(row.prefix.clone(), Arc::new(row));
        }
        self.customers.store(Arc::new(map));
    }

    /// Resolves a tenant prefix to its customer, if registered.
    pub fn resolve(&self, prefix: &str) -> Option<Arc<Customer>> {
        self.customers.load().get(prefix).cloned()
    }

    /// Number of registered customers.
    pub fn len(&self) -> usize {
        self.customers.load().len()
    }

    /// Whether the directory holds no customers.
    pub fn is_empty(&self) -> bool {
        self.customers.load().is_empty()
    }
}

impl Default for CustomerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_prefix() {
        let dir = CustomerDirectory::new();
        dir.set_all(vec![
            Customer {
                id: 11,
                prefix: "am".to_string(),
            },
            Customer {
                id: 12,
                prefix: "ru".to_string(),
            },
        ]);

        assert_eq!(dir.resolve("am").map(|c| c.id), Some(11));
        assert_eq!(dir.resolve("ru").map(|c| c.id), Some(12));
        assert!(dir.resolve("xx").is_none());
    }

    #[test]
    fn test_set_all_replaces_previous_rows() {
        let dir = CustomerDirectory::new();
        dir.set_all(vec![Customer {
            id: 11,
            prefix: "am".to_string(),
        }]);
        dir.set_all(vec![Customer {
            id: 12,
            prefix: "ru".to_string(),
        }]);

        assert!(dir.resolve("am").is_none());
        assert_eq!(dir.len(), 1);
    }
}
