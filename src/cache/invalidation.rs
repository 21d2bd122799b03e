// Dependency tracking for invalidation: table reference → fingerprints of
// entries that read it.

use crate::common::TableRef;
use crate::plan::Fingerprint;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct DependencyIndex {
    table_to_keys: RwLock<HashMap<TableRef, HashSet<Fingerprint>>>,
    key_to_tables: RwLock<HashMap<Fingerprint, Vec<TableRef>>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: Fingerprint, dependencies: &[TableRef]) {
        let mut table_map = self.table_to_keys.write();
        for table in dependencies {
            table_map.entry(table.clone()).or_default().insert(key);
        }
        self.key_to_tables
            .write()
            .insert(key, dependencies.to_vec());
    }

    /// Fingerprints invalidated by a write to `table`. The mappings for
    /// those keys are removed as a side effect.
    pub fn take_dependents(&self, table: &TableRef) -> Vec<Fingerprint> {
        let keys: Vec<Fingerprint> = {
            let mut table_map = self.table_to_keys.write();
            table_map
                .remove(table)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default()
        };
        for key in &keys {
            self.forget(*key);
        }
        keys
    }

    /// Drop all mappings for an evicted or invalidated entry.
    pub fn forget(&self, key: Fingerprint) {
        let tables = self.key_to_tables.write().remove(&key);
        if let Some(tables) = tables {
            let mut table_map = self.table_to_keys.write();
            for table in tables {
                if let Some(set) = table_map.get_mut(&table) {
                    set.remove(&key);
                    if set.is_empty() {
                        table_map.remove(&table);
                    }
                }
            }
        }
    }

    pub fn clear(&self) {
        self.table_to_keys.write().clear();
        self.key_to_tables.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint([byte; 32])
    }

    #[test]
    fn test_take_dependents() {
        let index = DependencyIndex::new();
        let users = TableRef::new("pg", "users");
        let orders = TableRef::new("pg", "orders");
        index.register(fp(1), &[users.clone()]);
        index.register(fp(2), &[users.clone(), orders.clone()]);
        index.register(fp(3), &[orders.clone()]);

        let mut invalidated = index.take_dependents(&users);
        invalidated.sort();
        assert_eq!(invalidated, vec![fp(1), fp(2)]);

        // fp(2) is gone entirely, so an orders write only touches fp(3)
        let invalidated = index.take_dependents(&orders);
        assert_eq!(invalidated, vec![fp(3)]);
    }

    #[test]
    fn test_forget_removes_reverse_mappings() {
        let index = DependencyIndex::new();
        let users = TableRef::new("pg", "users");
        index.register(fp(1), &[users.clone()]);
        index.forget(fp(1));
        assert!(index.take_dependents(&users).is_empty());
    }
}
