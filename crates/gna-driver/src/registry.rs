//! Per-session table of mapped memory contexts.
//!
//! One registry type serves both protocols: the legacy one-model-per-session
//! protocol is a registry with [`RegistryScope::Single`].

use crate::config::RegistryScope;
use crate::error::{GnaError, Result};
use crate::memory::{MemoryContext, MemoryId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifier → memory context, bounded by the scope's capacity.
#[derive(Debug)]
pub struct MemoryRegistry {
    scope: RegistryScope,
    entries: BTreeMap<MemoryId, Arc<MemoryContext>>,
}

impl MemoryRegistry {
    /// Empty registry
    pub const fn new(scope: RegistryScope) -> Self {
        Self {
            scope,
            entries: BTreeMap::new(),
        }
    }

    /// Table shape
    pub const fn scope(&self) -> RegistryScope {
        self.scope
    }

    /// Smallest unused identifier (identifiers start at 1).
    ///
    /// # Errors
    ///
    /// `RegistryFull` when every slot is taken.
    pub fn reserve_id(&self) -> Result<MemoryId> {
        let capacity = self.scope.capacity();
        if self.entries.len() >= capacity {
            return Err(GnaError::RegistryFull { capacity });
        }
        let mut candidate: MemoryId = 1;
        for &id in self.entries.keys() {
            if id != candidate {
                break;
            }
            candidate += 1;
        }
        Ok(candidate)
    }

    /// Store a mapped context under its identifier.
    ///
    /// # Errors
    ///
    /// `RegistryFull` when the table is full, `InvalidParameter` when the
    /// identifier is already taken.
    pub fn insert(&mut self, context: Arc<MemoryContext>) -> Result<MemoryId> {
        let capacity = self.scope.capacity();
        if self.entries.len() >= capacity {
            return Err(GnaError::RegistryFull { capacity });
        }
        let id = context.id();
        if self.entries.contains_key(&id) {
            return Err(GnaError::invalid_parameter(format!("memory {id} already mapped")));
        }
        self.entries.insert(id, context);
        Ok(id)
    }

    /// Context mapped under `id`
    pub fn get(&self, id: MemoryId) -> Option<Arc<MemoryContext>> {
        self.entries.get(&id).cloned()
    }

    /// Remove and return the context mapped under `id`
    pub fn remove(&mut self, id: MemoryId) -> Option<Arc<MemoryContext>> {
        self.entries.remove(&id)
    }

    /// Remove every context
    pub fn drain(&mut self) -> Vec<Arc<MemoryContext>> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Number of mapped contexts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;
    use gna_chip::descriptor::PAGE_SIZE;

    const BASE: u64 = 0x10_0000;

    fn mapped(platform: &SimPlatform, registry: &MemoryRegistry, slot: u64) -> Arc<MemoryContext> {
        let id = registry.reserve_id().unwrap();
        let address = BASE + slot * PAGE_SIZE as u64;
        Arc::new(MemoryContext::map(platform, id, address, PAGE_SIZE).unwrap())
    }

    #[test]
    fn ids_fill_the_lowest_gap() {
        let platform = SimPlatform::new();
        platform.add_user_region(BASE, 8 * PAGE_SIZE);
        let mut registry = MemoryRegistry::new(RegistryScope::Multi { capacity: 4 });

        for slot in 0..3 {
            let ctx = mapped(&platform, &registry, slot);
            registry.insert(ctx).unwrap();
        }
        assert_eq!(registry.len(), 3);
        registry.remove(2).unwrap();
        assert_eq!(registry.reserve_id().unwrap(), 2);
    }

    #[test]
    fn legacy_scope_holds_one_context() {
        let platform = SimPlatform::new();
        platform.add_user_region(BASE, 2 * PAGE_SIZE);
        let mut registry = MemoryRegistry::new(RegistryScope::Single);

        let first = mapped(&platform, &registry, 0);
        assert_eq!(registry.insert(first).unwrap(), 1);
        assert_eq!(
            registry.reserve_id(),
            Err(GnaError::RegistryFull { capacity: 1 })
        );

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
        assert_eq!(registry.reserve_id().unwrap(), 1);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let platform = SimPlatform::new();
        platform.add_user_region(BASE, 2 * PAGE_SIZE);
        let mut registry = MemoryRegistry::new(RegistryScope::default());

        let a = mapped(&platform, &registry, 0);
        let b = Arc::new(MemoryContext::map(&platform, 1, BASE + PAGE_SIZE as u64, PAGE_SIZE).unwrap());
        registry.insert(a).unwrap();
        assert!(matches!(registry.insert(b), Err(GnaError::InvalidParameter { .. })));
    }
}
