use crate::instance::Instance;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

///
/// InstanceCache
///
/// Context-scoped identity map from (entity, primary id) to the one live
/// instance for that record. Guarantees reference identity: within one
/// context, two lookups of the same id return the same allocation.
///

#[derive(Debug, Default)]
pub struct InstanceCache {
    map: Mutex<HashMap<(String, String), Arc<Instance>>>,
}

impl InstanceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, entity: &str, primary_id: &str) -> Option<Arc<Instance>> {
        self.map
            .lock()
            .expect("cache lock")
            .get(&(entity.to_string(), primary_id.to_string()))
            .cloned()
    }

    /// Write-through: replaces any previous instance for the id.
    pub fn insert(&self, instance: Arc<Instance>) {
        self.map.lock().expect("cache lock").insert(
            (instance.entity_name().to_string(), instance.primary_id()),
            instance,
        );
    }

    pub fn invalidate(&self, entity: &str, primary_id: &str) {
        self.map
            .lock()
            .expect("cache lock")
            .remove(&(entity.to_string(), primary_id.to_string()));
    }

    pub fn clear(&self) {
        self.map.lock().expect("cache lock").clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().expect("cache lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().expect("cache lock").is_empty()
    }
}
