use crate::{db::DeleteOptions, instance::Instance, schema::EntityDef, value::Value};
use std::{collections::BTreeMap, sync::Arc};

///
/// SaveHookArgs
///
/// Mutable view of a pending save handed to `before_save`. Changes staged
/// here propagate into the written change set. `primary_id` is `None` for
/// creates (the id may not exist yet when the hook runs).
///

pub struct SaveHookArgs<'a> {
    pub entity: &'a EntityDef,
    pub primary_id: Option<&'a str>,
    pub changes: &'a mut BTreeMap<String, Value>,
}

///
/// MutationHook
///
/// Ordered per-entity mutation hooks. Hooks run only when a save or delete
/// actually dispatches a backend write; no-op saves skip them entirely.
///

pub trait MutationHook: Send + Sync {
    fn before_save(&self, _save: &mut SaveHookArgs<'_>) {}

    fn after_save(&self, _instance: &Arc<Instance>) {}

    fn before_delete(&self, _primary_id: &str, _options: &DeleteOptions) {}

    fn after_delete(&self, _primary_id: &str, _options: &DeleteOptions) {}
}
