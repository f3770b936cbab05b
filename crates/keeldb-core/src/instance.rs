use crate::{
    error::Error,
    key::PrimaryId,
    schema::EntityDef,
    store::Item,
    value::Value,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

///
/// CapacityScope
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CapacityScope {
    Own,
    WithRelated,
}

///
/// CapacityReport
///

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CapacityReport {
    pub read: f64,
    pub write: f64,
}

#[derive(Debug, Default)]
struct CapacityTally {
    read: f64,
    write: f64,
    related_read: f64,
    related_write: f64,
}

///
/// Instance
///
/// One materialized record, owned by its originating request context. The
/// instance cache hands out `Arc` clones of the same allocation, so two
/// lookups of the same primary id inside one context compare reference-
/// equal. The raw stored map is kept as last observed; setters only touch
/// the change map.
///

#[derive(Debug)]
pub struct Instance {
    entity: Arc<EntityDef>,
    primary_id: PrimaryId,
    exists: bool,
    raw: Item,
    values: BTreeMap<String, Value>,
    changes: Mutex<BTreeMap<String, Value>>,
    relations: Mutex<BTreeMap<String, Option<Arc<Instance>>>>,
    capacity: Mutex<CapacityTally>,
}

impl Instance {
    /// Decode a stored item into an instance. Reserved attributes stay in
    /// the raw map; declared fields decode through the field kernel.
    pub(crate) fn materialize(
        entity: Arc<EntityDef>,
        primary_id: PrimaryId,
        raw: Item,
    ) -> Result<Self, Error> {
        let mut values = BTreeMap::new();
        for field in entity.fields() {
            if let Some(scalar) = raw.get(&field.name) {
                values.insert(field.name.clone(), field.decode_storage(scalar)?);
            }
        }

        Ok(Self {
            entity,
            primary_id,
            exists: true,
            raw,
            values,
            changes: Mutex::new(BTreeMap::new()),
            relations: Mutex::new(BTreeMap::new()),
            capacity: Mutex::new(CapacityTally::default()),
        })
    }

    /// Sentinel for a lookup that found nothing. Not an error condition.
    pub(crate) fn missing(entity: Arc<EntityDef>, primary_id: PrimaryId) -> Self {
        Self {
            entity,
            primary_id,
            exists: false,
            raw: Item::new(),
            values: BTreeMap::new(),
            changes: Mutex::new(BTreeMap::new()),
            relations: Mutex::new(BTreeMap::new()),
            capacity: Mutex::new(CapacityTally::default()),
        }
    }

    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity.name
    }

    #[must_use]
    pub(crate) const fn entity(&self) -> &Arc<EntityDef> {
        &self.entity
    }

    /// Opaque primary id text (`pk##__SK__##sk` when composite).
    #[must_use]
    pub fn primary_id(&self) -> String {
        self.primary_id.to_string()
    }

    #[must_use]
    pub(crate) const fn id(&self) -> &PrimaryId {
        &self.primary_id
    }

    /// False for the sentinel returned by failed lookups.
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.exists
    }

    /// Current value of a field: pending change if one is staged, else the
    /// stored value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<Value> {
        if let Some(changed) = self.changes.lock().expect("instance lock").get(field) {
            return Some(changed.clone());
        }
        self.values.get(field).cloned()
    }

    /// Stage a field change. Validated and normalized through the field
    /// kernel; nothing hits the backend until the instance is saved.
    pub fn set(&self, field: &str, value: Value) -> Result<(), Error> {
        let def = self
            .entity
            .field_def(field)
            .ok_or_else(|| crate::expr::QueryError::UnknownField {
                entity: self.entity.name.clone(),
                field: field.to_string(),
            })
            .map_err(Error::Query)?;

        let normalized = def.normalize(value)?;
        self.changes
            .lock()
            .expect("instance lock")
            .insert(field.to_string(), normalized);

        Ok(())
    }

    /// Stored value of a field as last observed, ignoring staged changes.
    #[must_use]
    pub fn stored(&self, field: &str) -> Option<Value> {
        self.values.get(field).cloned()
    }

    /// Snapshot of staged changes.
    #[must_use]
    pub fn changes(&self) -> BTreeMap<String, Value> {
        self.changes.lock().expect("instance lock").clone()
    }

    pub(crate) fn clear_changes(&self) {
        self.changes.lock().expect("instance lock").clear();
    }

    /// Resolved relation, if `load_related` ran for this field.
    /// `Some(None)` means the relation loaded and was absent.
    #[must_use]
    pub fn related(&self, field: &str) -> Option<Option<Arc<Self>>> {
        self.relations
            .lock()
            .expect("instance lock")
            .get(field)
            .cloned()
    }

    pub(crate) fn set_related(&self, field: &str, target: Option<Arc<Self>>) {
        self.relations
            .lock()
            .expect("instance lock")
            .insert(field.to_string(), target);
    }

    /// Capacity consumed by operations that touched this instance.
    #[must_use]
    pub fn consumed_capacity(&self, scope: CapacityScope) -> CapacityReport {
        let tally = self.capacity.lock().expect("instance lock");
        match scope {
            CapacityScope::Own => CapacityReport {
                read: tally.read,
                write: tally.write,
            },
            CapacityScope::WithRelated => CapacityReport {
                read: tally.read + tally.related_read,
                write: tally.write + tally.related_write,
            },
        }
    }

    pub(crate) fn add_read_capacity(&self, units: f64) {
        self.capacity.lock().expect("instance lock").read += units;
    }

    pub(crate) fn add_write_capacity(&self, units: f64) {
        self.capacity.lock().expect("instance lock").write += units;
    }

    pub(crate) fn add_related_read_capacity(&self, units: f64) {
        self.capacity.lock().expect("instance lock").related_read += units;
    }

    #[must_use]
    pub(crate) const fn raw(&self) -> &Item {
        &self.raw
    }
}
