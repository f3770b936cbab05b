use crate::{
    field::FieldKind,
    key,
    schema::{EntityDef, KeyField, SchemaError},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
};

///
/// RegistryBuilder
///
/// Collects entity definitions, then validates and seals them as one unit.
/// Registration errors are fatal: a builder that failed finalization is
/// consumed and the registry never comes into existence half-formed.
///

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entities: BTreeMap<String, EntityDef>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: EntityDef) -> Result<(), SchemaError> {
        if self.entities.contains_key(&def.name) {
            return Err(SchemaError::DuplicateEntity {
                entity: def.name.clone(),
            });
        }
        if let Some(other) = self
            .entities
            .values()
            .find(|existing| existing.prefix == def.prefix)
        {
            return Err(SchemaError::DuplicatePrefix {
                prefix: def.prefix.clone(),
                other: other.name.clone(),
            });
        }

        self.entities.insert(def.name.clone(), def);
        Ok(())
    }

    /// Validate every definition (including cross-entity references) and
    /// produce the immutable registry.
    pub fn finalize(mut self) -> Result<Registry, SchemaError> {
        let names: BTreeSet<String> = self.entities.keys().cloned().collect();

        let mut sealed = BTreeMap::new();
        for (name, mut def) in std::mem::take(&mut self.entities) {
            let (physical_attrs, indexes_by_field) = validate_entity(&names, &def)?;

            // primary-key components are implicitly required
            let mut key_fields = Vec::new();
            if let Some(f) = def.primary_key.partition.field_name() {
                key_fields.push(f.to_string());
            }
            if let Some(KeyField::Field(f)) = &def.primary_key.sort {
                key_fields.push(f.clone());
            }
            for field in key_fields {
                if let Some(fd) = def.field_def_mut(&field) {
                    fd.required = true;
                }
            }

            def.seal(physical_attrs, indexes_by_field);
            sealed.insert(name, Arc::new(def));
        }

        Ok(Registry { entities: sealed })
    }
}

///
/// Registry
///
/// Immutable, process-wide view of every registered entity. Safe to share
/// across contexts; nothing mutates after finalization.
///

#[derive(Clone, Debug)]
pub struct Registry {
    entities: BTreeMap<String, Arc<EntityDef>>,
}

impl Registry {
    pub fn entity(&self, name: &str) -> Result<Arc<EntityDef>, SchemaError> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownEntity {
                entity: name.to_string(),
            })
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDef>> {
        self.entities.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[allow(clippy::too_many_lines)]
fn validate_entity(
    all_entities: &BTreeSet<String>,
    entity: &EntityDef,
) -> Result<(BTreeSet<String>, BTreeMap<String, Vec<String>>), SchemaError> {
    let invalid = |rule: String| SchemaError::Invalid {
        entity: entity.name.clone(),
        rule,
    };

    if entity.prefix.is_empty() {
        return Err(invalid("entity prefix must be non-empty".to_string()));
    }
    if entity.prefix.contains('#') {
        return Err(invalid("entity prefix must not contain '#'".to_string()));
    }

    // ── Fields ─────────────────────────────────────────────────────
    let mut seen = HashSet::new();
    let mut version_fields = 0usize;

    for field in entity.fields() {
        if field.name.is_empty() {
            return Err(invalid("field names must be non-empty".to_string()));
        }
        if field.name.starts_with('_') {
            return Err(invalid(format!(
                "field {} must not begin with '_'",
                field.name
            )));
        }
        if field.name.contains('#') {
            return Err(invalid(format!("field {} must not contain '#'", field.name)));
        }
        if field.name == key::MODEL_PREFIX_SENTINEL {
            return Err(invalid(format!(
                "field name {} is reserved",
                key::MODEL_PREFIX_SENTINEL
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(invalid(format!("field {} is declared twice", field.name)));
        }

        if matches!(field.kind, FieldKind::TtlInstant) && field.name != key::TTL_ATTR {
            return Err(invalid(format!(
                "ttl-instant field must be named {}, not {}",
                key::TTL_ATTR,
                field.name
            )));
        }
        if matches!(field.kind, FieldKind::VersionUlid) {
            version_fields += 1;
        }
        if let FieldKind::RelatedRef { target } = &field.kind
            && !all_entities.contains(target)
        {
            return Err(invalid(format!(
                "field {} references unknown entity {target}",
                field.name
            )));
        }
    }

    if version_fields > 1 {
        return Err(invalid(
            "at most one version-ulid field is allowed".to_string(),
        ));
    }

    let resolve = |component: &KeyField, context: &str| -> Result<(), SchemaError> {
        match component {
            KeyField::ModelPrefix => Ok(()),
            KeyField::Field(name) => {
                if entity.field_def(name).is_some() {
                    Ok(())
                } else {
                    Err(invalid(format!("{context} names unknown field {name}")))
                }
            }
        }
    };

    // ── Primary key ────────────────────────────────────────────────
    resolve(&entity.primary_key.partition, "primary key partition")?;
    if let Some(sort) = &entity.primary_key.sort {
        resolve(sort, "primary key sort")?;
    }

    // ── Secondary indexes ──────────────────────────────────────────
    let mut slots = HashSet::new();
    let mut indexes_by_field: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, index) in &entity.indexes {
        resolve(&index.partition, &format!("index {name} partition"))?;
        resolve(&index.sort, &format!("index {name} sort"))?;

        if !slots.insert(index.slot) {
            return Err(invalid(format!(
                "index slot {} is assigned twice",
                index.slot.token()
            )));
        }

        for component in [&index.partition, &index.sort] {
            if let KeyField::Field(field) = component {
                let entry = indexes_by_field.entry(field.clone()).or_default();
                if !entry.contains(name) {
                    entry.push(name.clone());
                }
            }
        }
    }

    // ── Uniqueness constraints ─────────────────────────────────────
    let mut unique_slots = HashSet::new();

    for (name, unique) in &entity.unique {
        let Some(field) = entity.field_def(&unique.field) else {
            return Err(invalid(format!(
                "unique constraint {name} names unknown field {}",
                unique.field
            )));
        };
        if matches!(field.kind, FieldKind::Blob) {
            return Err(invalid(format!(
                "unique constraint {name} cannot target a binary-blob field"
            )));
        }
        if !unique_slots.insert(unique.slot) {
            return Err(invalid(format!(
                "unique slot {} is assigned twice",
                unique.slot.token()
            )));
        }
    }

    // ── Iteration ──────────────────────────────────────────────────
    if entity.iteration.buckets == 0 {
        return Err(invalid("iteration buckets must be positive".to_string()));
    }

    // ── Physical attribute footprint ───────────────────────────────
    let mut physical_attrs: BTreeSet<String> =
        [key::ATTR_PK, key::ATTR_SK].map(String::from).into();

    for index in entity.indexes.values() {
        if !entity.is_primary_alias(index) {
            physical_attrs.insert(index.slot.partition_attr().to_string());
            physical_attrs.insert(index.slot.sort_attr().to_string());
        }
    }
    if entity.iteration.iterable {
        physical_attrs.insert(key::ATTR_ITER_PK.to_string());
        physical_attrs.insert(key::ATTR_ITER_SK.to_string());
    }
    physical_attrs.insert(key::ATTR_TENANT.to_string());
    for field in entity.fields() {
        physical_attrs.insert(field.name.clone());
    }

    Ok((physical_attrs, indexes_by_field))
}
