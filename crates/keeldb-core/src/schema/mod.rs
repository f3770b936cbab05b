pub(crate) mod registry;


pub use registry::{Registry, RegistryBuilder};

use crate::field::FieldDef;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error as ThisError;

///
/// SchemaError
///

#[derive(Clone, Debug, ThisError)]
pub enum SchemaError {
    #[error("entity {entity}: {rule}")]
    Invalid { entity: String, rule: String },

    #[error("entity {entity} is already registered")]
    DuplicateEntity { entity: String },

    #[error("prefix {prefix} is already used by entity {other}")]
    DuplicatePrefix { prefix: String, other: String },

    #[error("entity {entity} is not registered")]
    UnknownEntity { entity: String },
}

///
/// KeyField
///
/// A key-component reference: either a declared field or the sentinel that
/// substitutes the entity prefix as a literal key component.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyField {
    Field(String),
    ModelPrefix,
}

impl KeyField {
    #[must_use]
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    #[must_use]
    pub fn field_name(&self) -> Option<&str> {
        match self {
            Self::Field(name) => Some(name),
            Self::ModelPrefix => None,
        }
    }
}

///
/// PrimaryKeyDef
///
/// Partition field alone (sort key defaults to the entity prefix) or a
/// (partition, sort) pair.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrimaryKeyDef {
    pub partition: KeyField,
    pub sort: Option<KeyField>,
}

impl PrimaryKeyDef {
    #[must_use]
    pub fn partition_only(partition: impl Into<String>) -> Self {
        Self {
            partition: KeyField::Field(partition.into()),
            sort: None,
        }
    }

    #[must_use]
    pub fn composite(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: KeyField::Field(partition.into()),
            sort: Some(KeyField::Field(sort.into())),
        }
    }

    /// Sort component with the single-field default made explicit.
    #[must_use]
    pub fn effective_sort(&self) -> KeyField {
        self.sort.clone().unwrap_or(KeyField::ModelPrefix)
    }
}

///
/// IndexSlot
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum IndexSlot {
    Ix1,
    Ix2,
    Ix3,
}

impl IndexSlot {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Ix1 => "ix1",
            Self::Ix2 => "ix2",
            Self::Ix3 => "ix3",
        }
    }

    /// Backend name of the physical secondary index backing this slot.
    #[must_use]
    pub const fn backend_index(self) -> &'static str {
        match self {
            Self::Ix1 => "gsi1",
            Self::Ix2 => "gsi2",
            Self::Ix3 => "gsi3",
        }
    }

    #[must_use]
    pub const fn partition_attr(self) -> &'static str {
        match self {
            Self::Ix1 => "_gsi1_pk",
            Self::Ix2 => "_gsi2_pk",
            Self::Ix3 => "_gsi3_pk",
        }
    }

    #[must_use]
    pub const fn sort_attr(self) -> &'static str {
        match self {
            Self::Ix1 => "_gsi1_sk",
            Self::Ix2 => "_gsi2_sk",
            Self::Ix3 => "_gsi3_sk",
        }
    }
}

///
/// UniqueSlot
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum UniqueSlot {
    Uc1,
    Uc2,
    Uc3,
}

impl UniqueSlot {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Uc1 => "uc1",
            Self::Uc2 => "uc2",
            Self::Uc3 => "uc3",
        }
    }
}

///
/// IndexDef
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexDef {
    pub partition: KeyField,
    pub sort: KeyField,
    pub slot: IndexSlot,
}

impl IndexDef {
    #[must_use]
    pub const fn new(partition: KeyField, sort: KeyField, slot: IndexSlot) -> Self {
        Self {
            partition,
            sort,
            slot,
        }
    }
}

///
/// UniqueDef
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UniqueDef {
    pub field: String,
    pub slot: UniqueSlot,
}

///
/// IterationDef
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IterationDef {
    pub iterable: bool,
    pub buckets: u32,
}

impl Default for IterationDef {
    fn default() -> Self {
        Self {
            iterable: false,
            buckets: 1,
        }
    }
}

///
/// EntityDef
///
/// One entity's full declarative definition. Built with the builder
/// methods, then validated and sealed by `RegistryBuilder::finalize`;
/// every other component only ever sees the sealed, immutable form.
///

#[derive(Clone, Debug)]
pub struct EntityDef {
    pub name: String,
    pub prefix: String,
    pub primary_key: PrimaryKeyDef,
    pub indexes: BTreeMap<String, IndexDef>,
    pub unique: BTreeMap<String, UniqueDef>,
    pub iteration: IterationDef,
    fields: Vec<FieldDef>,
    // sealed by the registry
    physical_attrs: BTreeSet<String>,
    indexes_by_field: BTreeMap<String, Vec<String>>,
}

impl EntityDef {
    #[must_use]
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            primary_key: PrimaryKeyDef {
                partition: KeyField::ModelPrefix,
                sort: None,
            },
            indexes: BTreeMap::new(),
            unique: BTreeMap::new(),
            iteration: IterationDef::default(),
            fields: Vec::new(),
            physical_attrs: BTreeSet::new(),
            indexes_by_field: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    #[must_use]
    pub fn primary_key(mut self, pk: PrimaryKeyDef) -> Self {
        self.primary_key = pk;
        self
    }

    #[must_use]
    pub fn index(mut self, name: impl Into<String>, def: IndexDef) -> Self {
        self.indexes.insert(name.into(), def);
        self
    }

    #[must_use]
    pub fn unique_constraint(
        mut self,
        name: impl Into<String>,
        field: impl Into<String>,
        slot: UniqueSlot,
    ) -> Self {
        self.unique.insert(
            name.into(),
            UniqueDef {
                field: field.into(),
                slot,
            },
        );
        self
    }

    #[must_use]
    pub const fn iterable(mut self, buckets: u32) -> Self {
        self.iteration = IterationDef {
            iterable: true,
            buckets,
        };
        self
    }

    // ── Sealed accessors ───────────────────────────────────────────

    #[must_use]
    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }

    /// Names of declared indexes whose partition or sort component is the
    /// given field.
    #[must_use]
    pub fn indexes_touching(&self, field: &str) -> &[String] {
        self.indexes_by_field
            .get(field)
            .map_or(&[], Vec::as_slice)
    }

    /// Reserved plus declared attribute names this entity occupies in a
    /// physical item.
    #[must_use]
    pub const fn physical_attrs(&self) -> &BTreeSet<String> {
        &self.physical_attrs
    }

    /// Whether an index aliases the primary key (and therefore carries no
    /// physical attributes of its own).
    #[must_use]
    pub fn is_primary_alias(&self, index: &IndexDef) -> bool {
        index.partition == self.primary_key.partition
            && index.sort == self.primary_key.effective_sort()
    }

    /// Uniqueness constraint declared on a field, if any.
    #[must_use]
    pub fn unique_on_field(&self, field: &str) -> Option<(&str, &UniqueDef)> {
        self.unique
            .iter()
            .find(|(_, def)| def.field == field)
            .map(|(name, def)| (name.as_str(), def))
    }

    pub(crate) fn field_def_mut(&mut self, name: &str) -> Option<&mut FieldDef> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    pub(crate) fn seal(
        &mut self,
        physical_attrs: BTreeSet<String>,
        indexes_by_field: BTreeMap<String, Vec<String>>,
    ) {
        self.physical_attrs = physical_attrs;
        self.indexes_by_field = indexes_by_field;
    }
}
