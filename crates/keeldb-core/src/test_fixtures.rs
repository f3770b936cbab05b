//! Shared schema fixtures and engine harness for the test suite.

use crate::{
    config::Config,
    db::Db,
    field::{FieldDef, FieldKind},
    schema::{EntityDef, IndexDef, IndexSlot, KeyField, PrimaryKeyDef, Registry, RegistryBuilder,
        UniqueSlot},
    store::memory::MemoryStore,
};
use std::sync::Arc;

pub(crate) const TABLE: &str = "main";

/// `team` / `user` / `task` schema exercising every field kind the engine
/// ships, aliases, uniqueness, relations, and iteration.
pub(crate) fn registry() -> Registry {
    let team = EntityDef::new("team", "tm")
        .field(FieldDef::new("id", FieldKind::Ulid { auto_assign: true }))
        .field(FieldDef::new("name", FieldKind::String { pattern: None }).required())
        .primary_key(PrimaryKeyDef::partition_only("id"))
        .unique_constraint("uniqueName", "name", UniqueSlot::Uc1);

    let user = EntityDef::new("user", "u")
        .field(FieldDef::new("id", FieldKind::Ulid { auto_assign: true }))
        .field(FieldDef::new(
            "email",
            FieldKind::String {
                pattern: Some("*@*".to_string()),
            },
        ))
        .field(FieldDef::new("name", FieldKind::String { pattern: None }).required())
        .field(FieldDef::new("role", FieldKind::String { pattern: None }))
        .field(
            FieldDef::new("status", FieldKind::String { pattern: None })
                .with_default(crate::value::Value::Str("active".to_string())),
        )
        .field(FieldDef::new("score", FieldKind::Counter))
        .field(FieldDef::new("team", FieldKind::RelatedRef {
            target: "team".to_string(),
        }))
        .field(FieldDef::new("created_at", FieldKind::CreateInstant))
        .field(FieldDef::new("modified_at", FieldKind::ModifyInstant))
        .field(FieldDef::new("version", FieldKind::VersionUlid))
        .primary_key(PrimaryKeyDef::partition_only("id"))
        .index(
            "byRole",
            IndexDef::new(
                KeyField::field("role"),
                KeyField::field("status"),
                IndexSlot::Ix1,
            ),
        )
        .index(
            "byTeam",
            IndexDef::new(
                KeyField::field("team"),
                KeyField::field("created_at"),
                IndexSlot::Ix2,
            ),
        )
        .index(
            "primary",
            IndexDef::new(KeyField::field("id"), KeyField::ModelPrefix, IndexSlot::Ix3),
        )
        .unique_constraint("uniqueEmail", "email", UniqueSlot::Uc1)
        .iterable(5);

    let task = EntityDef::new("task", "tk")
        .field(FieldDef::new("project", FieldKind::String { pattern: None }))
        .field(FieldDef::new("seq", FieldKind::Integer))
        .field(FieldDef::new("title", FieldKind::String { pattern: None }))
        .field(FieldDef::new("ttl", FieldKind::TtlInstant))
        .primary_key(PrimaryKeyDef::composite("project", "seq"))
        .iterable(1);

    let mut builder = RegistryBuilder::new();
    builder.register(team).expect("team registers");
    builder.register(user).expect("user registers");
    builder.register(task).expect("task registers");

    builder.finalize().expect("fixture registry finalizes")
}

pub(crate) fn test_db() -> (Db, Arc<MemoryStore>) {
    db_with(Config::new(TABLE))
}

pub(crate) fn tenant_db() -> (Db, Arc<MemoryStore>) {
    db_with(Config::new(TABLE).with_tenancy(true))
}

pub(crate) fn db_with(config: Config) -> (Db, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let db = Db::new(store.clone(), registry(), config);

    (db, store)
}
