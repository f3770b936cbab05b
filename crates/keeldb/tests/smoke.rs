//! End-to-end exercise of the re-exported public surface.

use keeldb::prelude::*;
use keeldb::{
    config::Config,
    field::{FieldDef, FieldKind},
    schema::{IndexDef, PrimaryKeyDef, RegistryBuilder},
    store::memory::MemoryStore,
};
use std::{collections::BTreeMap, sync::Arc};

fn engine() -> Db {
    let mut schema = RegistryBuilder::new();
    schema
        .register(
            EntityDef::new("note", "nt")
                .field(FieldDef::new("id", FieldKind::Ulid { auto_assign: true }))
                .field(FieldDef::new("body", FieldKind::String { pattern: None }).required())
                .field(FieldDef::new("topic", FieldKind::String { pattern: None }))
                .field(FieldDef::new("written_at", FieldKind::CreateInstant))
                .primary_key(PrimaryKeyDef::partition_only("id"))
                .index(
                    "byTopic",
                    IndexDef::new(
                        KeyField::field("topic"),
                        KeyField::field("written_at"),
                        IndexSlot::Ix1,
                    ),
                ),
        )
        .expect("note registers");

    Db::new(
        Arc::new(MemoryStore::new()),
        schema.finalize().expect("schema finalizes"),
        Config::new("main"),
    )
}

#[tokio::test]
async fn create_query_delete_through_the_facade() {
    let db = engine();

    RequestContext::run(async {
        let note = db
            .create(
                "note",
                BTreeMap::from([
                    ("body".to_string(), Value::Str("remember the milk".into())),
                    ("topic".to_string(), Value::Str("errands".into())),
                ]),
            )
            .await
            .expect("create succeeds");

        let fetched = db
            .get("note", &note.primary_id(), GetOptions::default())
            .await
            .expect("get succeeds");
        assert!(fetched.exists());

        let by_topic = db
            .query(
                "note",
                "byTopic",
                &Value::Str("errands".into()),
                None,
                QueryOptions::default(),
            )
            .await
            .expect("query succeeds");
        assert_eq!(by_topic.count, 1);

        let deleted = db
            .delete("note", &note.primary_id(), DeleteOptions::default())
            .await
            .expect("delete succeeds");
        assert!(deleted.exists());
        assert!(!db.exists("note", &note.primary_id()).await.unwrap());
    })
    .await;
}
