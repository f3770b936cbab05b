use crate::{
    context::{RequestContext, tenant},
    db::{DeleteOptions, GetOptions, MutationHook, QueryOptions, SaveHookArgs, UpdateOptions},
    db::query::Direction,
    error::Error,
    expr::{Filter, KeyCondition, QueryError, SortCondition},
    instance::CapacityScope,
    key,
    store::Scalar,
    test_fixtures::{TABLE, db_with, tenant_db, test_db},
    types::Instant,
    value::Value,
};
use futures::TryStreamExt;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

fn user_fields(name: &str, email: Option<&str>) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("name".to_string(), Value::Str(name.to_string()));
    if let Some(email) = email {
        fields.insert("email".to_string(), Value::Str(email.to_string()));
    }
    fields
}

fn with_role(mut fields: BTreeMap<String, Value>, role: &str, status: &str) -> BTreeMap<String, Value> {
    fields.insert("role".to_string(), Value::Str(role.to_string()));
    fields.insert("status".to_string(), Value::Str(status.to_string()));
    fields
}

// ── Create / get basics ────────────────────────────────────────────

#[tokio::test]
async fn create_assigns_managed_fields_and_round_trips() {
    let (db, _) = test_db();

    RequestContext::run(async {
        let created = db
            .create("user", user_fields("ann", Some("ann@b.test")))
            .await
            .unwrap();

        assert!(created.exists());
        assert!(matches!(created.get("id"), Some(Value::Ulid(_))));
        assert!(matches!(created.get("version"), Some(Value::Ulid(_))));
        assert!(matches!(created.get("created_at"), Some(Value::Instant(_))));
        // unset field with a default picks the default up
        assert_eq!(created.get("status"), Some(Value::Str("active".into())));

        let fetched = db
            .get("user", &created.primary_id(), GetOptions::default())
            .await
            .unwrap();
        assert!(fetched.exists());
        assert_eq!(fetched.get("name"), Some(Value::Str("ann".into())));
    })
    .await;
}

#[tokio::test]
async fn missing_lookup_returns_sentinel_not_error() {
    let (db, _) = test_db();

    RequestContext::run(async {
        let missing = db
            .get("user", "01ARZ3NDEKTSV4RRFFQ69G5FAV", GetOptions::default())
            .await
            .unwrap();

        assert!(!missing.exists());
        assert!(!db.exists("user", "01ARZ3NDEKTSV4RRFFQ69G5FAV").await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn create_rejects_missing_required_and_unknown_fields() {
    let (db, _) = test_db();

    let no_name = db.create("user", BTreeMap::new()).await;
    assert!(matches!(no_name, Err(Error::Field(_))));

    let mut unknown = user_fields("ann", None);
    unknown.insert("ghost".to_string(), Value::Int(1));
    assert!(matches!(
        db.create("user", unknown).await,
        Err(Error::Query(QueryError::UnknownField { .. }))
    ));
}

#[tokio::test]
async fn duplicate_primary_key_is_conditional_error() {
    let (db, _) = test_db();

    RequestContext::run(async {
        let first = db
            .create("task", BTreeMap::from([
                ("project".to_string(), Value::Str("p1".into())),
                ("seq".to_string(), Value::Int(1)),
            ]))
            .await
            .unwrap();

        // same composite key again
        let again = db
            .create("task", BTreeMap::from([
                ("project".to_string(), Value::Str("p1".into())),
                ("seq".to_string(), Value::Int(1)),
            ]))
            .await;

        assert!(first.exists());
        assert!(matches!(again, Err(Error::Conditional { .. })));
    })
    .await;
}

#[tokio::test]
async fn composite_primary_ids_and_ttl_seconds() {
    let (db, store) = test_db();

    let task = db
        .create("task", BTreeMap::from([
            ("project".to_string(), Value::Str("p1".into())),
            ("seq".to_string(), Value::Int(7)),
            ("title".to_string(), Value::Str("write docs".into())),
            ("ttl".to_string(), Value::Instant(Instant::from_millis(90_000))),
        ]))
        .await
        .unwrap();

    assert_eq!(task.primary_id(), "p1##__SK__##00000000000000000007");

    let fetched = db
        .get("task", &task.primary_id(), GetOptions::default())
        .await
        .unwrap();
    assert!(fetched.exists());
    assert_eq!(fetched.get("title"), Some(Value::Str("write docs".into())));

    let raw = store
        .raw_item(TABLE, "no-tenant#tk#p1", "00000000000000000007")
        .unwrap();
    assert_eq!(raw["ttl"], Scalar::N("90".to_string()));
}

// ── Instance cache ─────────────────────────────────────────────────

#[tokio::test]
async fn lookups_in_one_context_share_identity() {
    let (db, _) = test_db();

    RequestContext::run(async {
        let created = db.create("user", user_fields("ann", None)).await.unwrap();
        let id = created.primary_id();

        let a = db.get("user", &id, GetOptions::default()).await.unwrap();
        let b = db.get("user", &id, GetOptions::default()).await.unwrap();

        assert!(Arc::ptr_eq(&created, &a));
        assert!(Arc::ptr_eq(&a, &b));
    })
    .await;
}

#[tokio::test]
async fn bypass_cache_replaces_the_cached_instance() {
    let (db, store) = test_db();

    RequestContext::run(async {
        let created = db.create("user", user_fields("ann", None)).await.unwrap();
        let id = created.primary_id();

        let before = store.op_count("get_item");
        let fresh = db
            .get("user", &id, GetOptions {
                bypass_cache: true,
                ..GetOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(store.op_count("get_item"), before + 1);
        assert!(!Arc::ptr_eq(&created, &fresh));

        // the fresh read replaced the cache entry
        let again = db.get("user", &id, GetOptions::default()).await.unwrap();
        assert!(Arc::ptr_eq(&fresh, &again));
    })
    .await;
}

#[tokio::test]
async fn nested_contexts_get_fresh_caches() {
    let (db, _) = test_db();

    RequestContext::run(async {
        let outer = db.create("user", user_fields("ann", None)).await.unwrap();
        let id = outer.primary_id();

        let inner = RequestContext::run(async {
            db.get("user", &id, GetOptions::default()).await.unwrap()
        })
        .await;
        assert!(!Arc::ptr_eq(&outer, &inner));

        let again = db.get("user", &id, GetOptions::default()).await.unwrap();
        assert!(Arc::ptr_eq(&outer, &again));
    })
    .await;
}

// ── Batch coalescing ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_gets_coalesce_into_one_batch() {
    let (db, store) = test_db();

    RequestContext::run(async {
        let mut ids = Vec::new();
        for i in 0..3 {
            let user = db
                .create("user", user_fields(&format!("user-{i}"), None))
                .await
                .unwrap();
            ids.push(user.primary_id());
        }
        // fresh context so nothing is cached
        RequestContext::run(async {
            let options = GetOptions::batched(10);
            let (a, b, c) = tokio::join!(
                db.get("user", &ids[0], options.clone()),
                db.get("user", &ids[1], options.clone()),
                db.get("user", &ids[2], options.clone()),
            );
            let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

            assert_eq!(store.op_count("batch_get_item"), 1);
            assert_eq!(store.op_count("get_item"), 0);
            for instance in [&a, &b, &c] {
                assert!(instance.exists());
                let capacity = instance.consumed_capacity(CapacityScope::Own);
                assert!(capacity.read < 1.0, "read capacity {}", capacity.read);
            }
        })
        .await;
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_gets_of_one_id_share_a_fetch() {
    let (db, store) = test_db();

    RequestContext::run(async {
        let id = db
            .create("user", user_fields("ann", None))
            .await
            .unwrap()
            .primary_id();

        RequestContext::run(async {
            let options = GetOptions::batched(10);
            let (a, b) = tokio::join!(
                db.get("user", &id, options.clone()),
                db.get("user", &id, options.clone()),
            );
            let (a, b) = (a.unwrap(), b.unwrap());

            assert!(Arc::ptr_eq(&a, &b));
            assert_eq!(store.op_count("batch_get_item"), 1);
        })
        .await;
    })
    .await;
}

#[tokio::test]
async fn zero_delay_issues_direct_single_reads() {
    let (db, store) = test_db();

    RequestContext::run(async {
        let id = db
            .create("user", user_fields("ann", None))
            .await
            .unwrap()
            .primary_id();

        RequestContext::run(async {
            let _ = db.get("user", &id, GetOptions::default()).await.unwrap();
            assert_eq!(store.op_count("get_item"), 1);
            assert_eq!(store.op_count("batch_get_item"), 0);
        })
        .await;
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn batch_get_preserves_order_and_fills_sentinels() {
    let (db, _) = test_db();

    RequestContext::run(async {
        let a = db.create("user", user_fields("a", None)).await.unwrap();
        let b = db.create("user", user_fields("b", None)).await.unwrap();
        let ghost = "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string();

        let results = db
            .batch_get(
                "user",
                &[b.primary_id(), ghost.clone(), a.primary_id()],
                GetOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].primary_id(), b.primary_id());
        assert!(!results[1].exists());
        assert_eq!(results[2].primary_id(), a.primary_id());
    })
    .await;
}

// ── Uniqueness ─────────────────────────────────────────────────────

#[tokio::test]
async fn unique_email_is_enforced_per_tenant() {
    let (db, _) = test_db();

    let first = db.create("user", user_fields("ann", Some("a@b.test"))).await;
    assert!(first.is_ok());

    let second = db.create("user", user_fields("bob", Some("a@b.test"))).await;
    match second {
        Err(Error::Conditional {
            constraint,
            message,
            ..
        }) => {
            assert_eq!(constraint.as_deref(), Some("email"));
            assert_eq!(message, "email must be unique");
        }
        other => panic!("expected uniqueness violation, got {other:?}"),
    }
}

#[tokio::test]
async fn delete_releases_uniqueness_for_recreate() {
    let (db, _) = test_db();

    let created = db
        .create("user", user_fields("ann", Some("a@b.test")))
        .await
        .unwrap();
    let deleted = db
        .delete("user", &created.primary_id(), DeleteOptions::default())
        .await
        .unwrap();
    assert!(deleted.exists());

    // the released value is claimable again
    assert!(
        db.create("user", user_fields("ann2", Some("a@b.test")))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn delete_without_outstanding_unique_records_stays_single_item() {
    let (db, store) = test_db();

    // email's uniqueness constraint is declared, but this record never
    // claimed a value, so no record is outstanding
    let user = db.create("user", user_fields("ann", None)).await.unwrap();
    let deleted = db
        .delete("user", &user.primary_id(), DeleteOptions::default())
        .await
        .unwrap();

    assert!(deleted.exists());
    assert_eq!(store.op_count("delete_item"), 1);
    assert_eq!(store.op_count("transact_write_items"), 0);
}

#[tokio::test]
async fn update_moves_uniqueness_records() {
    let (db, _) = test_db();

    let ann = db
        .create("user", user_fields("ann", Some("a@b.test")))
        .await
        .unwrap();
    db.update(
        "user",
        &ann.primary_id(),
        BTreeMap::from([("email".to_string(), Value::Str("a2@b.test".into()))]),
        UpdateOptions::default(),
    )
    .await
    .unwrap();

    // the old value is free, the new one is taken
    assert!(
        db.create("user", user_fields("bob", Some("a@b.test")))
            .await
            .is_ok()
    );
    assert!(matches!(
        db.create("user", user_fields("cal", Some("a2@b.test"))).await,
        Err(Error::Conditional { .. })
    ));
}

#[tokio::test]
async fn find_by_unique_resolves_the_owner() {
    let (db, _) = test_db();

    RequestContext::run(async {
        let ann = db
            .create("user", user_fields("ann", Some("a@b.test")))
            .await
            .unwrap();

        let found = db
            .find_by_unique("user", "email", &Value::Str("a@b.test".into()))
            .await
            .unwrap();
        assert_eq!(found.primary_id(), ann.primary_id());

        let missing = db
            .find_by_unique("user", "email", &Value::Str("nobody@b.test".into()))
            .await
            .unwrap();
        assert!(!missing.exists());

        assert!(matches!(
            db.find_by_unique("user", "name", &Value::Str("ann".into())).await,
            Err(Error::Query(QueryError::UnknownConstraint { .. }))
        ));
    })
    .await;
}

// ── Tenancy ────────────────────────────────────────────────────────

#[tokio::test]
async fn tenant_prefixes_physical_keys() {
    let (db, store) = tenant_db();

    tenant::run_with_tenant("t1", async {
        let user = db.create("user", user_fields("ann", None)).await.unwrap();
        let pk = format!("t1#u#{}", user.primary_id());

        let raw = store.raw_item(TABLE, &pk, "u").unwrap();
        assert_eq!(raw[key::ATTR_TENANT], Scalar::S("t1".to_string()));
    })
    .await;
}

#[tokio::test]
async fn unique_values_are_isolated_per_tenant() {
    let (db, _) = tenant_db();

    let t1_id = tenant::run_with_tenant("t1", async {
        db.create("user", user_fields("ann", Some("a@b.test")))
            .await
            .unwrap()
            .primary_id()
    })
    .await;

    let t2_id = tenant::run_with_tenant("t2", async {
        db.create("user", user_fields("bob", Some("a@b.test")))
            .await
            .unwrap()
            .primary_id()
    })
    .await;

    assert_ne!(t1_id, t2_id);

    let found_t1 = tenant::run_with_tenant("t1", async {
        db.find_by_unique("user", "email", &Value::Str("a@b.test".into()))
            .await
            .unwrap()
            .primary_id()
    })
    .await;
    let found_t2 = tenant::run_with_tenant("t2", async {
        db.find_by_unique("user", "email", &Value::Str("a@b.test".into()))
            .await
            .unwrap()
            .primary_id()
    })
    .await;

    assert_eq!(found_t1, t1_id);
    assert_eq!(found_t2, t2_id);
}

#[tokio::test]
async fn tenancy_without_a_tenant_is_a_context_error() {
    let (db, _) = tenant_db();

    assert!(matches!(
        db.create("user", user_fields("ann", None)).await,
        Err(Error::Context { .. })
    ));
}

#[tokio::test]
async fn resolver_chain_supplies_the_tenant() {
    let (db, store) = tenant_db();
    db.register_tenant_resolver(Arc::new(|| Some(crate::types::TenantId::new("t9"))));

    let user = db.create("user", user_fields("ann", None)).await.unwrap();

    assert!(
        store
            .raw_item(TABLE, &format!("t9#u#{}", user.primary_id()), "u")
            .is_some()
    );
}

#[tokio::test]
async fn nested_tenant_override_and_inheritance() {
    tenant::run_with_tenant("t1", async {
        assert_eq!(tenant::current().unwrap().as_str(), "t1");

        // nested plain context inherits
        RequestContext::run(async {
            assert_eq!(tenant::current().unwrap().as_str(), "t1");
        })
        .await;

        // nested override wins, then unwinds
        tenant::run_with_tenant("t2", async {
            assert_eq!(tenant::current().unwrap().as_str(), "t2");
        })
        .await;
        assert_eq!(tenant::current().unwrap().as_str(), "t1");
    })
    .await;
}

// ── Strict mode ────────────────────────────────────────────────────

#[tokio::test]
async fn strict_mode_requires_a_context() {
    let (db, _) = db_with(
        crate::config::Config::new(TABLE).with_require_batch_context(true),
    );

    assert!(matches!(
        db.get("user", "01ARZ3NDEKTSV4RRFFQ69G5FAV", GetOptions::default())
            .await,
        Err(Error::Context { .. })
    ));

    RequestContext::run(async {
        assert!(
            db.get("user", "01ARZ3NDEKTSV4RRFFQ69G5FAV", GetOptions::default())
                .await
                .is_ok()
        );
    })
    .await;
}

// ── Update ─────────────────────────────────────────────────────────

#[tokio::test]
async fn update_of_missing_item_is_item_not_found() {
    let (db, _) = test_db();

    let result = db
        .update(
            "user",
            "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            BTreeMap::from([("name".to_string(), Value::Str("x".into()))]),
            UpdateOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(Error::ItemNotFound { .. })));
}

#[tokio::test]
async fn partial_index_update_backfills_the_other_component() {
    let (db, store) = test_db();

    let user = db
        .create("user", with_role(user_fields("ann", None), "user", "active"))
        .await
        .unwrap();

    db.update(
        "user",
        &user.primary_id(),
        BTreeMap::from([("role".to_string(), Value::Str("admin".into()))]),
        UpdateOptions::default(),
    )
    .await
    .unwrap();

    let raw = store
        .raw_item(TABLE, &format!("no-tenant#u#{}", user.primary_id()), "u")
        .unwrap();
    assert_eq!(raw["_gsi1_pk"], Scalar::S("no-tenant#u#ix1#admin".to_string()));
    // the untouched half of the key is preserved from the stored item
    assert_eq!(raw["_gsi1_sk"], Scalar::S("active".to_string()));
}

#[tokio::test]
async fn update_without_backfill_source_is_a_data_format_error() {
    let (db, _) = test_db();

    // no role stored, so the byRole partition cannot be rebuilt
    let user = db.create("user", user_fields("ann", None)).await.unwrap();

    let result = db
        .update(
            "user",
            &user.primary_id(),
            BTreeMap::from([("status".to_string(), Value::Str("paused".into()))]),
            UpdateOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(Error::DataFormat(_))));
}

#[tokio::test]
async fn untouched_indexes_keep_their_keys_byte_equal() {
    let (db, store) = test_db();

    let team = db
        .create("team", BTreeMap::from([("name".to_string(), Value::Str("core".into()))]))
        .await
        .unwrap();
    let user = db
        .create(
            "user",
            {
                let mut fields = with_role(user_fields("ann", None), "user", "active");
                fields.insert("team".to_string(), Value::Str(team.primary_id()));
                fields
            },
        )
        .await
        .unwrap();

    let pk = format!("no-tenant#u#{}", user.primary_id());
    let before = store.raw_item(TABLE, &pk, "u").unwrap();

    db.update(
        "user",
        &user.primary_id(),
        BTreeMap::from([("role".to_string(), Value::Str("admin".into()))]),
        UpdateOptions::default(),
    )
    .await
    .unwrap();

    let after = store.raw_item(TABLE, &pk, "u").unwrap();
    assert_eq!(before["_gsi2_pk"], after["_gsi2_pk"]);
    assert_eq!(before["_gsi2_sk"], after["_gsi2_sk"]);
    assert_ne!(before["_gsi1_pk"], after["_gsi1_pk"]);
}

#[tokio::test]
async fn conditional_update_failure_leaves_the_record_unchanged() {
    let (db, _) = test_db();

    let user = db
        .create("user", {
            let mut fields = user_fields("ann", None);
            fields.insert("status".to_string(), Value::Str("inactive".into()));
            fields
        })
        .await
        .unwrap();

    let result = db
        .update(
            "user",
            &user.primary_id(),
            BTreeMap::from([("name".to_string(), Value::Str("bob".into()))]),
            UpdateOptions {
                condition: Some(Filter::eq("status", "active")),
                ..UpdateOptions::default()
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Conditional { .. })));

    let stored = db
        .get("user", &user.primary_id(), GetOptions {
            bypass_cache: true,
            ..GetOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(stored.get("name"), Some(Value::Str("ann".into())));
}

#[tokio::test]
async fn counter_deltas_accumulate_and_absolutes_overwrite() {
    let (db, _) = test_db();

    let user = db
        .create("user", {
            let mut fields = user_fields("ann", None);
            fields.insert("score".to_string(), Value::Int(5));
            fields
        })
        .await
        .unwrap();
    let id = user.primary_id();

    let bumped = db
        .update(
            "user",
            &id,
            BTreeMap::from([("score".to_string(), Value::Str("+3".into()))]),
            UpdateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(bumped.get("score"), Some(Value::Int(8)));

    let dropped = db
        .update(
            "user",
            &id,
            BTreeMap::from([("score".to_string(), Value::Str("-10".into()))]),
            UpdateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(dropped.get("score"), Some(Value::Int(-2)));

    let reset = db
        .update(
            "user",
            &id,
            BTreeMap::from([("score".to_string(), Value::Int(100))]),
            UpdateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reset.get("score"), Some(Value::Int(100)));
}

#[tokio::test]
async fn explicit_null_clears_field_and_sparse_index_row() {
    let (db, store) = test_db();

    let user = db
        .create("user", with_role(user_fields("ann", None), "admin", "active"))
        .await
        .unwrap();
    let pk = format!("no-tenant#u#{}", user.primary_id());
    assert!(store.raw_item(TABLE, &pk, "u").unwrap().contains_key("_gsi1_pk"));

    let updated = db
        .update(
            "user",
            &user.primary_id(),
            BTreeMap::from([("role".to_string(), Value::Null)]),
            UpdateOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(updated.get("role"), None);
    let raw = store.raw_item(TABLE, &pk, "u").unwrap();
    assert!(!raw.contains_key("role"));
    assert!(!raw.contains_key("_gsi1_pk"));
    assert!(!raw.contains_key("_gsi1_sk"));
}

#[tokio::test]
async fn version_field_rotates_on_every_save() {
    let (db, _) = test_db();

    let user = db.create("user", user_fields("ann", None)).await.unwrap();
    let first = user.get("version");

    let updated = db
        .update(
            "user",
            &user.primary_id(),
            BTreeMap::from([("name".to_string(), Value::Str("bob".into()))]),
            UpdateOptions::default(),
        )
        .await
        .unwrap();

    assert!(first.is_some());
    assert_ne!(updated.get("version"), first);
    assert_eq!(updated.get("created_at"), user.get("created_at"));
}

// ── Delete ─────────────────────────────────────────────────────────

#[tokio::test]
async fn deleting_a_missing_record_returns_a_sentinel() {
    let (db, _) = test_db();

    let gone = db
        .delete("user", "01ARZ3NDEKTSV4RRFFQ69G5FAV", DeleteOptions::default())
        .await
        .unwrap();

    assert!(!gone.exists());
}

#[tokio::test]
async fn conditional_delete_honors_the_condition() {
    let (db, _) = test_db();

    let task = db
        .create("task", BTreeMap::from([
            ("project".to_string(), Value::Str("p1".into())),
            ("seq".to_string(), Value::Int(1)),
            ("title".to_string(), Value::Str("keep me".into())),
        ]))
        .await
        .unwrap();

    let result = db
        .delete("task", &task.primary_id(), DeleteOptions {
            condition: Some(Filter::eq("title", "something else")),
        })
        .await;
    assert!(matches!(result, Err(Error::Conditional { .. })));

    assert!(db.exists("task", &task.primary_id()).await.unwrap());
}

// ── Hooks ──────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingHook {
    before_saves: AtomicUsize,
    after_saves: AtomicUsize,
    before_deletes: AtomicUsize,
    after_deletes: AtomicUsize,
}

impl MutationHook for RecordingHook {
    fn before_save(&self, save: &mut SaveHookArgs<'_>) {
        self.before_saves.fetch_add(1, Ordering::SeqCst);
        if save.primary_id.is_none() {
            save.changes
                .insert("role".to_string(), Value::Str("hooked".into()));
        }
    }

    fn after_save(&self, _instance: &Arc<crate::instance::Instance>) {
        self.after_saves.fetch_add(1, Ordering::SeqCst);
    }

    fn before_delete(&self, _primary_id: &str, _options: &DeleteOptions) {
        self.before_deletes.fetch_add(1, Ordering::SeqCst);
    }

    fn after_delete(&self, _primary_id: &str, _options: &DeleteOptions) {
        self.after_deletes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn hooks_mutate_creates_and_skip_no_op_saves() {
    let (db, _) = test_db();
    let hook = Arc::new(RecordingHook::default());
    db.register_hook("user", hook.clone());

    let user = db.create("user", user_fields("ann", None)).await.unwrap();
    assert_eq!(user.get("role"), Some(Value::Str("hooked".into())));
    assert_eq!(hook.before_saves.load(Ordering::SeqCst), 1);
    assert_eq!(hook.after_saves.load(Ordering::SeqCst), 1);

    // same value again: no write dispatches, hooks stay silent
    db.update(
        "user",
        &user.primary_id(),
        BTreeMap::from([("name".to_string(), Value::Str("ann".into()))]),
        UpdateOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(hook.before_saves.load(Ordering::SeqCst), 1);

    db.delete("user", &user.primary_id(), DeleteOptions::default())
        .await
        .unwrap();
    assert_eq!(hook.before_deletes.load(Ordering::SeqCst), 1);
    assert_eq!(hook.after_deletes.load(Ordering::SeqCst), 1);
}

// ── Query ──────────────────────────────────────────────────────────

async fn seed_admins(db: &crate::db::Db, count: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for i in 0..count {
        let user = db
            .create(
                "user",
                with_role(
                    user_fields(&format!("admin-{i}"), None),
                    "admin",
                    &format!("s{i}"),
                ),
            )
            .await
            .unwrap();
        ids.push(user.primary_id());
    }
    ids
}

#[tokio::test]
async fn query_returns_partition_matches_in_sort_order() {
    let (db, _) = test_db();

    RequestContext::run(async {
        seed_admins(&db, 3).await;
        db.create("user", with_role(user_fields("reg", None), "user", "s0"))
            .await
            .unwrap();

        let response = db
            .query(
                "user",
                "byRole",
                &Value::Str("admin".into()),
                None,
                QueryOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(response.count, 3);
        let statuses: Vec<_> = response
            .items
            .iter()
            .map(|i| i.get("status").unwrap())
            .collect();
        assert_eq!(
            statuses,
            vec![
                Value::Str("s0".into()),
                Value::Str("s1".into()),
                Value::Str("s2".into())
            ]
        );
    })
    .await;
}

#[tokio::test]
async fn query_sort_conditions_bound_the_sort_key() {
    let (db, _) = test_db();

    seed_admins(&db, 4).await;

    let response = db
        .query(
            "user",
            "byRole",
            &Value::Str("admin".into()),
            Some(SortCondition::new(
                "status",
                KeyCondition::Between(Value::Str("s1".into()), Value::Str("s2".into())),
            )),
            QueryOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(response.count, 2);

    let begins = db
        .query(
            "user",
            "byRole",
            &Value::Str("admin".into()),
            Some(SortCondition::new(
                "status",
                KeyCondition::BeginsWith(Value::Str("s3".into())),
            )),
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(begins.count, 1);
}

#[tokio::test]
async fn query_sort_condition_on_non_sort_field_is_rejected() {
    let (db, _) = test_db();

    let result = db
        .query(
            "user",
            "byRole",
            &Value::Str("admin".into()),
            Some(SortCondition::new(
                "name",
                KeyCondition::Eq(Value::Str("x".into())),
            )),
            QueryOptions::default(),
        )
        .await;

    assert!(matches!(
        result,
        Err(Error::Query(QueryError::NotSortKey { .. }))
    ));
}

#[tokio::test]
async fn query_filters_apply_after_the_key_condition() {
    let (db, _) = test_db();

    seed_admins(&db, 3).await;

    let response = db
        .query(
            "user",
            "byRole",
            &Value::Str("admin".into()),
            None,
            QueryOptions {
                filter: Some(Filter::eq("name", "admin-1")),
                ..QueryOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.count, 1);
    assert_eq!(
        response.items[0].get("name"),
        Some(Value::Str("admin-1".into()))
    );
}

#[tokio::test]
async fn query_descends_when_asked() {
    let (db, _) = test_db();

    seed_admins(&db, 3).await;

    let response = db
        .query(
            "user",
            "byRole",
            &Value::Str("admin".into()),
            None,
            QueryOptions {
                direction: Direction::Desc,
                ..QueryOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        response.items[0].get("status"),
        Some(Value::Str("s2".into()))
    );
}

#[tokio::test]
async fn query_paginates_with_opaque_continuation_tokens() {
    let (db, _) = test_db();

    seed_admins(&db, 3).await;

    let first = db
        .query(
            "user",
            "byRole",
            &Value::Str("admin".into()),
            None,
            QueryOptions {
                limit: 2,
                ..QueryOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(first.count, 2);
    let token = first.last_evaluated_key.expect("more pages remain");

    let second = db
        .query(
            "user",
            "byRole",
            &Value::Str("admin".into()),
            None,
            QueryOptions {
                limit: 2,
                start_key: Some(token),
                ..QueryOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(second.count, 1);
    assert!(second.last_evaluated_key.is_none());

    let mut seen = BTreeSet::new();
    for item in first.items.iter().chain(second.items.iter()) {
        seen.insert(item.primary_id());
    }
    assert_eq!(seen.len(), 3);
}

#[tokio::test]
async fn count_only_respects_the_limit_cap() {
    let (db, _) = test_db();

    seed_admins(&db, 5).await;

    let capped = db
        .query(
            "user",
            "byRole",
            &Value::Str("admin".into()),
            None,
            QueryOptions {
                count_only: true,
                limit: 3,
                ..QueryOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(capped.count, 3);
    assert!(capped.items.is_empty());
}

#[tokio::test]
async fn query_through_a_primary_alias_index() {
    let (db, _) = test_db();

    let user = db
        .create("user", user_fields("ann", None))
        .await
        .unwrap();
    let Some(Value::Ulid(id)) = user.get("id") else {
        panic!("ulid id expected");
    };

    let response = db
        .query(
            "user",
            "primary",
            &Value::Ulid(id),
            None,
            QueryOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(response.count, 1);
    assert_eq!(response.items[0].primary_id(), user.primary_id());
}

#[tokio::test(start_paused = true)]
async fn query_preloads_related_records_in_one_batch() {
    let (db, store) = test_db();

    RequestContext::run(async {
        let team = db
            .create("team", BTreeMap::from([
                ("name".to_string(), Value::Str("core".into())),
            ]))
            .await
            .unwrap();

        for i in 0..3 {
            db.create("user", {
                let mut fields = user_fields(&format!("u{i}"), None);
                fields.insert("team".to_string(), Value::Str(team.primary_id()));
                fields
            })
            .await
            .unwrap();
        }

        RequestContext::run(async {
            let response = db
                .query(
                    "user",
                    "byTeam",
                    &Value::Str(team.primary_id()),
                    None,
                    QueryOptions {
                        load_related: true,
                        related_fields: vec!["team".to_string()],
                        ..QueryOptions::default()
                    },
                )
                .await
                .unwrap();

            assert_eq!(response.count, 3);
            // one unique target, one batched fetch
            assert_eq!(store.op_count("batch_get_item"), 1);

            let resolved: Vec<_> = response
                .items
                .iter()
                .map(|item| item.related("team").expect("relation loaded").unwrap())
                .collect();
            assert_eq!(resolved[0].primary_id(), team.primary_id());
            assert!(Arc::ptr_eq(&resolved[0], &resolved[1]));

            let with_related = response.items[0].consumed_capacity(CapacityScope::WithRelated);
            let own = response.items[0].consumed_capacity(CapacityScope::Own);
            assert!(with_related.read > own.read);
        })
        .await;
    })
    .await;
}

// ── Iteration ──────────────────────────────────────────────────────

#[tokio::test]
async fn iterate_all_visits_every_record_exactly_once() {
    let (db, _) = test_db();

    let mut created = BTreeSet::new();
    for i in 0..50 {
        let user = db
            .create("user", user_fields(&format!("u{i}"), None))
            .await
            .unwrap();
        created.insert(user.primary_id());
    }

    let mut seen = BTreeSet::new();
    let mut stream = Box::pin(db.iterate_all("user", 10));
    while let Some(batch) = stream.try_next().await.unwrap() {
        assert!(batch.len() <= 10);
        for instance in batch {
            assert!(seen.insert(instance.primary_id()), "duplicate id");
        }
    }

    assert_eq!(seen, created);
}

#[tokio::test]
async fn iterate_buckets_partition_the_entity() {
    let (db, _) = test_db();

    let mut created = BTreeSet::new();
    for i in 0..50 {
        let user = db
            .create("user", user_fields(&format!("u{i}"), None))
            .await
            .unwrap();
        created.insert(user.primary_id());
    }

    let mut seen = BTreeSet::new();
    for bucket in 0..5 {
        let mut stream = Box::pin(db.iterate_bucket("user", bucket, 10));
        while let Some(batch) = stream.try_next().await.unwrap() {
            for instance in batch {
                assert!(seen.insert(instance.primary_id()), "duplicate id");
            }
        }
    }

    assert_eq!(seen, created);
}

#[tokio::test]
async fn iteration_guards_its_inputs() {
    let (db, _) = test_db();

    let mut not_iterable = Box::pin(db.iterate_all("team", 10));
    assert!(matches!(
        not_iterable.try_next().await,
        Err(Error::Query(QueryError::NotIterable { .. }))
    ));

    let mut out_of_range = Box::pin(db.iterate_bucket("user", 9, 10));
    assert!(matches!(
        out_of_range.try_next().await,
        Err(Error::Query(QueryError::BucketOutOfRange { .. }))
    ));
}
