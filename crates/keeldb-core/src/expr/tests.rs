use crate::{
    expr::{
        ExprBuilder, Filter, FilterOp, KeyCondition, KeyConditionSpec, QueryError, SortCondition,
        compile_filter, compile_key_condition,
    },
    store::Scalar,
    test_fixtures,
    types::Instant,
    value::Value,
};

fn compile(filter: &Filter) -> Result<(String, ExprBuilder), QueryError> {
    let registry = test_fixtures::registry();
    let user = registry.entity("user").unwrap();
    let mut builder = ExprBuilder::new();
    let compiled = compile_filter(&user, filter, &mut builder)?;

    Ok((compiled, builder))
}

#[test]
fn equality_compiles_with_placeholder_maps() {
    let (compiled, builder) = compile(&Filter::eq("status", "active")).unwrap();

    assert_eq!(compiled, "#n1 = :v1");
    assert_eq!(builder.names()["#n1"], "status");
    assert_eq!(builder.values()[":v1"], Scalar::S("active".to_string()));
}

#[test]
fn nested_boolean_structure_parenthesizes() {
    let filter = Filter::And(vec![
        Filter::eq("status", "active"),
        Filter::Or(vec![
            Filter::gt("score", 10_i64),
            Filter::eq("role", "admin").not(),
        ]),
    ]);

    let (compiled, _) = compile(&filter).unwrap();
    assert_eq!(
        compiled,
        "(#n1 = :v1 AND (#n2 > :v2 OR NOT (#n3 = :v3)))"
    );
}

#[test]
fn operator_forms_compile_to_backend_syntax() {
    let cases = [
        (Filter::ne("status", "x"), "#n1 <> :v1"),
        (Filter::gte("score", 1_i64), "#n1 >= :v1"),
        (Filter::lte("score", 1_i64), "#n1 <= :v1"),
        (Filter::contains("name", "ann"), "contains(#n1, :v1)"),
        (Filter::begins_with("name", "an"), "begins_with(#n1, :v1)"),
        (Filter::exists("email", true), "attribute_exists(#n1)"),
        (Filter::exists("email", false), "attribute_not_exists(#n1)"),
    ];

    for (filter, expected) in cases {
        let (compiled, _) = compile(&filter).unwrap();
        assert_eq!(compiled, expected);
    }
}

#[test]
fn in_lists_every_member() {
    let filter = Filter::is_in(
        "role",
        vec![Value::Str("admin".into()), Value::Str("editor".into())],
    );

    let (compiled, builder) = compile(&filter).unwrap();
    assert_eq!(compiled, "#n1 IN (:v1, :v2)");
    assert_eq!(builder.values().len(), 2);
}

#[test]
fn in_rejects_empty_arrays() {
    assert!(matches!(
        compile(&Filter::is_in("role", Vec::new())),
        Err(QueryError::InvalidOperand { .. })
    ));
}

#[test]
fn empty_groups_are_rejected() {
    assert!(matches!(
        compile(&Filter::And(Vec::new())),
        Err(QueryError::EmptyGroup { operator: "$and" })
    ));
}

#[test]
fn unknown_fields_are_rejected() {
    assert!(matches!(
        compile(&Filter::eq("ghost", 1_i64)),
        Err(QueryError::UnknownField { .. })
    ));
}

#[test]
fn null_operands_are_rejected() {
    assert!(matches!(
        compile(&Filter::Cond(
            "status".to_string(),
            FilterOp::Eq(Value::Null)
        )),
        Err(QueryError::InvalidOperand { .. })
    ));
}

#[test]
fn filter_operands_use_the_storage_encoding() {
    let filter = Filter::gte("created_at", Value::Instant(Instant::from_millis(1_234)));

    let (_, builder) = compile(&filter).unwrap();
    assert_eq!(builder.values()[":v1"], Scalar::N("1234".to_string()));
}

#[test]
fn compilation_is_idempotent_modulo_placeholders() {
    let filter = Filter::And(vec![
        Filter::eq("status", "active"),
        Filter::gt("score", 5_i64),
    ]);

    let (first, _) = compile(&filter).unwrap();
    let (second, _) = compile(&filter).unwrap();
    assert_eq!(first, second);
}

#[test]
fn name_placeholders_dedupe_values_do_not() {
    let filter = Filter::And(vec![
        Filter::gt("score", 1_i64),
        Filter::lt("score", 9_i64),
    ]);

    let (compiled, builder) = compile(&filter).unwrap();
    assert_eq!(compiled, "(#n1 > :v1 AND #n1 < :v2)");
    assert_eq!(builder.names().len(), 1);
    assert_eq!(builder.values().len(), 2);
}

// ── Key conditions ─────────────────────────────────────────────────

fn sort_spec<'a>(
    user: &'a crate::schema::EntityDef,
    pk_value: &str,
) -> KeyConditionSpec<'a> {
    KeyConditionSpec {
        index_name: "byRole",
        pk_attr: "_gsi1_pk",
        sk_attr: "_gsi1_sk",
        pk_value: pk_value.to_string(),
        sort_field: user.field_def("status"),
        sort_field_name: "status",
    }
}

#[test]
fn partition_only_key_condition() {
    let registry = test_fixtures::registry();
    let user = registry.entity("user").unwrap();
    let mut builder = ExprBuilder::new();

    let compiled =
        compile_key_condition(&sort_spec(&user, "no-tenant#u#ix1#admin"), None, &mut builder)
            .unwrap();

    assert_eq!(compiled, "#n1 = :v1");
    assert_eq!(
        builder.values()[":v1"],
        Scalar::S("no-tenant#u#ix1#admin".to_string())
    );
}

#[test]
fn sort_conditions_compile_each_shape() {
    let registry = test_fixtures::registry();
    let user = registry.entity("user").unwrap();

    let cases = [
        (
            KeyCondition::Eq(Value::Str("active".into())),
            "#n1 = :v1 AND #n2 = :v2",
        ),
        (
            KeyCondition::BeginsWith(Value::Str("act".into())),
            "#n1 = :v1 AND begins_with(#n2, :v2)",
        ),
        (
            KeyCondition::Between(Value::Str("a".into()), Value::Str("m".into())),
            "#n1 = :v1 AND #n2 BETWEEN :v2 AND :v3",
        ),
        (
            KeyCondition::Gte(Value::Str("active".into())),
            "#n1 = :v1 AND #n2 >= :v2",
        ),
    ];

    for (condition, expected) in cases {
        let mut builder = ExprBuilder::new();
        let compiled = compile_key_condition(
            &sort_spec(&user, "no-tenant#u#ix1#admin"),
            Some(&SortCondition::new("status", condition)),
            &mut builder,
        )
        .unwrap();
        assert_eq!(compiled, expected);
    }
}

#[test]
fn sort_condition_on_wrong_field_is_rejected() {
    let registry = test_fixtures::registry();
    let user = registry.entity("user").unwrap();
    let mut builder = ExprBuilder::new();

    let result = compile_key_condition(
        &sort_spec(&user, "no-tenant#u#ix1#admin"),
        Some(&SortCondition::new(
            "name",
            KeyCondition::Eq(Value::Str("x".into())),
        )),
        &mut builder,
    );

    assert!(matches!(
        result,
        Err(QueryError::NotSortKey { field, index }) if field == "name" && index == "byRole"
    ));
}
