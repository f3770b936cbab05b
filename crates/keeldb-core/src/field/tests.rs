use crate::{
    expr::ExprBuilder,
    field::{CounterUpdate, FieldDef, FieldError, FieldKind, UpdateFragment, UpdateKind},
    store::Scalar,
    types::{Instant, UlidId},
    value::Value,
};
use proptest::prelude::*;

fn string_field() -> FieldDef {
    FieldDef::new("name", FieldKind::String { pattern: None })
}

#[test]
fn string_rejects_empty_and_wrong_types() {
    let field = string_field();

    assert!(field.validate(&Value::Str("ok".into())).is_ok());
    assert!(matches!(
        field.validate(&Value::Str(String::new())),
        Err(FieldError::EmptyString { .. })
    ));
    assert!(matches!(
        field.validate(&Value::Int(1)),
        Err(FieldError::TypeMismatch { .. })
    ));
}

#[test]
fn string_pattern_is_anchored_wildcard() {
    let field = FieldDef::new(
        "sku",
        FieldKind::String {
            pattern: Some("ord-*-v*".to_string()),
        },
    );

    assert!(field.validate(&Value::Str("ord-123-v2".into())).is_ok());
    assert!(field.validate(&Value::Str("xord-123-v2".into())).is_err());
    assert!(field.validate(&Value::Str("ord-123".into())).is_err());
}

#[test]
fn instant_accepts_all_ingress_forms() {
    let field = FieldDef::new("at", FieldKind::Instant);
    let millis = 1_709_294_400_250_i64;

    let from_int = field.normalize(Value::Int(millis)).unwrap();
    let from_str = field
        .normalize(Value::Str("2024-03-01T12:00:00.250Z".into()))
        .unwrap();

    assert_eq!(from_int, Value::Instant(Instant::from_millis(millis)));
    assert_eq!(from_int, from_str);
}

#[test]
fn instant_storage_is_millis_and_ttl_is_seconds() {
    let at = FieldDef::new("at", FieldKind::Instant);
    let ttl = FieldDef::new("ttl", FieldKind::TtlInstant);
    let value = Value::Instant(Instant::from_millis(1_500));

    assert_eq!(
        at.encode_storage(&value).unwrap(),
        Some(Scalar::N("1500".to_string()))
    );
    assert_eq!(
        ttl.encode_storage(&value).unwrap(),
        Some(Scalar::N("1".to_string()))
    );
}

#[test]
fn storage_decode_round_trips() {
    let cases: Vec<(FieldDef, Value)> = vec![
        (string_field(), Value::Str("hello".into())),
        (FieldDef::new("n", FieldKind::Integer), Value::Int(-42)),
        (
            FieldDef::new("f", FieldKind::Float { precision: None }),
            Value::Float(2.5),
        ),
        (FieldDef::new("b", FieldKind::Boolean), Value::Bool(true)),
        (
            FieldDef::new("at", FieldKind::Instant),
            Value::Instant(Instant::from_millis(77)),
        ),
        (
            FieldDef::new("blob", FieldKind::Blob),
            Value::Bytes(vec![1, 2, 3]),
        ),
        (
            FieldDef::new("id", FieldKind::Ulid { auto_assign: false }),
            Value::Ulid(UlidId::generate()),
        ),
    ];

    for (field, value) in cases {
        let scalar = field.encode_storage(&value).unwrap().unwrap();
        assert_eq!(field.decode_storage(&scalar).unwrap(), value, "{}", field.name);
    }
}

#[test]
fn integer_index_encoding_pads_to_twenty_digits() {
    let field = FieldDef::new("n", FieldKind::Integer);

    assert_eq!(
        field.encode_index(&Value::Int(1234)).unwrap(),
        "00000000000000001234"
    );
    assert_eq!(field.encode_index(&Value::Int(1234)).unwrap().len(), 20);
}

#[test]
fn instant_index_encoding_orders_lexicographically() {
    let field = FieldDef::new("at", FieldKind::Instant);
    let earlier = field
        .encode_index(&Value::Instant(Instant::from_millis(999)))
        .unwrap();
    let later = field
        .encode_index(&Value::Instant(Instant::from_millis(1_000)))
        .unwrap();

    assert!(earlier < later);
}

proptest! {
    #[test]
    fn nonnegative_integer_index_order_matches_numeric(a in 0i64..=i64::MAX, b in 0i64..=i64::MAX) {
        let field = FieldDef::new("n", FieldKind::Integer);
        let ea = field.encode_index(&Value::Int(a)).unwrap();
        let eb = field.encode_index(&Value::Int(b)).unwrap();

        prop_assert_eq!(ea.cmp(&eb), a.cmp(&b));
    }
}

#[test]
fn blob_is_not_indexable() {
    let field = FieldDef::new("blob", FieldKind::Blob);

    assert!(matches!(
        field.encode_index(&Value::Bytes(vec![1])),
        Err(FieldError::NotIndexable { .. })
    ));
}

#[test]
fn counter_parses_relative_and_absolute_forms() {
    assert_eq!(
        CounterUpdate::parse("score", &Value::Int(5)).unwrap(),
        CounterUpdate::Absolute(5)
    );
    assert_eq!(
        CounterUpdate::parse("score", &Value::Str("+3".into())).unwrap(),
        CounterUpdate::Delta(3)
    );
    assert_eq!(
        CounterUpdate::parse("score", &Value::Str("-7".into())).unwrap(),
        CounterUpdate::Delta(-7)
    );
    assert!(CounterUpdate::parse("score", &Value::Str("7".into())).is_err());
    assert!(CounterUpdate::parse("score", &Value::Str("+x".into())).is_err());
}

#[test]
fn counter_fragments_split_on_relative_vs_absolute() {
    let field = FieldDef::new("score", FieldKind::Counter);
    let mut builder = ExprBuilder::new();

    let delta = field
        .update_fragment("score", &Value::Str("+2".into()), &mut builder)
        .unwrap()
        .unwrap();
    let absolute = field
        .update_fragment("score", &Value::Int(10), &mut builder)
        .unwrap()
        .unwrap();

    assert_eq!(delta.kind, UpdateKind::Add);
    assert_eq!(absolute.kind, UpdateKind::Set);
    assert_eq!(delta.fragment, "#n1 :v1");
    assert_eq!(absolute.fragment, "#n1 = :v2");
}

#[test]
fn null_fragment_removes_the_attribute() {
    let field = string_field();
    let mut builder = ExprBuilder::new();

    let fragment = field
        .update_fragment("name", &Value::Null, &mut builder)
        .unwrap()
        .unwrap();

    assert_eq!(fragment.kind, UpdateKind::Remove);
    assert_eq!(fragment.fragment, "#n1");
}

#[test]
fn fragments_assemble_grouped_by_kind() {
    let name = string_field();
    let score = FieldDef::new("score", FieldKind::Counter);
    let mut builder = ExprBuilder::new();

    let fragments = [
        name.update_fragment("name", &Value::Str("x".into()), &mut builder)
            .unwrap()
            .unwrap(),
        score
            .update_fragment("score", &Value::Str("+1".into()), &mut builder)
            .unwrap()
            .unwrap(),
        name.update_fragment("other", &Value::Null, &mut builder)
            .unwrap()
            .unwrap(),
    ];

    assert_eq!(
        UpdateFragment::assemble(&fragments),
        "SET #n1 = :v1 ADD #n2 :v2 REMOVE #n3"
    );
}

#[test]
fn related_ref_normalizes_ulids_to_id_strings() {
    let field = FieldDef::new(
        "team",
        FieldKind::RelatedRef {
            target: "team".to_string(),
        },
    );
    let id = UlidId::generate();

    assert_eq!(
        field.normalize(Value::Ulid(id)).unwrap(),
        Value::Str(id.to_string())
    );
}

#[test]
fn defaults_produce_values() {
    let literal = string_field().with_default(Value::Str("anon".into()));
    let produced =
        FieldDef::new("n", FieldKind::Integer).with_default_producer(|| Value::Int(7));

    assert_eq!(
        literal.default.as_ref().unwrap().produce(),
        Value::Str("anon".into())
    );
    assert_eq!(produced.default.as_ref().unwrap().produce(), Value::Int(7));
}
