use crate::{
    field::{FieldDef, FieldError, FieldKind},
    store::Scalar,
    types::{Instant, UlidId},
    value::Value,
};

/// Width of the left-padded decimal form used for numeric index-key
/// components. Lexicographic order over the padded form matches numeric
/// order for non-negative values.
const INDEX_DECIMAL_WIDTH: usize = 20;

impl FieldDef {
    /// Encode a value into its wire scalar. `Ok(None)` means the attribute
    /// is absent (null clears it). Ingress forms are normalized first, so
    /// callers may pass ISO strings for instants, id strings for ulids, and
    /// so on.
    pub fn encode_storage(&self, value: &Value) -> Result<Option<Scalar>, FieldError> {
        let value = self.normalize(value.clone())?;
        if value.is_null() {
            return Ok(None);
        }

        let scalar = match (&self.kind, &value) {
            (FieldKind::String { .. } | FieldKind::RelatedRef { .. }, Value::Str(s)) => {
                // the backend rejects empty strings outright
                if s.is_empty() {
                    return Err(FieldError::EmptyString {
                        field: self.name.clone(),
                    });
                }
                Scalar::S(s.clone())
            }

            (FieldKind::Integer | FieldKind::Counter, Value::Int(n)) => Scalar::number(*n),
            // counter ingress may still carry the relative string form;
            // storage encoding resolves it as an absolute-from-zero value
            (FieldKind::Counter, Value::Str(_)) => {
                let update = super::CounterUpdate::parse(&self.name, &value)?;
                Scalar::number(update.resolve_from(0))
            }

            (FieldKind::Float { .. }, Value::Float(f)) => Scalar::float(*f),

            (FieldKind::Boolean, Value::Bool(b)) => Scalar::Bool(*b),

            (FieldKind::TtlInstant, Value::Instant(i)) => Scalar::number(i.as_secs()),
            (kind, Value::Instant(i)) if kind.is_instant_like() => Scalar::number(i.as_millis()),

            (FieldKind::Blob, Value::Bytes(b)) => Scalar::B(b.clone()),

            (FieldKind::Ulid { .. } | FieldKind::VersionUlid, Value::Ulid(u)) => {
                Scalar::S(u.to_string())
            }

            (_, other) => {
                return Err(FieldError::TypeMismatch {
                    field: self.name.clone(),
                    expected: self.kind.name(),
                    actual: other.kind().to_string(),
                });
            }
        };

        Ok(Some(scalar))
    }

    /// Decode a stored wire scalar back into a logical value.
    pub fn decode_storage(&self, scalar: &Scalar) -> Result<Value, FieldError> {
        let corrupt = |message: String| FieldError::Corrupt {
            field: self.name.clone(),
            message,
        };

        if matches!(scalar, Scalar::Null) {
            return Ok(Value::Null);
        }

        let value = match (&self.kind, scalar) {
            (FieldKind::String { .. } | FieldKind::RelatedRef { .. }, Scalar::S(s)) => {
                Value::Str(s.clone())
            }

            (FieldKind::Integer | FieldKind::Counter, Scalar::N(n)) => Value::Int(
                n.parse()
                    .map_err(|_| corrupt(format!("not an integer: {n}")))?,
            ),

            (FieldKind::Float { .. }, Scalar::N(n)) => Value::Float(
                n.parse()
                    .map_err(|_| corrupt(format!("not a float: {n}")))?,
            ),

            (FieldKind::Boolean, Scalar::Bool(b)) => Value::Bool(*b),

            (FieldKind::TtlInstant, Scalar::N(n)) => {
                let secs: i64 = n
                    .parse()
                    .map_err(|_| corrupt(format!("not a ttl second count: {n}")))?;
                Value::Instant(Instant::from_secs(secs))
            }
            (kind, Scalar::N(n)) if kind.is_instant_like() => {
                let millis: i64 = n
                    .parse()
                    .map_err(|_| corrupt(format!("not a millisecond count: {n}")))?;
                Value::Instant(Instant::from_millis(millis))
            }

            (FieldKind::Blob, Scalar::B(b)) => Value::Bytes(b.clone()),

            (FieldKind::Ulid { .. } | FieldKind::VersionUlid, Scalar::S(s)) => Value::Ulid(
                UlidId::parse(s).map_err(|_| corrupt(format!("not a ulid: {s}")))?,
            ),

            (_, other) => {
                return Err(corrupt(format!(
                    "stored scalar {other:?} does not match kind {}",
                    self.kind.name()
                )));
            }
        };

        Ok(value)
    }

    /// Encode a value into the string form used inside physical key
    /// components. Numeric kinds pad to a fixed decimal width so that
    /// lexicographic key order matches numeric order.
    pub fn encode_index(&self, value: &Value) -> Result<String, FieldError> {
        let value = self.normalize(value.clone())?;

        let encoded = match (&self.kind, &value) {
            (_, Value::Null) => {
                return Err(FieldError::Corrupt {
                    field: self.name.clone(),
                    message: "null cannot appear in an index key".to_string(),
                });
            }

            (FieldKind::Blob, _) => {
                return Err(FieldError::NotIndexable {
                    field: self.name.clone(),
                    kind: self.kind.name(),
                });
            }

            (FieldKind::Integer | FieldKind::Counter, Value::Int(n)) => pad_decimal(*n),

            (FieldKind::Float { .. }, Value::Float(f)) => {
                format!("{f:.prec$e}", prec = INDEX_DECIMAL_WIDTH)
            }

            (FieldKind::TtlInstant, Value::Instant(i)) => pad_decimal(i.as_secs()),
            (kind, Value::Instant(i)) if kind.is_instant_like() => pad_decimal(i.as_millis()),

            (FieldKind::Boolean, Value::Bool(b)) => if *b { "1" } else { "0" }.to_string(),

            (FieldKind::Ulid { .. } | FieldKind::VersionUlid, Value::Ulid(u)) => u.to_string(),

            (_, Value::Str(s)) => {
                if s.is_empty() {
                    return Err(FieldError::EmptyString {
                        field: self.name.clone(),
                    });
                }
                s.clone()
            }

            (_, other) => {
                return Err(FieldError::TypeMismatch {
                    field: self.name.clone(),
                    expected: self.kind.name(),
                    actual: other.kind().to_string(),
                });
            }
        };

        Ok(encoded)
    }
}

fn pad_decimal(n: i64) -> String {
    format!("{n:0width$}", width = INDEX_DECIMAL_WIDTH)
}
