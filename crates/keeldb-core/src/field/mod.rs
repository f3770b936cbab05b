pub(crate) mod codec;
pub(crate) mod update;

#[cfg(test)]
mod tests;

pub use update::{CounterUpdate, UpdateFragment, UpdateKind};

use crate::{
    types::{Instant, UlidId},
    value::Value,
};
use std::{fmt, sync::Arc};
use thiserror::Error as ThisError;

///
/// FieldError
///

#[derive(Clone, Debug, ThisError)]
pub enum FieldError {
    #[error("field {field} is required")]
    Required { field: String },

    #[error("field {field} rejects empty strings")]
    EmptyString { field: String },

    #[error("field {field} expects {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: String,
    },

    #[error("field {field} value does not match pattern {pattern}")]
    Pattern { field: String, pattern: String },

    #[error("field {field} exceeds precision of {precision} decimal places")]
    Precision { field: String, precision: u8 },

    #[error("field {field} ({kind}) cannot be encoded into an index key")]
    NotIndexable { field: String, kind: &'static str },

    #[error("field {field} counter update is malformed: {input}")]
    Counter { field: String, input: String },

    #[error("field {field} stored form is corrupt: {message}")]
    Corrupt { field: String, message: String },
}

///
/// FieldKind
///
/// Runtime type surface of one declared field. Intentionally a flat tagged
/// sum: every behavior (validate, storage codec, index codec, update
/// fragment) dispatches on this, never on a type hierarchy.
///

#[derive(Clone, Debug)]
pub enum FieldKind {
    String {
        pattern: Option<String>,
    },
    Integer,
    Float {
        precision: Option<u8>,
    },
    Boolean,
    Instant,
    /// Expiry instant; must be declared under the field name `ttl` and is
    /// stored in whole seconds rather than milliseconds.
    TtlInstant,
    Blob,
    Ulid {
        auto_assign: bool,
    },
    /// Overwritten with a fresh ulid on every save.
    VersionUlid,
    Counter,
    CreateInstant,
    ModifyInstant,
    RelatedRef {
        target: String,
    },
}

impl FieldKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::String { .. } => "string",
            Self::Integer => "integer",
            Self::Float { .. } => "float",
            Self::Boolean => "boolean",
            Self::Instant => "instant",
            Self::TtlInstant => "ttl-instant",
            Self::Blob => "binary-blob",
            Self::Ulid { .. } => "ulid",
            Self::VersionUlid => "version-ulid",
            Self::Counter => "counter",
            Self::CreateInstant => "create-instant",
            Self::ModifyInstant => "modify-instant",
            Self::RelatedRef { .. } => "related-ref",
        }
    }

    #[must_use]
    pub const fn is_instant_like(&self) -> bool {
        matches!(
            self,
            Self::Instant | Self::TtlInstant | Self::CreateInstant | Self::ModifyInstant
        )
    }

    /// Kinds the engine assigns itself on save; user-supplied values for
    /// these are ignored.
    #[must_use]
    pub const fn is_engine_managed(&self) -> bool {
        matches!(
            self,
            Self::VersionUlid | Self::CreateInstant | Self::ModifyInstant
        )
    }
}

///
/// FieldDefault
///

#[derive(Clone)]
pub enum FieldDefault {
    Literal(Value),
    Producer(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl FieldDefault {
    #[must_use]
    pub fn produce(&self) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Producer(f) => f(),
        }
    }
}

impl fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

///
/// FieldDef
///

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<FieldDefault>,
}

impl FieldDef {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
        }
    }

    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(FieldDefault::Literal(default));
        self
    }

    #[must_use]
    pub fn with_default_producer(
        mut self,
        producer: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        self.default = Some(FieldDefault::Producer(Arc::new(producer)));
        self
    }

    fn type_mismatch(&self, expected: &'static str, actual: &Value) -> FieldError {
        FieldError::TypeMismatch {
            field: self.name.clone(),
            expected,
            actual: actual.kind().to_string(),
        }
    }

    /// Validate an ingress value against this field's kind and options.
    /// `Null` is always accepted here; required-ness is a save-time check
    /// because updates use `Null` to clear attributes.
    pub fn validate(&self, value: &Value) -> Result<(), FieldError> {
        if value.is_null() {
            return Ok(());
        }

        match (&self.kind, value) {
            (FieldKind::String { pattern }, Value::Str(s)) => {
                if s.is_empty() {
                    return Err(FieldError::EmptyString {
                        field: self.name.clone(),
                    });
                }
                if let Some(pattern) = pattern
                    && !wildcard_match(pattern, s)
                {
                    return Err(FieldError::Pattern {
                        field: self.name.clone(),
                        pattern: pattern.clone(),
                    });
                }
                Ok(())
            }
            (FieldKind::String { .. }, other) => Err(self.type_mismatch("string", other)),

            (FieldKind::Integer, Value::Int(_)) => Ok(()),
            (FieldKind::Integer, other) => Err(self.type_mismatch("integer", other)),

            (FieldKind::Float { precision }, Value::Float(f)) => {
                if let Some(precision) = precision
                    && exceeds_precision(*f, *precision)
                {
                    return Err(FieldError::Precision {
                        field: self.name.clone(),
                        precision: *precision,
                    });
                }
                Ok(())
            }
            (FieldKind::Float { .. }, Value::Int(_)) => Ok(()),
            (FieldKind::Float { .. }, other) => Err(self.type_mismatch("float", other)),

            (FieldKind::Boolean, Value::Bool(_)) => Ok(()),
            (FieldKind::Boolean, other) => Err(self.type_mismatch("boolean", other)),

            (kind, Value::Instant(_)) if kind.is_instant_like() => Ok(()),
            (kind, Value::Int(_)) if kind.is_instant_like() => Ok(()),
            (kind, Value::Str(s)) if kind.is_instant_like() => Instant::parse_iso8601(s)
                .map(|_| ())
                .map_err(|_| self.type_mismatch("instant", value)),
            (kind, other) if kind.is_instant_like() => Err(self.type_mismatch("instant", other)),

            (FieldKind::Blob, Value::Bytes(_)) => Ok(()),
            (FieldKind::Blob, other) => Err(self.type_mismatch("bytes", other)),

            (FieldKind::Ulid { .. } | FieldKind::VersionUlid, Value::Ulid(_)) => Ok(()),
            (FieldKind::Ulid { .. } | FieldKind::VersionUlid, Value::Str(s)) => UlidId::parse(s)
                .map(|_| ())
                .map_err(|_| self.type_mismatch("ulid", value)),
            (FieldKind::Ulid { .. } | FieldKind::VersionUlid, other) => {
                Err(self.type_mismatch("ulid", other))
            }

            (FieldKind::Counter, Value::Int(_)) => Ok(()),
            (FieldKind::Counter, Value::Str(_)) => {
                CounterUpdate::parse(&self.name, value).map(|_| ())
            }
            (FieldKind::Counter, other) => Err(self.type_mismatch("counter", other)),

            (FieldKind::RelatedRef { .. }, Value::Str(s)) => {
                if s.is_empty() {
                    return Err(FieldError::EmptyString {
                        field: self.name.clone(),
                    });
                }
                Ok(())
            }
            (FieldKind::RelatedRef { .. }, Value::Ulid(_)) => Ok(()),
            (FieldKind::RelatedRef { .. }, other) => Err(self.type_mismatch("related-ref", other)),

            // instant-like kinds are fully handled by the guard arms above
            (kind, other) => Err(FieldError::TypeMismatch {
                field: self.name.clone(),
                expected: kind.name(),
                actual: other.kind().to_string(),
            }),
        }
    }

    /// Coerce an ingress value into its canonical in-memory form.
    /// Instant strings/integers become `Instant`, ulid strings become
    /// `Ulid`, related refs become plain id strings. Counters keep their
    /// relative string form until update-expression assembly.
    pub fn normalize(&self, value: Value) -> Result<Value, FieldError> {
        self.validate(&value)?;

        if value.is_null() {
            return Ok(Value::Null);
        }

        let normalized = match (&self.kind, value) {
            (kind, Value::Int(ms)) if kind.is_instant_like() => {
                Value::Instant(Instant::from_millis(ms))
            }
            (kind, Value::Str(s)) if kind.is_instant_like() => {
                // already vetted by validate
                Value::Instant(Instant::parse_iso8601(&s).map_err(|_| FieldError::Corrupt {
                    field: self.name.clone(),
                    message: format!("unparsable instant: {s}"),
                })?)
            }
            (FieldKind::Ulid { .. } | FieldKind::VersionUlid, Value::Str(s)) => {
                Value::Ulid(UlidId::parse(&s).map_err(|_| FieldError::Corrupt {
                    field: self.name.clone(),
                    message: format!("unparsable ulid: {s}"),
                })?)
            }
            (FieldKind::RelatedRef { .. }, Value::Ulid(u)) => Value::Str(u.to_string()),
            (FieldKind::Float { .. }, Value::Int(n)) => {
                #[allow(clippy::cast_precision_loss)]
                Value::Float(n as f64)
            }
            (_, other) => other,
        };

        Ok(normalized)
    }
}

/// Anchored wildcard match: `*` matches any run of characters, everything
/// else is literal. The only pattern language field options support.
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == input;
    }

    let Some(mut rest) = input.strip_prefix(segments[0]) else {
        return false;
    };

    let last = segments[segments.len() - 1];
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }

    rest.ends_with(last)
}

fn exceeds_precision(f: f64, precision: u8) -> bool {
    let rounded = format!("{:.1$}", f, usize::from(precision));
    rounded.parse::<f64>() != Ok(f)
}
