use crate::{
    expr::ExprBuilder,
    field::{FieldDef, FieldError, FieldKind},
    value::Value,
};

///
/// CounterUpdate
///
/// Narrow sum for counter mutations. The `"+N"` / `"-N"` string form is an
/// ingress convenience only; it is parsed here and never travels further.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterUpdate {
    Delta(i64),
    Absolute(i64),
}

impl CounterUpdate {
    pub fn parse(field: &str, value: &Value) -> Result<Self, FieldError> {
        let malformed = || FieldError::Counter {
            field: field.to_string(),
            input: value.to_string(),
        };

        match value {
            Value::Int(n) => Ok(Self::Absolute(*n)),
            Value::Str(s) => {
                let (sign, digits) = match s.as_bytes().first() {
                    Some(b'+') => (1, &s[1..]),
                    Some(b'-') => (-1, &s[1..]),
                    _ => return Err(malformed()),
                };
                let magnitude: i64 = digits.parse().map_err(|_| malformed())?;
                Ok(Self::Delta(sign * magnitude))
            }
            _ => Err(malformed()),
        }
    }

    /// Value the counter takes when applied against `current`.
    #[must_use]
    pub const fn resolve_from(self, current: i64) -> i64 {
        match self {
            Self::Delta(d) => current + d,
            Self::Absolute(n) => n,
        }
    }
}

///
/// UpdateKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateKind {
    Set,
    Add,
    Remove,
}

///
/// UpdateFragment
///
/// One attribute's contribution to an update expression. Placeholder
/// bindings live on the shared `ExprBuilder` the fragment was compiled
/// against.
///

#[derive(Clone, Debug)]
pub struct UpdateFragment {
    pub kind: UpdateKind,
    pub fragment: String,
}

impl UpdateFragment {
    /// Assemble fragments into the backend's update-expression form,
    /// grouping clauses by kind: `SET a = :v, b = :w ADD c :x REMOVE d`.
    #[must_use]
    pub fn assemble(fragments: &[Self]) -> String {
        let mut sections = Vec::with_capacity(3);

        for (kind, keyword) in [
            (UpdateKind::Set, "SET"),
            (UpdateKind::Add, "ADD"),
            (UpdateKind::Remove, "REMOVE"),
        ] {
            let clause: Vec<&str> = fragments
                .iter()
                .filter(|f| f.kind == kind)
                .map(|f| f.fragment.as_str())
                .collect();
            if !clause.is_empty() {
                sections.push(format!("{keyword} {}", clause.join(", ")));
            }
        }

        sections.join(" ")
    }
}

impl FieldDef {
    /// Compile this field's contribution to an update expression.
    ///
    /// Explicit null emits `REMOVE`; counter deltas emit `ADD`; everything
    /// else emits `SET`. Returns `None` when the value encodes to nothing
    /// at all (which only null does, and null already removes).
    pub fn update_fragment(
        &self,
        attr: &str,
        value: &Value,
        builder: &mut ExprBuilder,
    ) -> Result<Option<UpdateFragment>, FieldError> {
        let name = builder.bind_name(attr);

        if value.is_null() {
            return Ok(Some(UpdateFragment {
                kind: UpdateKind::Remove,
                fragment: name,
            }));
        }

        if matches!(self.kind, FieldKind::Counter) {
            let update = CounterUpdate::parse(&self.name, value)?;
            let fragment = match update {
                CounterUpdate::Delta(delta) => {
                    let value = builder.bind_value(crate::store::Scalar::number(delta));
                    UpdateFragment {
                        kind: UpdateKind::Add,
                        fragment: format!("{name} {value}"),
                    }
                }
                CounterUpdate::Absolute(n) => {
                    let value = builder.bind_value(crate::store::Scalar::number(n));
                    UpdateFragment {
                        kind: UpdateKind::Set,
                        fragment: format!("{name} = {value}"),
                    }
                }
            };
            return Ok(Some(fragment));
        }

        match self.encode_storage(value)? {
            Some(scalar) => {
                let value = builder.bind_value(scalar);
                Ok(Some(UpdateFragment {
                    kind: UpdateKind::Set,
                    fragment: format!("{name} = {value}"),
                }))
            }
            None => Ok(None),
        }
    }
}
