pub(crate) mod compile;

#[cfg(test)]
mod tests;

pub use compile::{KeyConditionSpec, compile_filter, compile_key_condition};

use crate::{field::FieldError, store::Scalar, value::Value};
use std::{collections::BTreeMap, ops::BitAnd, ops::BitOr};
use thiserror::Error as ThisError;

///
/// Filter AST
///
/// Pure representation of filter and condition expressions. No schema
/// knowledge lives here; field resolution, operand validation, and
/// placeholder allocation all happen at compile time against an entity
/// definition.
///

///
/// FilterOp
///

#[derive(Clone, Debug, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Contains(Value),
    BeginsWith(Value),
    In(Vec<Value>),
    Exists(bool),
}

impl FilterOp {
    /// Operator token used in error payloads and diagnostics.
    #[must_use]
    pub const fn token(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Ne(_) => "$ne",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::Contains(_) => "$contains",
            Self::BeginsWith(_) => "$beginsWith",
            Self::In(_) => "$in",
            Self::Exists(_) => "$exists",
        }
    }
}

///
/// Filter
///

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    And(Vec<Self>),
    Or(Vec<Self>),
    Not(Box<Self>),
    Cond(String, FilterOp),
}

impl Filter {
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Cond(field.into(), FilterOp::Eq(value.into()))
    }

    #[must_use]
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Cond(field.into(), FilterOp::Ne(value.into()))
    }

    #[must_use]
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Cond(field.into(), FilterOp::Gt(value.into()))
    }

    #[must_use]
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Cond(field.into(), FilterOp::Gte(value.into()))
    }

    #[must_use]
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Cond(field.into(), FilterOp::Lt(value.into()))
    }

    #[must_use]
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Cond(field.into(), FilterOp::Lte(value.into()))
    }

    #[must_use]
    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Cond(field.into(), FilterOp::Contains(value.into()))
    }

    #[must_use]
    pub fn begins_with(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Cond(field.into(), FilterOp::BeginsWith(value.into()))
    }

    #[must_use]
    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::Cond(field.into(), FilterOp::In(values))
    }

    #[must_use]
    pub fn exists(field: impl Into<String>, present: bool) -> Self {
        Self::Cond(field.into(), FilterOp::Exists(present))
    }

    #[must_use]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}

impl BitAnd for Filter {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self::And(vec![self, rhs])
    }
}

impl BitOr for Filter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self::Or(vec![self, rhs])
    }
}

///
/// KeyCondition
///
/// Sort-key clause of an index query. The partition side is always an
/// equality supplied separately; these shapes are the only ones the
/// backend accepts against a sort key.
///

#[derive(Clone, Debug, PartialEq)]
pub enum KeyCondition {
    Eq(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    BeginsWith(Value),
    Between(Value, Value),
}

impl KeyCondition {
    #[must_use]
    pub const fn token(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::BeginsWith(_) => "$beginsWith",
            Self::Between(..) => "$between",
        }
    }
}

///
/// SortCondition
///
/// A key condition addressed at a declared field. Compilation rejects any
/// field that is not the sort key of the queried index.
///

#[derive(Clone, Debug, PartialEq)]
pub struct SortCondition {
    pub field: String,
    pub condition: KeyCondition,
}

impl SortCondition {
    #[must_use]
    pub fn new(field: impl Into<String>, condition: KeyCondition) -> Self {
        Self {
            field: field.into(),
            condition,
        }
    }
}

///
/// QueryError
///

#[derive(Clone, Debug, ThisError)]
pub enum QueryError {
    #[error("unknown field {field} on entity {entity}")]
    UnknownField { entity: String, field: String },

    #[error("field {field} is not the sort key for index {index}")]
    NotSortKey { field: String, index: String },

    #[error("index {index} is not declared on entity {entity}")]
    UnknownIndex { entity: String, index: String },

    #[error("unique constraint on field {field} is not declared on entity {entity}")]
    UnknownConstraint { entity: String, field: String },

    #[error("operator {operator} on field {field} rejects this operand: {message}")]
    InvalidOperand {
        field: String,
        operator: &'static str,
        message: String,
    },

    #[error("operator {operator} requires a non-empty group")]
    EmptyGroup { operator: &'static str },

    #[error("entity {entity} is not declared iterable")]
    NotIterable { entity: String },

    #[error("bucket {bucket} is out of range for entity {entity}")]
    BucketOutOfRange { entity: String, bucket: u32 },

    #[error(transparent)]
    Field(#[from] FieldError),
}

///
/// ExprBuilder
///
/// Allocates the attribute-name and value placeholders for one compiled
/// request. Placeholders are monotonic and unique per compilation; name
/// placeholders are deduplicated per attribute, value placeholders never
/// are.
///

#[derive(Debug, Default)]
pub struct ExprBuilder {
    names: BTreeMap<String, String>,
    values: BTreeMap<String, Scalar>,
    name_by_attr: BTreeMap<String, String>,
    name_seq: usize,
    value_seq: usize,
}

impl ExprBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Placeholder for an attribute name, reusing the existing one if the
    /// attribute was bound before.
    pub fn bind_name(&mut self, attr: &str) -> String {
        if let Some(placeholder) = self.name_by_attr.get(attr) {
            return placeholder.clone();
        }

        self.name_seq += 1;
        let placeholder = format!("#n{}", self.name_seq);
        self.names.insert(placeholder.clone(), attr.to_string());
        self.name_by_attr.insert(attr.to_string(), placeholder.clone());

        placeholder
    }

    /// Fresh placeholder for one scalar operand.
    pub fn bind_value(&mut self, scalar: Scalar) -> String {
        self.value_seq += 1;
        let placeholder = format!(":v{}", self.value_seq);
        self.values.insert(placeholder.clone(), scalar);

        placeholder
    }

    #[must_use]
    pub const fn names(&self) -> &BTreeMap<String, String> {
        &self.names
    }

    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, Scalar> {
        &self.values
    }

    #[must_use]
    pub fn into_parts(self) -> (BTreeMap<String, String>, BTreeMap<String, Scalar>) {
        (self.names, self.values)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.values.is_empty()
    }
}
