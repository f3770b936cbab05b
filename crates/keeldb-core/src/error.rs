use crate::{
    expr::QueryError, field::FieldError, key::DataFormatError, schema::SchemaError,
    store::StoreError,
};
use thiserror::Error as ThisError;

///
/// Error
///
/// Public error taxonomy. Field, schema, query, and data-format failures
/// pass through transparently from their modules; the engine-level kinds
/// (not-found, conditional, timeout, canceled, context) are constructed at
/// operation boundaries. Backend errors that the mutation engine cannot
/// remap to something more specific surface unchanged as `Store`.
///

#[derive(Clone, Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("item not found: {primary_id}")]
    ItemNotFound { primary_id: String },

    #[error("{message}")]
    Conditional {
        operation: &'static str,
        constraint: Option<String>,
        message: String,
    },

    #[error(transparent)]
    DataFormat(#[from] DataFormatError),

    #[error("batched read for {entity} timed out past its {delay_ms}ms coalescing window")]
    Timeout { entity: String, delay_ms: u64 },

    #[error("operation canceled by context teardown")]
    Canceled,

    #[error("operation {operation} requires an active request context")]
    Context { operation: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub(crate) fn conditional(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Conditional {
            operation,
            constraint: None,
            message: message.into(),
        }
    }

    pub(crate) fn unique_violation(operation: &'static str, field: impl Into<String>) -> Self {
        let field = field.into();
        Self::Conditional {
            operation,
            constraint: Some(field.clone()),
            message: format!("{field} must be unique"),
        }
    }

    #[must_use]
    pub const fn is_conditional(&self) -> bool {
        matches!(self, Self::Conditional { .. })
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ItemNotFound { .. })
    }
}
