//! Core runtime for KeelDB: field kernel, schema registry, key codec,
//! expression compiler, request contexts, batch scheduler, and the mutation,
//! query, and iteration engines, with the ergonomics exported via `prelude`.

pub mod batch;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod expr;
pub mod field;
pub mod instance;
pub mod key;
pub mod schema;
pub mod store;
pub mod types;
pub mod value;

// test
#[cfg(test)]
pub(crate) mod test_fixtures;

///
/// CONSTANTS
///

/// Maximum number of keys the backend accepts in one batched read.
///
/// Queues flush early when they reach this ceiling regardless of the
/// coalescing window.
pub const MAX_BATCH_KEYS: usize = 100;

/// Number of secondary-index slots reserved per entity.
pub const INDEX_SLOTS: usize = 3;

/// Number of uniqueness-constraint slots reserved per entity.
pub const UNIQUE_SLOTS: usize = 3;

///
/// Prelude
///
/// Prelude contains only domain vocabulary.
/// No errors, stores, schedulers, or helpers are re-exported here.
///

pub mod prelude {
    pub use crate::{
        context::{ContextOptions, RequestContext},
        db::{Db, DeleteOptions, GetOptions, QueryOptions, UpdateOptions},
        expr::{Filter, FilterOp, KeyCondition},
        instance::Instance,
        schema::{EntityDef, IndexSlot, KeyField, Registry, UniqueSlot},
        types::{Instant, TenantId, UlidId},
        value::Value,
    };
}
