//! KeelDB — a tenant-aware object-persistence runtime over a wide-column
//! key-value store.
//!
//! Declare entities once; the runtime derives physical storage keys,
//! secondary-index projections, and uniqueness records, batches concurrent
//! point-reads inside a request context, and plans every mutation as either
//! a single conditional write or a transaction.
//!
//! ```no_run
//! use keeldb::prelude::*;
//! use keeldb::{
//!     config::Config,
//!     field::{FieldDef, FieldKind},
//!     schema::{PrimaryKeyDef, RegistryBuilder},
//!     store::memory::MemoryStore,
//! };
//! use std::{collections::BTreeMap, sync::Arc};
//!
//! # async fn demo() -> Result<(), keeldb::error::Error> {
//! let mut schema = RegistryBuilder::new();
//! schema.register(
//!     EntityDef::new("note", "nt")
//!         .field(FieldDef::new("id", FieldKind::Ulid { auto_assign: true }))
//!         .field(FieldDef::new("body", FieldKind::String { pattern: None }).required())
//!         .primary_key(PrimaryKeyDef::partition_only("id")),
//! )?;
//!
//! let db = Db::new(
//!     Arc::new(MemoryStore::new()),
//!     schema.finalize()?,
//!     Config::new("main"),
//! );
//!
//! RequestContext::run(async {
//!     let note = db
//!         .create(
//!             "note",
//!             BTreeMap::from([("body".to_string(), Value::Str("hello".into()))]),
//!         )
//!         .await?;
//!
//!     let again = db.get("note", &note.primary_id(), GetOptions::default()).await?;
//!     assert!(again.exists());
//!     Ok::<_, keeldb::error::Error>(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub use keeldb_core::{
    MAX_BATCH_KEYS, batch, cache, config, context, db, error, expr, field, instance, key, schema,
    store, types, value,
};

// top-level vocabulary
pub use keeldb_core::{
    config::Config,
    context::RequestContext,
    db::Db,
    error::Error,
    instance::Instance,
    value::Value,
};

pub mod prelude {
    pub use keeldb_core::prelude::*;
}
