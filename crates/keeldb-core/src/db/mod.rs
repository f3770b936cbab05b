pub(crate) mod create;
pub(crate) mod delete;
pub(crate) mod hooks;
pub(crate) mod iterate;
pub(crate) mod query;
pub(crate) mod update;

#[cfg(test)]
mod tests;

pub use hooks::{MutationHook, SaveHookArgs};
pub use query::{Direction, QueryOptions, QueryResponse};

use crate::{
    MAX_BATCH_KEYS,
    batch::FetchEnv,
    config::Config,
    context::{RequestContext, tenant},
    error::Error,
    expr::Filter,
    field::FieldError,
    instance::Instance,
    key::{self, KeyCodec, PrimaryId},
    schema::{EntityDef, KeyField, Registry},
    store::{BatchGetItemInput, GetItemInput, Item, Scalar, StoreClient},
    value::Value,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use tracing::debug;

/// Rounds of unprocessed-key redrives before a batched read gives up.
const BATCH_REDRIVE_ROUNDS: usize = 3;

///
/// GetOptions
///

#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// Coalescing window in milliseconds. Zero bypasses the scheduler and
    /// issues a direct single-item read.
    pub batch_delay_ms: u64,
    /// Skip the instance cache and replace its entry with a fresh read.
    pub bypass_cache: bool,
}

impl GetOptions {
    #[must_use]
    pub const fn batched(delay_ms: u64) -> Self {
        Self {
            batch_delay_ms: delay_ms,
            bypass_cache: false,
        }
    }
}

///
/// UpdateOptions
///

#[derive(Clone, Debug, Default)]
pub struct UpdateOptions {
    /// Extra condition the stored record must satisfy, in the filter
    /// language.
    pub condition: Option<Filter>,
    /// Rewrite every secondary-index key, not only the touched ones.
    pub force_reindex: bool,
}

///
/// DeleteOptions
///

#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    pub condition: Option<Filter>,
}

///
/// Db
///
/// Engine handle: the shared wire client, the immutable schema registry,
/// and the runtime configuration. Cheap to clone; all per-request state
/// lives on the ambient `RequestContext`, never here.
///

#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

struct DbInner {
    store: Arc<dyn StoreClient>,
    registry: Registry,
    config: Config,
    hooks: Mutex<BTreeMap<String, Vec<Arc<dyn MutationHook>>>>,
    resolvers: Mutex<Vec<Arc<dyn tenant::TenantResolver>>>,
}

impl Db {
    #[must_use]
    pub fn new(store: Arc<dyn StoreClient>, registry: Registry, config: Config) -> Self {
        Self {
            inner: Arc::new(DbInner {
                store,
                registry,
                config,
                hooks: Mutex::new(BTreeMap::new()),
                resolvers: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Append a mutation hook for one entity. Hooks run in registration
    /// order.
    pub fn register_hook(&self, entity: impl Into<String>, hook: Arc<dyn MutationHook>) {
        self.inner
            .hooks
            .lock()
            .expect("hooks lock")
            .entry(entity.into())
            .or_default()
            .push(hook);
    }

    /// Append a tenant resolver consulted when no explicit tenant is set.
    pub fn register_tenant_resolver(&self, resolver: Arc<dyn tenant::TenantResolver>) {
        self.inner
            .resolvers
            .lock()
            .expect("resolvers lock")
            .push(resolver);
    }

    // ── Point reads ────────────────────────────────────────────────

    /// Fetch one record. Inside a context the read is deduplicated and
    /// cached; with a non-zero delay it coalesces with concurrent reads
    /// into one batched backend call. A missing record is not an error: it
    /// comes back as a sentinel with `exists() == false`.
    pub async fn get(
        &self,
        entity: &str,
        primary_id: &str,
        options: GetOptions,
    ) -> Result<Arc<Instance>, Error> {
        let entity = self.inner.registry.entity(entity)?;
        let context = self.operation_context("get")?;
        let tenant = self.tenant_for("get")?;
        let id = PrimaryId::parse(primary_id)?;

        if let Some(context) = &context
            && !options.bypass_cache
            && let Some(hit) = context.cache().get(&entity.name, primary_id)
        {
            debug!(entity = %entity.name, id = primary_id, "instance cache hit");
            return Ok(hit);
        }

        let Some(context) = context else {
            // eager mode: no ambient context, no batching, no caching
            return self.direct_get(&entity, &tenant, &id).await;
        };

        if options.batch_delay_ms == 0 {
            let instance = self.direct_get(&entity, &tenant, &id).await?;
            if instance.exists() {
                context.cache().insert(instance.clone());
            }
            return Ok(instance);
        }

        let env = FetchEnv {
            db: self.clone(),
            entity,
            tenant,
            cache: Some(context.cache().clone()),
        };
        context
            .scheduler()
            .fetch(env, &id, options.batch_delay_ms)
            .await
    }

    /// Whether a record exists under the active tenant.
    pub async fn exists(&self, entity: &str, primary_id: &str) -> Result<bool, Error> {
        let instance = self.get(entity, primary_id, GetOptions::default()).await?;
        Ok(instance.exists())
    }

    /// Bulk point-read preserving input order. Cache hits are served in
    /// place; the remainder goes out as chunked batched reads. Missing ids
    /// yield sentinels in their slot.
    pub async fn batch_get(
        &self,
        entity: &str,
        primary_ids: &[String],
        options: GetOptions,
    ) -> Result<Vec<Arc<Instance>>, Error> {
        let entity = self.inner.registry.entity(entity)?;
        let context = self.operation_context("batch_get")?;
        let tenant = self.tenant_for("batch_get")?;

        for id in primary_ids {
            PrimaryId::parse(id)?;
        }

        let cache = context.as_ref().map(|ctx| ctx.cache().clone());
        let mut resolved: HashMap<String, Arc<Instance>> = HashMap::new();

        if let Some(cache) = &cache
            && !options.bypass_cache
        {
            for id in primary_ids {
                if let Some(hit) = cache.get(&entity.name, id) {
                    resolved.insert(id.clone(), hit);
                }
            }
        }

        let missing: Vec<String> = primary_ids
            .iter()
            .filter(|id| !resolved.contains_key(*id))
            .cloned()
            .collect();

        let env = FetchEnv {
            db: self.clone(),
            entity,
            tenant,
            cache,
        };
        for chunk in missing.chunks(MAX_BATCH_KEYS) {
            let fetched = self.execute_batch_fetch(&env, chunk).await?;
            resolved.extend(fetched);
        }

        Ok(primary_ids
            .iter()
            .filter_map(|id| resolved.get(id).cloned())
            .collect())
    }

    /// Resolve a uniqueness constraint to its owning record. The
    /// constraint must be declared on the field; a missing record yields a
    /// non-existent sentinel.
    pub async fn find_by_unique(
        &self,
        entity: &str,
        field: &str,
        value: &Value,
    ) -> Result<Arc<Instance>, Error> {
        let entity_def = self.inner.registry.entity(entity)?;
        let tenant = self.tenant_for("find_by_unique")?;

        let Some((_, unique)) = entity_def.unique_on_field(field) else {
            return Err(Error::Query(crate::expr::QueryError::UnknownConstraint {
                entity: entity_def.name.clone(),
                field: field.to_string(),
            }));
        };
        let field_def = entity_def
            .field_def(field)
            .ok_or_else(|| crate::expr::QueryError::UnknownField {
                entity: entity_def.name.clone(),
                field: field.to_string(),
            })
            .map_err(Error::Query)?;

        let codec = KeyCodec::new(&entity_def, &tenant);
        let encoded = field_def.encode_index(value)?;
        let record_key = unique_record_key(&codec, unique.slot, field, &encoded);

        let output = self
            .inner
            .store
            .get_item(GetItemInput {
                table: self.table().to_string(),
                key: record_key,
                return_consumed_capacity: true,
            })
            .await?;

        let Some(record) = output.item else {
            return Ok(Arc::new(Instance::missing(
                entity_def,
                PrimaryId::simple(encoded),
            )));
        };

        let owner = record
            .get(key::ATTR_UC_OWNER)
            .and_then(Scalar::as_str)
            .ok_or(crate::key::DataFormatError::MissingReservedAttr {
                attr: key::ATTR_UC_OWNER,
            })?
            .to_string();

        self.get(entity, &owner, GetOptions::default()).await
    }

    /// Resolve related-ref fields to their target instances through the
    /// batched read path, memoizing each on the instance's relations
    /// cache. An empty field list means every related field.
    pub async fn load_related(
        &self,
        instance: &Arc<Instance>,
        fields: &[String],
    ) -> Result<(), Error> {
        query::load_related_for(self, std::slice::from_ref(instance), fields).await
    }

    // ── Internal plumbing ──────────────────────────────────────────

    pub(crate) fn table(&self) -> &str {
        &self.inner.config.db.table_name
    }

    pub(crate) fn store(&self) -> &Arc<dyn StoreClient> {
        &self.inner.store
    }

    /// Ambient context for an operation, honoring strict mode: `None`
    /// means eager execution is allowed.
    pub(crate) fn operation_context(
        &self,
        operation: &'static str,
    ) -> Result<Option<RequestContext>, Error> {
        match RequestContext::current() {
            Some(context) => Ok(Some(context)),
            None if self.inner.config.batch_context.require_batch_context => {
                Err(Error::Context { operation })
            }
            None => Ok(None),
        }
    }

    pub(crate) fn tenant_for(&self, operation: &'static str) -> Result<String, Error> {
        let resolvers = self.inner.resolvers.lock().expect("resolvers lock").clone();
        tenant::resolve_tenant(&self.inner.config, &resolvers, operation)
    }

    pub(crate) fn hooks_for(&self, entity: &str) -> Vec<Arc<dyn MutationHook>> {
        self.inner
            .hooks
            .lock()
            .expect("hooks lock")
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    async fn direct_get(
        &self,
        entity: &Arc<EntityDef>,
        tenant: &str,
        id: &PrimaryId,
    ) -> Result<Arc<Instance>, Error> {
        let codec = KeyCodec::new(entity, tenant);
        let output = self
            .inner
            .store
            .get_item(GetItemInput {
                table: self.table().to_string(),
                key: main_item_key(&codec, id),
                return_consumed_capacity: true,
            })
            .await?;

        debug!(
            entity = %entity.name,
            id = %id,
            found = output.item.is_some(),
            capacity = output.consumed_capacity.map_or(0.0, |c| c.capacity_units),
            "get_item"
        );

        let instance = match output.item {
            Some(item) => Instance::materialize(entity.clone(), id.clone(), item)?,
            None => Instance::missing(entity.clone(), id.clone()),
        };
        if let Some(capacity) = output.consumed_capacity {
            instance.add_read_capacity(capacity.capacity_units);
        }

        Ok(Arc::new(instance))
    }

    /// One batched backend read for the scheduler and `batch_get`. Every
    /// requested id comes back: hits as materialized instances (written
    /// through the context cache), misses as sentinels.
    pub(crate) async fn execute_batch_fetch(
        &self,
        env: &FetchEnv,
        ids: &[String],
    ) -> Result<HashMap<String, Arc<Instance>>, Error> {
        let codec = KeyCodec::new(&env.entity, &env.tenant);

        let mut keys = Vec::with_capacity(ids.len());
        for id in ids {
            keys.push(main_item_key(&codec, &PrimaryId::parse(id)?));
        }

        let mut responses = Vec::new();
        let mut total_capacity = 0.0;
        let mut rounds = 0;

        while !keys.is_empty() {
            if rounds >= BATCH_REDRIVE_ROUNDS {
                return Err(Error::Store(crate::store::StoreError::Unavailable {
                    message: format!("{} keys still unprocessed after redrives", keys.len()),
                }));
            }
            rounds += 1;

            let output = self
                .inner
                .store
                .batch_get_item(BatchGetItemInput {
                    table: self.table().to_string(),
                    keys: std::mem::take(&mut keys),
                    return_consumed_capacity: true,
                })
                .await?;

            total_capacity += output
                .consumed_capacity
                .map_or(0.0, |c| c.capacity_units);
            responses.extend(output.responses);
            keys = output.unprocessed_keys;
        }

        debug!(
            entity = %env.entity.name,
            requested = ids.len(),
            found = responses.len(),
            capacity = total_capacity,
            "batch_get_item"
        );

        #[allow(clippy::cast_precision_loss)]
        let capacity_share = total_capacity / ids.len().max(1) as f64;

        let mut resolved = HashMap::with_capacity(ids.len());
        for item in responses {
            let pk = item
                .get(key::ATTR_PK)
                .and_then(Scalar::as_str)
                .ok_or(crate::key::DataFormatError::MissingReservedAttr { attr: key::ATTR_PK })?;
            let sk = item
                .get(key::ATTR_SK)
                .and_then(Scalar::as_str)
                .ok_or(crate::key::DataFormatError::MissingReservedAttr { attr: key::ATTR_SK })?;
            let id = codec.parse_primary(pk, sk)?;
            let id_text = id.to_string();

            let instance = Arc::new(Instance::materialize(env.entity.clone(), id, item)?);
            instance.add_read_capacity(capacity_share);

            if let Some(cache) = &env.cache {
                cache.insert(instance.clone());
            }
            resolved.insert(id_text, instance);
        }

        for id in ids {
            if !resolved.contains_key(id) {
                let instance = Arc::new(Instance::missing(
                    env.entity.clone(),
                    PrimaryId::parse(id)?,
                ));
                instance.add_read_capacity(capacity_share);
                resolved.insert(id.clone(), instance);
            }
        }

        Ok(resolved)
    }
}

// ── Transaction cancellation mapping ───────────────────────────────

/// What one transaction participant stands for, used to map cancellation
/// reasons back to the most specific conditional error available.
pub(crate) enum TxnParticipant {
    Unique(String),
    Main,
}

pub(crate) fn map_cancellation(
    operation: &'static str,
    reasons: &[crate::store::CancellationReason],
    participants: &[TxnParticipant],
    main_message: &str,
) -> Error {
    for (reason, participant) in reasons.iter().zip(participants) {
        if reason.is_conditional_check_failed() {
            return match participant {
                TxnParticipant::Unique(field) => Error::unique_violation(operation, field),
                TxnParticipant::Main => Error::conditional(operation, main_message),
            };
        }
    }

    Error::conditional(operation, main_message)
}

// ── Shared key/item assembly ───────────────────────────────────────

/// `{_pk, _sk}` key map of the main item.
pub(crate) fn main_item_key(codec: &KeyCodec<'_>, id: &PrimaryId) -> Item {
    let mut item = Item::new();
    item.insert(key::ATTR_PK.to_string(), Scalar::S(codec.primary_pk(id)));
    item.insert(key::ATTR_SK.to_string(), Scalar::S(codec.primary_sk(id)));
    item
}

/// Full uniqueness-record key map.
pub(crate) fn unique_record_key(
    codec: &KeyCodec<'_>,
    slot: crate::schema::UniqueSlot,
    field: &str,
    encoded_value: &str,
) -> Item {
    let mut item = Item::new();
    item.insert(
        key::ATTR_PK.to_string(),
        Scalar::S(codec.unique_pk(slot, field, encoded_value)),
    );
    item.insert(
        key::ATTR_SK.to_string(),
        Scalar::S(KeyCodec::unique_sk().to_string()),
    );
    item
}

/// Index-encoded string for one key component against a value lookup.
/// `Ok(None)` means the component's field is absent or null (the index row
/// is sparse for this record).
pub(crate) fn index_component(
    entity: &EntityDef,
    component: &KeyField,
    lookup: &dyn Fn(&str) -> Option<Value>,
) -> Result<Option<String>, Error> {
    match component {
        KeyField::ModelPrefix => Ok(Some(entity.prefix.clone())),
        KeyField::Field(field) => {
            let Some(value) = lookup(field) else {
                return Ok(None);
            };
            if value.is_null() {
                return Ok(None);
            }
            let def = entity.field_def(field).ok_or_else(|| {
                Error::Query(crate::expr::QueryError::UnknownField {
                    entity: entity.name.clone(),
                    field: field.clone(),
                })
            })?;
            Ok(Some(def.encode_index(&value)?))
        }
    }
}

/// Primary id derived from a complete value map (create path).
pub(crate) fn primary_id_from_values(
    entity: &EntityDef,
    values: &BTreeMap<String, Value>,
) -> Result<PrimaryId, Error> {
    let lookup = |field: &str| values.get(field).cloned();

    let partition = index_component(entity, &entity.primary_key.partition, &lookup)?
        .ok_or_else(|| missing_key_field(&entity.primary_key.partition))?;

    let sort = match &entity.primary_key.sort {
        None => None,
        Some(component) => Some(
            index_component(entity, component, &lookup)?
                .ok_or_else(|| missing_key_field(component))?,
        ),
    };

    Ok(PrimaryId {
        partition,
        sort,
    })
}

fn missing_key_field(component: &KeyField) -> Error {
    Error::Field(FieldError::Required {
        field: component
            .field_name()
            .unwrap_or(key::MODEL_PREFIX_SENTINEL)
            .to_string(),
    })
}
