use crate::{
    batch::FetchEnv,
    db::Db,
    error::Error,
    expr::{
        ExprBuilder, Filter, KeyConditionSpec, QueryError, SortCondition, compile_filter,
        compile_key_condition,
    },
    field::FieldKind,
    instance::Instance,
    key::{self, DataFormatError, KeyCodec, PrimaryId},
    schema::KeyField,
    store::{Item, QueryInput, Scalar},
    value::Value,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tracing::debug;

/// Default page cap when the caller does not supply one.
pub const DEFAULT_QUERY_LIMIT: u32 = 100;

///
/// Direction
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

///
/// QueryOptions
///

#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub filter: Option<Filter>,
    pub limit: u32,
    pub direction: Direction,
    /// Opaque continuation token from a previous response.
    pub start_key: Option<String>,
    /// Count matching records without materializing them. The limit still
    /// caps the count: pages stop once `limit` rows have been counted.
    pub count_only: bool,
    pub load_related: bool,
    /// Related fields to preload; empty means every related field when
    /// `load_related` is set.
    pub related_fields: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            filter: None,
            limit: DEFAULT_QUERY_LIMIT,
            direction: Direction::Asc,
            start_key: None,
            count_only: false,
            load_related: false,
            related_fields: Vec::new(),
        }
    }
}

///
/// QueryResponse
///

#[derive(Debug)]
pub struct QueryResponse {
    pub items: Vec<Arc<Instance>>,
    pub count: u64,
    pub consumed_capacity: f64,
    pub last_evaluated_key: Option<String>,
}

impl Db {
    /// Query one declared index: partition equality plus an optional
    /// sort-key condition and filter. Pages are consumed only as far as
    /// needed to satisfy the limit.
    pub async fn query(
        &self,
        entity: &str,
        index: &str,
        partition: &Value,
        sort: Option<SortCondition>,
        options: QueryOptions,
    ) -> Result<QueryResponse, Error> {
        let entity_def = self.inner.registry.entity(entity)?;
        let context = self.operation_context("query")?;
        let tenant = self.tenant_for("query")?;
        let codec = KeyCodec::new(&entity_def, &tenant);

        let index_def = entity_def
            .indexes
            .get(index)
            .ok_or_else(|| QueryError::UnknownIndex {
                entity: entity_def.name.clone(),
                index: index.to_string(),
            })?;

        // ── Physical index resolution ──────────────────────────────
        let encoded_partition = match &index_def.partition {
            KeyField::ModelPrefix => entity_def.prefix.clone(),
            KeyField::Field(field) => {
                let def =
                    entity_def
                        .field_def(field)
                        .ok_or_else(|| QueryError::UnknownField {
                            entity: entity_def.name.clone(),
                            field: field.clone(),
                        })?;
                def.encode_index(partition)?
            }
        };

        let is_primary = entity_def.is_primary_alias(index_def);
        let (index_name, pk_attr, sk_attr, pk_value) = if is_primary {
            (
                None,
                key::ATTR_PK,
                key::ATTR_SK,
                codec.primary_pk(&PrimaryId::simple(encoded_partition)),
            )
        } else {
            let slot = index_def.slot;
            (
                Some(slot.backend_index().to_string()),
                slot.partition_attr(),
                slot.sort_attr(),
                codec.gsi_pk(slot, &encoded_partition),
            )
        };

        let (sort_field, sort_field_name) = match &index_def.sort {
            KeyField::Field(field) => (entity_def.field_def(field), field.as_str()),
            KeyField::ModelPrefix => (None, key::MODEL_PREFIX_SENTINEL),
        };

        // ── Expression compilation ─────────────────────────────────
        let mut builder = ExprBuilder::new();
        let key_condition = compile_key_condition(
            &KeyConditionSpec {
                index_name: index,
                pk_attr,
                sk_attr,
                pk_value,
                sort_field,
                sort_field_name,
            },
            sort.as_ref(),
            &mut builder,
        )?;
        let filter = match &options.filter {
            Some(filter) => Some(compile_filter(&entity_def, filter, &mut builder)?),
            None => None,
        };
        let (names, values) = builder.into_parts();

        // ── Page loop ──────────────────────────────────────────────
        let mut exclusive_start_key = options
            .start_key
            .as_deref()
            .map(decode_cursor)
            .transpose()?;
        let mut instances = Vec::new();
        let mut count: u64 = 0;
        let mut consumed_capacity = 0.0;
        let mut last_evaluated_key = None;

        loop {
            let remaining = u64::from(options.limit).saturating_sub(count);
            if remaining == 0 {
                break;
            }

            #[allow(clippy::cast_possible_truncation)]
            let output = self
                .inner
                .store
                .query(QueryInput {
                    table: self.table().to_string(),
                    index_name: index_name.clone(),
                    key_condition: key_condition.clone(),
                    filter: filter.clone(),
                    names: names.clone(),
                    values: values.clone(),
                    limit: Some(remaining.min(u64::from(u32::MAX)) as u32),
                    exclusive_start_key: exclusive_start_key.take(),
                    reverse: options.direction == Direction::Desc,
                    count_only: options.count_only,
                    return_consumed_capacity: true,
                })
                .await?;

            consumed_capacity += output
                .consumed_capacity
                .map_or(0.0, |c| c.capacity_units);
            count += output.count;

            if !options.count_only {
                for item in output.items {
                    instances.push(self.materialize_queried(
                        &entity_def,
                        &codec,
                        context.as_ref().map(|ctx| ctx.cache()),
                        item,
                    )?);
                }
            }

            match output.last_evaluated_key {
                None => {
                    last_evaluated_key = None;
                    break;
                }
                Some(last) => {
                    if count >= u64::from(options.limit) {
                        last_evaluated_key = Some(encode_cursor(&last));
                        break;
                    }
                    exclusive_start_key = Some(last);
                }
            }
        }

        debug!(
            entity = %entity_def.name,
            index,
            count,
            capacity = consumed_capacity,
            "query"
        );

        for instance in &instances {
            instance.add_read_capacity(consumed_capacity / instances.len().max(1) as f64);
        }

        if options.load_related && !options.count_only {
            load_related_for(self, &instances, &options.related_fields).await?;
        }

        Ok(QueryResponse {
            items: instances,
            count,
            consumed_capacity,
            last_evaluated_key,
        })
    }

    /// Decode one queried item, reusing cached identity when the record is
    /// already live in this context.
    fn materialize_queried(
        &self,
        entity_def: &Arc<crate::schema::EntityDef>,
        codec: &KeyCodec<'_>,
        cache: Option<&Arc<crate::cache::InstanceCache>>,
        item: Item,
    ) -> Result<Arc<Instance>, Error> {
        let pk = item
            .get(key::ATTR_PK)
            .and_then(Scalar::as_str)
            .ok_or(DataFormatError::MissingReservedAttr { attr: key::ATTR_PK })?;
        let sk = item
            .get(key::ATTR_SK)
            .and_then(Scalar::as_str)
            .ok_or(DataFormatError::MissingReservedAttr { attr: key::ATTR_SK })?;
        let id = codec.parse_primary(pk, sk)?;

        if let Some(cache) = cache
            && let Some(hit) = cache.get(&entity_def.name, &id.to_string())
        {
            return Ok(hit);
        }

        let instance = Arc::new(Instance::materialize(entity_def.clone(), id, item)?);
        if let Some(cache) = cache {
            cache.insert(instance.clone());
        }

        Ok(instance)
    }
}

/// Preload related-ref targets for a result set: one batched fetch per
/// unique id, resolved instances attached to each record's relations
/// cache.
pub(crate) async fn load_related_for(
    db: &Db,
    instances: &[Arc<Instance>],
    fields: &[String],
) -> Result<(), Error> {
    let Some(first) = instances.first() else {
        return Ok(());
    };
    let entity_def = first.entity().clone();

    let related_fields: Vec<(String, String)> = if fields.is_empty() {
        entity_def
            .fields()
            .filter_map(|f| match &f.kind {
                FieldKind::RelatedRef { target } => Some((f.name.clone(), target.clone())),
                _ => None,
            })
            .collect()
    } else {
        let mut resolved = Vec::with_capacity(fields.len());
        for name in fields {
            let def = entity_def
                .field_def(name)
                .ok_or_else(|| QueryError::UnknownField {
                    entity: entity_def.name.clone(),
                    field: name.clone(),
                })?;
            let FieldKind::RelatedRef { target } = &def.kind else {
                return Err(Error::Query(QueryError::InvalidOperand {
                    field: name.clone(),
                    operator: "$loadRelated",
                    message: "not a related-ref field".to_string(),
                }));
            };
            resolved.push((name.clone(), target.clone()));
        }
        resolved
    };

    let context = crate::context::RequestContext::current();
    let cache = context.as_ref().map(|ctx| ctx.cache().clone());

    for (field, target) in related_fields {
        let target_def = db.inner.registry.entity(&target)?;
        let tenant = db.tenant_for("load_related")?;

        // unique non-null target ids across the result set
        let mut wanted = BTreeSet::new();
        for instance in instances {
            if let Some(Value::Str(id)) = instance.stored(&field) {
                wanted.insert(id);
            }
        }

        let mut resolved: HashMap<String, Arc<Instance>> = HashMap::new();
        if let Some(cache) = &cache {
            wanted.retain(|id| {
                if let Some(hit) = cache.get(&target_def.name, id) {
                    resolved.insert(id.clone(), hit);
                    false
                } else {
                    true
                }
            });
        }

        let env = FetchEnv {
            db: db.clone(),
            entity: target_def,
            tenant,
            cache: cache.clone(),
        };
        let wanted: Vec<String> = wanted.into_iter().collect();
        for chunk in wanted.chunks(crate::MAX_BATCH_KEYS) {
            let fetched = db.execute_batch_fetch(&env, chunk).await?;
            resolved.extend(fetched);
        }

        for instance in instances {
            let target = match instance.stored(&field) {
                Some(Value::Str(id)) => resolved.get(&id).filter(|t| t.exists()).cloned(),
                _ => None,
            };
            if let Some(target) = &target {
                instance.add_related_read_capacity(
                    target.consumed_capacity(crate::instance::CapacityScope::Own).read,
                );
            }
            instance.set_related(&field, target);
        }
    }

    Ok(())
}

pub(crate) fn encode_cursor(key: &Item) -> String {
    serde_json::to_string(key).unwrap_or_default()
}

pub(crate) fn decode_cursor(token: &str) -> Result<Item, Error> {
    serde_json::from_str(token).map_err(|_| {
        Error::DataFormat(DataFormatError::Continuation {
            data: token.to_string(),
        })
    })
}
