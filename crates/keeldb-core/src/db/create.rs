use crate::{
    db::{
        Db, SaveHookArgs, TxnParticipant, index_component, main_item_key, map_cancellation,
        primary_id_from_values, unique_record_key,
    },
    error::Error,
    expr::{ExprBuilder, QueryError},
    field::{CounterUpdate, FieldError, FieldKind},
    instance::Instance,
    key::{self, KeyCodec},
    store::{PutItemInput, Scalar, StoreError, TransactWriteItem, TransactWriteItemsInput},
    types::{Instant, UlidId},
    value::Value,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

impl Db {
    /// Create one record. Applies defaults and engine-managed field
    /// assignments, validates required fields, and writes either a single
    /// conditional put or — when uniqueness constraints participate — a
    /// transaction that claims every uniqueness record alongside the item.
    pub async fn create(
        &self,
        entity: &str,
        fields: BTreeMap<String, Value>,
    ) -> Result<Arc<Instance>, Error> {
        let entity_def = self.inner.registry.entity(entity)?;
        let context = self.operation_context("create")?;
        let tenant = self.tenant_for("create")?;

        for name in fields.keys() {
            if entity_def.field_def(name).is_none() {
                return Err(Error::Query(QueryError::UnknownField {
                    entity: entity_def.name.clone(),
                    field: name.clone(),
                }));
            }
        }

        // ── Defaults and engine-managed assignments ────────────────
        let now = Instant::now();
        let mut values: BTreeMap<String, Value> = BTreeMap::new();

        for field in entity_def.fields() {
            let assigned = match &field.kind {
                FieldKind::VersionUlid => Some(Value::Ulid(UlidId::generate())),
                FieldKind::CreateInstant | FieldKind::ModifyInstant => Some(Value::Instant(now)),
                _ => match fields.get(&field.name) {
                    Some(value) if !value.is_null() => Some(field.normalize(value.clone())?),
                    _ => match (&field.default, &field.kind) {
                        (Some(default), _) => Some(field.normalize(default.produce())?),
                        (None, FieldKind::Ulid { auto_assign: true }) => {
                            Some(Value::Ulid(UlidId::generate()))
                        }
                        _ => None,
                    },
                },
            };

            if let Some(value) = assigned {
                // a relative counter on create counts up from zero
                let value = match (&field.kind, &value) {
                    (FieldKind::Counter, Value::Str(_)) => {
                        Value::Int(CounterUpdate::parse(&field.name, &value)?.resolve_from(0))
                    }
                    _ => value,
                };
                values.insert(field.name.clone(), value);
            }
        }

        let hooks = self.hooks_for(&entity_def.name);
        {
            let mut args = SaveHookArgs {
                entity: &entity_def,
                primary_id: None,
                changes: &mut values,
            };
            for hook in &hooks {
                hook.before_save(&mut args);
            }
        }

        // ── Required fields ────────────────────────────────────────
        for field in entity_def.fields() {
            if field.required && values.get(&field.name).is_none_or(Value::is_null) {
                return Err(Error::Field(FieldError::Required {
                    field: field.name.clone(),
                }));
            }
        }

        // ── Physical item ──────────────────────────────────────────
        let id = primary_id_from_values(&entity_def, &values)?;
        let codec = KeyCodec::new(&entity_def, &tenant);
        let mut item = main_item_key(&codec, &id);

        for (name, value) in &values {
            if let Some(def) = entity_def.field_def(name)
                && let Some(scalar) = def.encode_storage(value)?
            {
                item.insert(name.clone(), scalar);
            }
        }

        let lookup = |field: &str| values.get(field).cloned();
        for index in entity_def.indexes.values() {
            if entity_def.is_primary_alias(index) {
                continue;
            }
            let partition = index_component(&entity_def, &index.partition, &lookup)?;
            let sort = index_component(&entity_def, &index.sort, &lookup)?;
            // sparse: the index row only exists when both components do
            if let (Some(partition), Some(sort)) = (partition, sort) {
                item.insert(
                    index.slot.partition_attr().to_string(),
                    Scalar::S(codec.gsi_pk(index.slot, &partition)),
                );
                item.insert(index.slot.sort_attr().to_string(), Scalar::S(sort));
            }
        }

        if entity_def.iteration.iterable {
            item.insert(
                key::ATTR_ITER_PK.to_string(),
                Scalar::S(codec.iter_pk(codec.bucket_for(&id))),
            );
            item.insert(key::ATTR_ITER_SK.to_string(), Scalar::S(id.to_string()));
        }

        if self.inner.config.tenancy.enabled {
            item.insert(key::ATTR_TENANT.to_string(), Scalar::S(tenant.clone()));
        }

        // ── Participating uniqueness constraints ───────────────────
        let mut participating = Vec::new();
        for unique in entity_def.unique.values() {
            let Some(value) = values.get(&unique.field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let def = entity_def.field_def(&unique.field).ok_or_else(|| {
                Error::Query(QueryError::UnknownField {
                    entity: entity_def.name.clone(),
                    field: unique.field.clone(),
                })
            })?;
            participating.push((unique, def.encode_index(value)?));
        }

        // ── Write ──────────────────────────────────────────────────
        let consumed = if participating.is_empty() {
            let mut builder = ExprBuilder::new();
            let pk = builder.bind_name(key::ATTR_PK);
            let (names, bound) = builder.into_parts();

            let result = self
                .inner
                .store
                .put_item(PutItemInput {
                    table: self.table().to_string(),
                    item: item.clone(),
                    condition: Some(format!("attribute_not_exists({pk})")),
                    names,
                    values: bound,
                    return_consumed_capacity: true,
                })
                .await;

            match result {
                Ok(output) => output
                    .consumed_capacity
                    .map_or(0.0, |c| c.capacity_units),
                Err(StoreError::ConditionalCheckFailed { .. }) => {
                    return Err(Error::conditional("create", "item already exists"));
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            let owner_id = id.to_string();
            let mut txn_items = Vec::with_capacity(participating.len() + 1);
            let mut participants = Vec::with_capacity(participating.len() + 1);

            for (unique, encoded) in &participating {
                let mut record = unique_record_key(&codec, unique.slot, &unique.field, encoded);
                record.insert(
                    key::ATTR_UC_OWNER.to_string(),
                    Scalar::S(owner_id.clone()),
                );
                record.insert(
                    key::ATTR_UC_ENTITY.to_string(),
                    Scalar::S(entity_def.name.clone()),
                );
                if self.inner.config.tenancy.enabled {
                    record.insert(key::ATTR_TENANT.to_string(), Scalar::S(tenant.clone()));
                }

                // free, or an idempotent re-create by the same owner
                let mut builder = ExprBuilder::new();
                let pk = builder.bind_name(key::ATTR_PK);
                let owner = builder.bind_name(key::ATTR_UC_OWNER);
                let owner_value = builder.bind_value(Scalar::S(owner_id.clone()));
                let (names, bound) = builder.into_parts();

                txn_items.push(TransactWriteItem::Put {
                    item: record,
                    condition: Some(format!(
                        "attribute_not_exists({pk}) OR {owner} = {owner_value}"
                    )),
                    names,
                    values: bound,
                });
                participants.push(TxnParticipant::Unique(unique.field.clone()));
            }

            let mut builder = ExprBuilder::new();
            let pk = builder.bind_name(key::ATTR_PK);
            let (names, bound) = builder.into_parts();
            txn_items.push(TransactWriteItem::Put {
                item: item.clone(),
                condition: Some(format!("attribute_not_exists({pk})")),
                names,
                values: bound,
            });
            participants.push(TxnParticipant::Main);

            let result = self
                .inner
                .store
                .transact_write_items(TransactWriteItemsInput {
                    table: self.table().to_string(),
                    items: txn_items,
                    return_consumed_capacity: true,
                })
                .await;

            match result {
                Ok(output) => output
                    .consumed_capacity
                    .map_or(0.0, |c| c.capacity_units),
                Err(StoreError::TransactionCanceled { reasons }) => {
                    return Err(map_cancellation(
                        "create",
                        &reasons,
                        &participants,
                        "item already exists",
                    ));
                }
                Err(err) => return Err(err.into()),
            }
        };

        debug!(
            entity = %entity_def.name,
            id = %id,
            unique_records = participating.len(),
            capacity = consumed,
            "create"
        );

        let instance = Arc::new(Instance::materialize(entity_def, id, item)?);
        instance.add_write_capacity(consumed);

        if let Some(context) = &context {
            context.cache().insert(instance.clone());
        }
        for hook in &hooks {
            hook.after_save(&instance);
        }

        Ok(instance)
    }
}
