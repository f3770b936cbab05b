use crate::{
    db::{
        Db, SaveHookArgs, TxnParticipant, UpdateOptions, main_item_key, map_cancellation,
        unique_record_key,
    },
    error::Error,
    expr::{ExprBuilder, QueryError, compile_filter},
    field::{CounterUpdate, FieldKind, UpdateFragment, UpdateKind},
    instance::Instance,
    key::{self, DataFormatError, KeyCodec, PrimaryId},
    schema::{EntityDef, IndexSlot, KeyField},
    store::{
        Item, ReturnValues, Scalar, StoreError, TransactWriteItem, TransactWriteItemsInput,
        UpdateItemInput,
    },
    types::{Instant, UlidId},
    value::Value,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Post-update disposition of one secondary index's key attributes.
enum IndexWrite {
    Set { pk: String, sk: String },
    Remove,
}

struct UniqueChange<'a> {
    unique: &'a crate::schema::UniqueDef,
    field: String,
    old_encoded: Option<String>,
    new_encoded: Option<String>,
}

impl Db {
    /// Update one record. Computes the effective change set against the
    /// stored item, backfills partial secondary-index keys, and writes
    /// either a single conditional update or — when uniqueness constraints
    /// change — a transaction that moves their records atomically.
    pub async fn update(
        &self,
        entity: &str,
        primary_id: &str,
        changes: BTreeMap<String, Value>,
        options: UpdateOptions,
    ) -> Result<Arc<Instance>, Error> {
        let entity_def = self.inner.registry.entity(entity)?;
        let context = self.operation_context("update")?;
        let tenant = self.tenant_for("update")?;
        let id = PrimaryId::parse(primary_id)?;

        let current = self
            .get(entity, primary_id, crate::db::GetOptions::default())
            .await?;
        if !current.exists() {
            return Err(Error::ItemNotFound {
                primary_id: primary_id.to_string(),
            });
        }

        // ── Effective change set ───────────────────────────────────
        let mut effective: BTreeMap<String, Value> = BTreeMap::new();
        for (name, value) in changes {
            let Some(def) = entity_def.field_def(&name) else {
                return Err(Error::Query(QueryError::UnknownField {
                    entity: entity_def.name.clone(),
                    field: name,
                }));
            };
            if def.kind.is_engine_managed() {
                continue;
            }

            let normalized = def.normalize(value)?;
            let relative_counter =
                matches!(def.kind, FieldKind::Counter) && matches!(normalized, Value::Str(_));
            if relative_counter {
                // deltas always dispatch, even when the magnitude is zero
                effective.insert(name, normalized);
                continue;
            }

            match current.stored(&name) {
                Some(stored) if stored == normalized => {}
                None if normalized.is_null() => {}
                _ => {
                    effective.insert(name, normalized);
                }
            }
        }

        if effective.is_empty() && !options.force_reindex {
            // no-op save: no write dispatches, hooks stay silent
            return Ok(current);
        }

        let hooks = self.hooks_for(&entity_def.name);
        {
            let mut args = SaveHookArgs {
                entity: &entity_def,
                primary_id: Some(primary_id),
                changes: &mut effective,
            };
            for hook in &hooks {
                hook.before_save(&mut args);
            }
        }

        // engine-managed fields are rewritten on every dispatched save
        let now = Instant::now();
        for field in entity_def.fields() {
            match field.kind {
                FieldKind::ModifyInstant => {
                    effective.insert(field.name.clone(), Value::Instant(now));
                }
                FieldKind::VersionUlid => {
                    effective.insert(field.name.clone(), Value::Ulid(UlidId::generate()));
                }
                _ => {}
            }
        }

        // ── Secondary-index rewrites (with backfill) ───────────────
        let codec = KeyCodec::new(&entity_def, &tenant);
        let index_writes = plan_index_writes(
            &entity_def,
            &codec,
            &current,
            &effective,
            primary_id,
            options.force_reindex,
        )?;

        // ── Uniqueness transitions ─────────────────────────────────
        let mut unique_changes = Vec::new();
        for unique in entity_def.unique.values() {
            if !effective.contains_key(&unique.field) {
                continue;
            }
            let def = entity_def.field_def(&unique.field).ok_or_else(|| {
                Error::Query(QueryError::UnknownField {
                    entity: entity_def.name.clone(),
                    field: unique.field.clone(),
                })
            })?;

            let resolved = resolve_post_update(&entity_def, &current, &effective, &unique.field)?;
            let new_encoded = match &resolved {
                Some(value) => Some(def.encode_index(value)?),
                None => None,
            };
            let old_encoded = match current.stored(&unique.field) {
                Some(old) if !old.is_null() => Some(def.encode_index(&old)?),
                _ => None,
            };

            if old_encoded == new_encoded {
                continue;
            }
            unique_changes.push(UniqueChange {
                unique,
                field: unique.field.clone(),
                old_encoded,
                new_encoded,
            });
        }

        // ── Expression assembly ────────────────────────────────────
        let mut builder = ExprBuilder::new();
        let mut fragments = Vec::new();

        for (name, value) in &effective {
            if let Some(def) = entity_def.field_def(name)
                && let Some(fragment) = def.update_fragment(name, value, &mut builder)?
            {
                fragments.push(fragment);
            }
        }

        for (slot, write) in &index_writes {
            match write {
                IndexWrite::Set { pk, sk } => {
                    let pk_name = builder.bind_name(slot.partition_attr());
                    let pk_value = builder.bind_value(Scalar::S(pk.clone()));
                    fragments.push(UpdateFragment {
                        kind: UpdateKind::Set,
                        fragment: format!("{pk_name} = {pk_value}"),
                    });
                    let sk_name = builder.bind_name(slot.sort_attr());
                    let sk_value = builder.bind_value(Scalar::S(sk.clone()));
                    fragments.push(UpdateFragment {
                        kind: UpdateKind::Set,
                        fragment: format!("{sk_name} = {sk_value}"),
                    });
                }
                IndexWrite::Remove => {
                    for attr in [slot.partition_attr(), slot.sort_attr()] {
                        let name = builder.bind_name(attr);
                        fragments.push(UpdateFragment {
                            kind: UpdateKind::Remove,
                            fragment: name,
                        });
                    }
                }
            }
        }

        let update_expression = UpdateFragment::assemble(&fragments);

        let pk_name = builder.bind_name(key::ATTR_PK);
        let mut condition = format!("attribute_exists({pk_name})");
        let has_user_condition = options.condition.is_some();
        if let Some(filter) = &options.condition {
            let compiled = compile_filter(&entity_def, filter, &mut builder)?;
            condition = format!("{condition} AND ({compiled})");
        }
        let (names, bound) = builder.into_parts();

        // ── Dispatch ───────────────────────────────────────────────
        let (new_item, consumed) = if unique_changes.is_empty() {
            let result = self
                .inner
                .store
                .update_item(UpdateItemInput {
                    table: self.table().to_string(),
                    key: main_item_key(&codec, &id),
                    update: update_expression,
                    condition: Some(condition),
                    names,
                    values: bound,
                    return_values: ReturnValues::AllNew,
                    return_consumed_capacity: true,
                })
                .await;

            match result {
                Ok(output) => {
                    let item = output.attributes.ok_or(DataFormatError::MissingReservedAttr {
                        attr: key::ATTR_PK,
                    })?;
                    (
                        item,
                        output.consumed_capacity.map_or(0.0, |c| c.capacity_units),
                    )
                }
                Err(StoreError::ConditionalCheckFailed { .. }) => {
                    return Err(if has_user_condition {
                        Error::conditional("update", "update condition failed")
                    } else {
                        Error::ItemNotFound {
                            primary_id: primary_id.to_string(),
                        }
                    });
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            let owner_id = id.to_string();
            let mut txn_items = Vec::new();
            let mut participants = Vec::new();

            for change in &unique_changes {
                if let Some(old) = &change.old_encoded {
                    let mut txn_builder = ExprBuilder::new();
                    let owner = txn_builder.bind_name(key::ATTR_UC_OWNER);
                    let owner_value = txn_builder.bind_value(Scalar::S(owner_id.clone()));
                    let (txn_names, txn_values) = txn_builder.into_parts();

                    txn_items.push(TransactWriteItem::Delete {
                        key: unique_record_key(&codec, change.unique.slot, &change.field, old),
                        condition: Some(format!("{owner} = {owner_value}")),
                        names: txn_names,
                        values: txn_values,
                    });
                    participants.push(TxnParticipant::Unique(change.field.clone()));
                }

                if let Some(new) = &change.new_encoded {
                    let mut record =
                        unique_record_key(&codec, change.unique.slot, &change.field, new);
                    record.insert(key::ATTR_UC_OWNER.to_string(), Scalar::S(owner_id.clone()));
                    record.insert(
                        key::ATTR_UC_ENTITY.to_string(),
                        Scalar::S(entity_def.name.clone()),
                    );
                    if self.inner.config.tenancy.enabled {
                        record.insert(key::ATTR_TENANT.to_string(), Scalar::S(tenant.clone()));
                    }

                    let mut txn_builder = ExprBuilder::new();
                    let pk = txn_builder.bind_name(key::ATTR_PK);
                    let owner = txn_builder.bind_name(key::ATTR_UC_OWNER);
                    let owner_value = txn_builder.bind_value(Scalar::S(owner_id.clone()));
                    let (txn_names, txn_values) = txn_builder.into_parts();

                    txn_items.push(TransactWriteItem::Put {
                        item: record,
                        condition: Some(format!(
                            "attribute_not_exists({pk}) OR {owner} = {owner_value}"
                        )),
                        names: txn_names,
                        values: txn_values,
                    });
                    participants.push(TxnParticipant::Unique(change.field.clone()));
                }
            }

            txn_items.push(TransactWriteItem::Update {
                key: main_item_key(&codec, &id),
                update: update_expression,
                condition: Some(condition),
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

            let consumed = match result {
                Ok(output) => output.consumed_capacity.map_or(0.0, |c| c.capacity_units),
                Err(StoreError::TransactionCanceled { reasons }) => {
                    return Err(map_cancellation(
                        "update",
                        &reasons,
                        &participants,
                        "update condition failed",
                    ));
                }
                Err(err) => return Err(err.into()),
            };

            // transactions return no attributes: rebuild the post-update
            // item from the stored image and the applied change set
            let item = apply_changes_to_item(
                &entity_def,
                &current,
                &effective,
                &index_writes,
            )?;
            (item, consumed)
        };

        debug!(
            entity = %entity_def.name,
            id = %id,
            changed = effective.len(),
            reindexed = index_writes.len(),
            unique_transitions = unique_changes.len(),
            capacity = consumed,
            "update"
        );

        let instance = Arc::new(Instance::materialize(entity_def, id, new_item)?);
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

/// Post-update value of a field: the staged change when present (counter
/// deltas resolved against the stored value), else the stored value.
/// `None` means the attribute ends up absent.
fn resolve_post_update(
    entity: &EntityDef,
    current: &Instance,
    effective: &BTreeMap<String, Value>,
    field: &str,
) -> Result<Option<Value>, Error> {
    let def = entity
        .field_def(field)
        .ok_or_else(|| {
            Error::Query(QueryError::UnknownField {
                entity: entity.name.clone(),
                field: field.to_string(),
            })
        })?;

    if let Some(staged) = effective.get(field) {
        if staged.is_null() {
            return Ok(None);
        }
        if matches!(def.kind, FieldKind::Counter)
            && let Value::Str(_) = staged
        {
            let base = current
                .stored(field)
                .and_then(|v| v.as_int())
                .unwrap_or(0);
            let update = CounterUpdate::parse(field, staged)?;
            return Ok(Some(Value::Int(update.resolve_from(base))));
        }
        return Ok(Some(staged.clone()));
    }

    Ok(current.stored(field).filter(|v| !v.is_null()))
}

/// Plan every secondary-index key rewrite for this update. An index is
/// touched when one of its key fields is in the change set (or always,
/// under `force_reindex`); the untouched component backfills from the
/// stored item, and a stored item with no value to backfill from is a
/// `DataFormatError`.
fn plan_index_writes(
    entity: &EntityDef,
    codec: &KeyCodec<'_>,
    current: &Instance,
    effective: &BTreeMap<String, Value>,
    primary_id: &str,
    force_reindex: bool,
) -> Result<Vec<(IndexSlot, IndexWrite)>, Error> {
    let mut writes = Vec::new();

    for (index_name, index) in &entity.indexes {
        if entity.is_primary_alias(index) {
            continue;
        }

        let component_field: fn(&KeyField) -> Option<&str> = KeyField::field_name;
        let touched = force_reindex
            || [&index.partition, &index.sort]
                .into_iter()
                .filter_map(component_field)
                .any(|field| effective.contains_key(field));
        if !touched {
            continue;
        }

        // a component explicitly cleared drops the whole index row and
        // waives the backfill requirement on the other component
        let cleared = [&index.partition, &index.sort]
            .into_iter()
            .filter_map(component_field)
            .any(|field| {
                effective
                    .get(field)
                    .is_some_and(|staged| staged.is_null())
            });
        if cleared {
            writes.push((index.slot, IndexWrite::Remove));
            continue;
        }

        let resolve_component = |component: &KeyField| -> Result<Option<String>, Error> {
            let Some(field) = component.field_name() else {
                return Ok(Some(entity.prefix.clone()));
            };
            let def = entity.field_def(field).ok_or_else(|| {
                Error::Query(QueryError::UnknownField {
                    entity: entity.name.clone(),
                    field: field.to_string(),
                })
            })?;

            if effective.contains_key(field) {
                match resolve_post_update(entity, current, effective, field)? {
                    Some(value) => Ok(Some(def.encode_index(&value)?)),
                    None => Ok(None),
                }
            } else {
                match current.stored(field) {
                    Some(value) if !value.is_null() => Ok(Some(def.encode_index(&value)?)),
                    _ => Err(Error::DataFormat(DataFormatError::MissingBackfill {
                        primary_id: primary_id.to_string(),
                        field: field.to_string(),
                        index: index_name.clone(),
                    })),
                }
            }
        };

        match (
            resolve_component(&index.partition)?,
            resolve_component(&index.sort)?,
        ) {
            (Some(pk), Some(sk)) => {
                writes.push((
                    index.slot,
                    IndexWrite::Set {
                        pk: codec.gsi_pk(index.slot, &pk),
                        sk,
                    },
                ));
            }
            _ => writes.push((index.slot, IndexWrite::Remove)),
        }
    }

    Ok(writes)
}

/// Rebuild the stored item image after a transactional update (which
/// returns no attributes).
fn apply_changes_to_item(
    entity: &EntityDef,
    current: &Instance,
    effective: &BTreeMap<String, Value>,
    index_writes: &[(IndexSlot, IndexWrite)],
) -> Result<Item, Error> {
    let mut item = current.raw().clone();

    for name in effective.keys() {
        let def = entity.field_def(name).ok_or_else(|| {
            Error::Query(QueryError::UnknownField {
                entity: entity.name.clone(),
                field: name.clone(),
            })
        })?;
        match resolve_post_update(entity, current, effective, name)? {
            Some(value) => {
                if let Some(scalar) = def.encode_storage(&value)? {
                    item.insert(name.clone(), scalar);
                } else {
                    item.remove(name);
                }
            }
            None => {
                item.remove(name);
            }
        }
    }

    for (slot, write) in index_writes {
        match write {
            IndexWrite::Set { pk, sk } => {
                item.insert(slot.partition_attr().to_string(), Scalar::S(pk.clone()));
                item.insert(slot.sort_attr().to_string(), Scalar::S(sk.clone()));
            }
            IndexWrite::Remove => {
                item.remove(slot.partition_attr());
                item.remove(slot.sort_attr());
            }
        }
    }

    Ok(item)
}
