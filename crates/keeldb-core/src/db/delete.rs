use crate::{
    db::{
        Db, DeleteOptions, GetOptions, TxnParticipant, main_item_key, map_cancellation,
        unique_record_key,
    },
    error::Error,
    expr::{ExprBuilder, QueryError, compile_filter},
    instance::Instance,
    key::{self, KeyCodec, PrimaryId},
    schema::EntityDef,
    store::{
        DeleteItemInput, ReturnValues, Scalar, StoreError, TransactWriteItem,
        TransactWriteItemsInput,
    },
};
use std::sync::Arc;
use tracing::debug;

impl Db {
    /// Delete one record. A single conditional delete unless this owner
    /// actually holds outstanding uniqueness records; those force a
    /// transaction that releases every record alongside the item. A
    /// declared constraint whose stored value is null leaves no record
    /// behind and keeps the single-delete path. Deleting a record that
    /// does not exist is not an error: the returned sentinel has
    /// `exists() == false`.
    pub async fn delete(
        &self,
        entity: &str,
        primary_id: &str,
        options: DeleteOptions,
    ) -> Result<Arc<Instance>, Error> {
        let entity_def = self.inner.registry.entity(entity)?;
        let context = self.operation_context("delete")?;
        let tenant = self.tenant_for("delete")?;
        let id = PrimaryId::parse(primary_id)?;
        let codec = KeyCodec::new(&entity_def, &tenant);

        let hooks = self.hooks_for(&entity_def.name);
        for hook in &hooks {
            hook.before_delete(primary_id, &options);
        }

        let deleted = if entity_def.unique.is_empty() {
            // nothing declared: no read round-trip needed
            self.delete_single(entity, &entity_def, &codec, &id, primary_id, &options)
                .await?
        } else {
            // the stored item decides whether any uniqueness record is
            // outstanding for this owner
            let current = self
                .get(
                    entity,
                    primary_id,
                    GetOptions {
                        bypass_cache: true,
                        ..GetOptions::default()
                    },
                )
                .await?;
            if !current.exists() {
                if let Some(context) = &context {
                    context.cache().invalidate(&entity_def.name, primary_id);
                }
                return Ok(current);
            }

            let mut outstanding = Vec::new();
            for unique in entity_def.unique.values() {
                let Some(value) = current.stored(&unique.field) else {
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
                outstanding.push((unique, def.encode_index(&value)?));
            }

            if outstanding.is_empty() {
                self.delete_single(entity, &entity_def, &codec, &id, primary_id, &options)
                    .await?
            } else {
                let owner_id = id.to_string();
                let mut txn_items = Vec::with_capacity(outstanding.len() + 1);
                let mut participants = Vec::with_capacity(outstanding.len() + 1);

                for (unique, encoded) in &outstanding {
                    let mut builder = ExprBuilder::new();
                    let owner = builder.bind_name(key::ATTR_UC_OWNER);
                    let owner_value = builder.bind_value(Scalar::S(owner_id.clone()));
                    let (names, values) = builder.into_parts();

                    txn_items.push(TransactWriteItem::Delete {
                        key: unique_record_key(&codec, unique.slot, &unique.field, encoded),
                        condition: Some(format!("{owner} = {owner_value}")),
                        names,
                        values,
                    });
                    participants.push(TxnParticipant::Unique(unique.field.clone()));
                }

                let mut builder = ExprBuilder::new();
                let pk = builder.bind_name(key::ATTR_PK);
                let mut condition = format!("attribute_exists({pk})");
                if let Some(filter) = &options.condition {
                    let compiled = compile_filter(&entity_def, filter, &mut builder)?;
                    condition = format!("{condition} AND ({compiled})");
                }
                let (names, values) = builder.into_parts();

                txn_items.push(TransactWriteItem::Delete {
                    key: main_item_key(&codec, &id),
                    condition: Some(condition),
                    names,
                    values,
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
                    Ok(output) => {
                        current.add_write_capacity(
                            output.consumed_capacity.map_or(0.0, |c| c.capacity_units),
                        );
                        current
                    }
                    Err(StoreError::TransactionCanceled { reasons }) => {
                        return Err(map_cancellation(
                            "delete",
                            &reasons,
                            &participants,
                            "delete condition failed",
                        ));
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        debug!(
            entity = %entity_def.name,
            id = %id,
            existed = deleted.exists(),
            "delete"
        );

        if let Some(context) = &context {
            context.cache().invalidate(&entity_def.name, primary_id);
        }
        if deleted.exists() {
            for hook in &hooks {
                hook.after_delete(primary_id, &options);
            }
        }

        Ok(deleted)
    }

    /// Single conditional delete. A conditional failure with no caller
    /// condition can only mean the item is absent; with one, a re-read
    /// distinguishes "absent" from "condition failed".
    async fn delete_single(
        &self,
        entity: &str,
        entity_def: &Arc<EntityDef>,
        codec: &KeyCodec<'_>,
        id: &PrimaryId,
        primary_id: &str,
        options: &DeleteOptions,
    ) -> Result<Arc<Instance>, Error> {
        let mut builder = ExprBuilder::new();
        let pk = builder.bind_name(key::ATTR_PK);
        let mut condition = format!("attribute_exists({pk})");
        if let Some(filter) = &options.condition {
            let compiled = compile_filter(entity_def, filter, &mut builder)?;
            condition = format!("{condition} AND ({compiled})");
        }
        let (names, values) = builder.into_parts();

        let result = self
            .inner
            .store
            .delete_item(DeleteItemInput {
                table: self.table().to_string(),
                key: main_item_key(codec, id),
                condition: Some(condition),
                names,
                values,
                return_values: ReturnValues::AllOld,
                return_consumed_capacity: true,
            })
            .await;

        match result {
            Ok(output) => {
                let instance = match output.attributes {
                    Some(item) => Instance::materialize(entity_def.clone(), id.clone(), item)?,
                    None => Instance::missing(entity_def.clone(), id.clone()),
                };
                instance.add_write_capacity(
                    output.consumed_capacity.map_or(0.0, |c| c.capacity_units),
                );
                Ok(Arc::new(instance))
            }
            Err(StoreError::ConditionalCheckFailed { .. }) => {
                if options.condition.is_none() {
                    return Ok(Arc::new(Instance::missing(entity_def.clone(), id.clone())));
                }
                let current = self
                    .get(
                        entity,
                        primary_id,
                        GetOptions {
                            bypass_cache: true,
                            ..GetOptions::default()
                        },
                    )
                    .await?;
                if current.exists() {
                    return Err(Error::conditional("delete", "delete condition failed"));
                }
                Ok(Arc::new(Instance::missing(entity_def.clone(), id.clone())))
            }
            Err(err) => Err(err.into()),
        }
    }
}
