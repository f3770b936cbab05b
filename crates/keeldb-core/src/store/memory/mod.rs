mod eval;

use crate::store::{
    BatchGetItemInput, BatchGetItemOutput, CancellationReason, ConsumedCapacity, DeleteItemInput,
    DeleteItemOutput, GetItemInput, GetItemOutput, Item, PutItemInput, PutItemOutput, QueryInput,
    QueryOutput, ReturnValues, Scalar, StoreClient, StoreError, TableDescription,
    TransactWriteItem, TransactWriteItemsInput, TransactWriteItemsOutput, UpdateItemInput,
    UpdateItemOutput,
};
use async_trait::async_trait;
use eval::{EvalContext, apply_update, eval_condition};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

const READ_UNIT: f64 = 0.5;
const WRITE_UNIT: f64 = 1.0;
/// Transactional writes cost double per participant.
const TXN_WRITE_UNIT: f64 = 2.0;

///
/// MemoryStore
///
/// In-memory implementation of the wire contract, faithful enough to back
/// the whole test suite: conditional expressions are interpreted against
/// the same grammar the compiler emits, transactions report positional
/// cancellation reasons, and capacity accounting mirrors the backend's
/// read/write unit model.
///

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    ops: Mutex<BTreeMap<&'static str, usize>>,
}

#[derive(Debug, Default)]
struct Table {
    items: BTreeMap<(String, String), Item>,
}

fn item_key(key: &Item) -> Result<(String, String), StoreError> {
    let get = |attr: &str| -> Result<String, StoreError> {
        key.get(attr)
            .and_then(Scalar::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| StoreError::MalformedExpression {
                message: format!("key map lacks string attribute {attr}"),
            })
    };
    Ok((get("_pk")?, get("_sk")?))
}

/// Physical sort attribute backing an index name.
fn sort_attr_for(index_name: Option<&str>) -> Result<&'static str, StoreError> {
    match index_name {
        None => Ok("_sk"),
        Some("gsi1") => Ok("_gsi1_sk"),
        Some("gsi2") => Ok("_gsi2_sk"),
        Some("gsi3") => Ok("_gsi3_sk"),
        Some("iter") => Ok("_iter_sk"),
        Some(other) => Err(StoreError::MalformedExpression {
            message: format!("unknown index {other}"),
        }),
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times one wire operation ran. Tests use this to assert
    /// coalescing and dedup behavior.
    #[must_use]
    pub fn op_count(&self, op: &str) -> usize {
        self.ops
            .lock()
            .expect("store lock")
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    /// Total stored items in a table, uniqueness records included.
    #[must_use]
    pub fn item_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .expect("store lock")
            .get(table)
            .map_or(0, |t| t.items.len())
    }

    /// Raw stored item, for white-box assertions on physical attributes.
    #[must_use]
    pub fn raw_item(&self, table: &str, pk: &str, sk: &str) -> Option<Item> {
        self.tables
            .lock()
            .expect("store lock")
            .get(table)
            .and_then(|t| t.items.get(&(pk.to_string(), sk.to_string())).cloned())
    }

    fn record(&self, op: &'static str) {
        *self.ops.lock().expect("store lock").entry(op).or_insert(0) += 1;
    }

    fn with_table<R>(&self, table: &str, f: impl FnOnce(&mut Table) -> R) -> R {
        let mut tables = self.tables.lock().expect("store lock");
        f(tables.entry(table.to_string()).or_default())
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get_item(&self, input: GetItemInput) -> Result<GetItemOutput, StoreError> {
        self.record("get_item");
        let key = item_key(&input.key)?;

        let item = self.with_table(&input.table, |table| table.items.get(&key).cloned());

        Ok(GetItemOutput {
            item,
            consumed_capacity: input
                .return_consumed_capacity
                .then(|| ConsumedCapacity::new(READ_UNIT)),
        })
    }

    async fn put_item(&self, input: PutItemInput) -> Result<PutItemOutput, StoreError> {
        self.record("put_item");
        let key = item_key(&input.item)?;
        let ctx = EvalContext {
            names: &input.names,
            values: &input.values,
        };

        self.with_table(&input.table, |table| {
            if let Some(condition) = &input.condition {
                let current = table.items.get(&key);
                if !eval_condition(condition, current, &ctx)? {
                    return Err(StoreError::ConditionalCheckFailed { message: None });
                }
            }
            table.items.insert(key, input.item.clone());
            Ok(())
        })?;

        Ok(PutItemOutput {
            consumed_capacity: input
                .return_consumed_capacity
                .then(|| ConsumedCapacity::new(WRITE_UNIT)),
        })
    }

    #[allow(clippy::too_many_lines)]
    async fn query(&self, input: QueryInput) -> Result<QueryOutput, StoreError> {
        self.record("query");
        let ctx = EvalContext {
            names: &input.names,
            values: &input.values,
        };
        let sort_attr = sort_attr_for(input.index_name.as_deref())?;

        // key-matched candidates in sort order
        let mut candidates: Vec<Item> = self.with_table(&input.table, |table| {
            let mut matched = Vec::new();
            for item in table.items.values() {
                if eval_condition(&input.key_condition, Some(item), &ctx)? {
                    matched.push(item.clone());
                }
            }
            Ok::<_, StoreError>(matched)
        })?;

        candidates.sort_by(|a, b| {
            let by_sort = match (a.get(sort_attr), b.get(sort_attr)) {
                (Some(left), Some(right)) => left.wire_cmp(right),
                _ => Ordering::Equal,
            };
            by_sort.then_with(|| {
                let key = |item: &Item| {
                    (
                        item.get("_pk").and_then(Scalar::as_str).map(String::from),
                        item.get("_sk").and_then(Scalar::as_str).map(String::from),
                    )
                };
                key(a).cmp(&key(b))
            })
        });
        if input.reverse {
            candidates.reverse();
        }

        // resume after the exclusive start key, by key identity
        let mut start = 0;
        if let Some(start_key) = &input.exclusive_start_key {
            let start_id = item_key(start_key)?;
            if let Some(pos) = candidates
                .iter()
                .position(|item| item_key(item).is_ok_and(|id| id == start_id))
            {
                start = pos + 1;
            }
        }

        let limit = input.limit.map_or(candidates.len(), |l| l as usize);
        let scanned: Vec<Item> = candidates.iter().skip(start).take(limit).cloned().collect();
        let scanned_count = scanned.len() as u64;
        let more_remain = start + scanned.len() < candidates.len();

        let last_evaluated_key = if more_remain {
            scanned.last().map(|item| {
                let mut key = Item::new();
                for attr in ["_pk", "_sk"] {
                    if let Some(value) = item.get(attr) {
                        key.insert(attr.to_string(), value.clone());
                    }
                }
                key
            })
        } else {
            None
        };

        // the backend applies filters after the scan window
        let mut filtered = Vec::with_capacity(scanned.len());
        for item in scanned {
            let keep = match &input.filter {
                Some(filter) => eval_condition(filter, Some(&item), &ctx)?,
                None => true,
            };
            if keep {
                filtered.push(item);
            }
        }

        let count = filtered.len() as u64;
        #[allow(clippy::cast_precision_loss)]
        let capacity = READ_UNIT * scanned_count.max(1) as f64;

        Ok(QueryOutput {
            items: if input.count_only { Vec::new() } else { filtered },
            count,
            scanned_count,
            last_evaluated_key,
            consumed_capacity: input
                .return_consumed_capacity
                .then(|| ConsumedCapacity::new(capacity)),
        })
    }

    async fn update_item(&self, input: UpdateItemInput) -> Result<UpdateItemOutput, StoreError> {
        self.record("update_item");
        let key = item_key(&input.key)?;
        let ctx = EvalContext {
            names: &input.names,
            values: &input.values,
        };

        let attributes = self.with_table(&input.table, |table| {
            let current = table.items.get(&key);
            if let Some(condition) = &input.condition
                && !eval_condition(condition, current, &ctx)?
            {
                return Err(StoreError::ConditionalCheckFailed { message: None });
            }

            let old = current.cloned();
            let mut item = old.clone().unwrap_or_else(|| input.key.clone());
            apply_update(&input.update, &mut item, &ctx)?;
            table.items.insert(key, item.clone());

            Ok(match input.return_values {
                ReturnValues::None => None,
                ReturnValues::AllOld => old,
                ReturnValues::AllNew => Some(item),
            })
        })?;

        Ok(UpdateItemOutput {
            attributes,
            consumed_capacity: input
                .return_consumed_capacity
                .then(|| ConsumedCapacity::new(WRITE_UNIT)),
        })
    }

    async fn delete_item(&self, input: DeleteItemInput) -> Result<DeleteItemOutput, StoreError> {
        self.record("delete_item");
        let key = item_key(&input.key)?;
        let ctx = EvalContext {
            names: &input.names,
            values: &input.values,
        };

        let attributes = self.with_table(&input.table, |table| {
            let current = table.items.get(&key);
            if let Some(condition) = &input.condition
                && !eval_condition(condition, current, &ctx)?
            {
                return Err(StoreError::ConditionalCheckFailed { message: None });
            }

            let old = table.items.remove(&key);
            Ok::<_, StoreError>(match input.return_values {
                ReturnValues::AllOld => old,
                _ => None,
            })
        })?;

        Ok(DeleteItemOutput {
            attributes,
            consumed_capacity: input
                .return_consumed_capacity
                .then(|| ConsumedCapacity::new(WRITE_UNIT)),
        })
    }

    async fn batch_get_item(
        &self,
        input: BatchGetItemInput,
    ) -> Result<BatchGetItemOutput, StoreError> {
        self.record("batch_get_item");

        let mut responses = Vec::new();
        self.with_table(&input.table, |table| {
            for key in &input.keys {
                let id = item_key(key)?;
                if let Some(item) = table.items.get(&id) {
                    responses.push(item.clone());
                }
            }
            Ok::<_, StoreError>(())
        })?;

        #[allow(clippy::cast_precision_loss)]
        let capacity = READ_UNIT * input.keys.len().max(1) as f64;

        Ok(BatchGetItemOutput {
            responses,
            unprocessed_keys: Vec::new(),
            consumed_capacity: input
                .return_consumed_capacity
                .then(|| ConsumedCapacity::new(capacity)),
        })
    }

    async fn transact_write_items(
        &self,
        input: TransactWriteItemsInput,
    ) -> Result<TransactWriteItemsOutput, StoreError> {
        self.record("transact_write_items");

        self.with_table(&input.table, |table| {
            // phase 1: every condition against the pre-transaction state
            let mut reasons = Vec::with_capacity(input.items.len());
            let mut any_failed = false;

            for item in &input.items {
                let (key, condition, names, values) = match item {
                    TransactWriteItem::Put {
                        item,
                        condition,
                        names,
                        values,
                    } => (item_key(item)?, condition, names, values),
                    TransactWriteItem::Update {
                        key,
                        condition,
                        names,
                        values,
                        ..
                    }
                    | TransactWriteItem::Delete {
                        key,
                        condition,
                        names,
                        values,
                    } => (item_key(key)?, condition, names, values),
                };

                let ctx = EvalContext { names, values };
                let passed = match condition {
                    Some(condition) => {
                        eval_condition(condition, table.items.get(&key), &ctx)?
                    }
                    None => true,
                };

                if passed {
                    reasons.push(CancellationReason {
                        code: Some(CancellationReason::NONE.to_string()),
                        message: None,
                    });
                } else {
                    any_failed = true;
                    reasons.push(CancellationReason {
                        code: Some(CancellationReason::CONDITIONAL_CHECK_FAILED.to_string()),
                        message: Some("the conditional request failed".to_string()),
                    });
                }
            }

            if any_failed {
                return Err(StoreError::TransactionCanceled { reasons });
            }

            // phase 2: apply
            for item in input.items {
                match item {
                    TransactWriteItem::Put { item, .. } => {
                        let key = item_key(&item)?;
                        table.items.insert(key, item);
                    }
                    TransactWriteItem::Update {
                        key,
                        update,
                        names,
                        values,
                        ..
                    } => {
                        let id = item_key(&key)?;
                        let ctx = EvalContext {
                            names: &names,
                            values: &values,
                        };
                        let mut item = table.items.get(&id).cloned().unwrap_or(key);
                        apply_update(&update, &mut item, &ctx)?;
                        table.items.insert(id, item);
                    }
                    TransactWriteItem::Delete { key, .. } => {
                        table.items.remove(&item_key(&key)?);
                    }
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let capacity = TXN_WRITE_UNIT * reasons.len().max(1) as f64;
            Ok(TransactWriteItemsOutput {
                consumed_capacity: input
                    .return_consumed_capacity
                    .then(|| ConsumedCapacity::new(capacity)),
            })
        })
    }

    async fn describe_table(&self, table: &str) -> Result<TableDescription, StoreError> {
        self.record("describe_table");
        let item_count = self.item_count(table) as u64;

        Ok(TableDescription {
            name: table.to_string(),
            item_count,
        })
    }
}
