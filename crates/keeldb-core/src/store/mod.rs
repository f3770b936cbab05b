pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap, fmt};
use thiserror::Error as ThisError;

///
/// Wire contract for the backing wide-column store.
///
/// The real client (credentialed, regional) lives outside this crate; the
/// runtime only depends on this trait and its typed request/response shapes.
/// `memory::MemoryStore` implements the same contract for tests.
///

/// One physical item: attribute name to wire scalar.
pub type Item = BTreeMap<String, Scalar>;

///
/// Scalar
///
/// Backend-native attribute value. Numbers travel as decimal strings, which
/// is the backend's lossless wire form.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Scalar {
    S(String),
    N(String),
    B(Vec<u8>),
    Bool(bool),
    Null,
}

impl Scalar {
    #[must_use]
    pub fn number(n: i64) -> Self {
        Self::N(n.to_string())
    }

    #[must_use]
    pub fn float(n: f64) -> Self {
        Self::N(format!("{n}"))
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::S(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::N(n) => n.parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::N(n) => n.parse().ok(),
            _ => None,
        }
    }

    /// Wire-level ordering: numbers numerically, strings and bytes
    /// lexicographically. Mixed types order by type tag, which only matters
    /// to the in-memory double.
    #[must_use]
    pub fn wire_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::N(a), Self::N(b)) => {
                let left: f64 = a.parse().unwrap_or(f64::NAN);
                let right: f64 = b.parse().unwrap_or(f64::NAN);
                left.partial_cmp(&right).unwrap_or(Ordering::Equal)
            }
            (Self::S(a), Self::S(b)) => a.cmp(b),
            (Self::B(a), Self::B(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    const fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::N(_) => 2,
            Self::S(_) => 3,
            Self::B(_) => 4,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S(s) => write!(f, "{s}"),
            Self::N(n) => write!(f, "{n}"),
            Self::B(b) => write!(f, "<{} bytes>", b.len()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Null => write!(f, "null"),
        }
    }
}

///
/// ConsumedCapacity
///

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConsumedCapacity {
    pub capacity_units: f64,
}

impl ConsumedCapacity {
    #[must_use]
    pub const fn new(capacity_units: f64) -> Self {
        Self { capacity_units }
    }
}

///
/// Request / response shapes
///

#[derive(Clone, Debug)]
pub struct GetItemInput {
    pub table: String,
    pub key: Item,
    pub return_consumed_capacity: bool,
}

#[derive(Clone, Debug, Default)]
pub struct GetItemOutput {
    pub item: Option<Item>,
    pub consumed_capacity: Option<ConsumedCapacity>,
}

#[derive(Clone, Debug)]
pub struct PutItemInput {
    pub table: String,
    pub item: Item,
    pub condition: Option<String>,
    pub names: BTreeMap<String, String>,
    pub values: BTreeMap<String, Scalar>,
    pub return_consumed_capacity: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PutItemOutput {
    pub consumed_capacity: Option<ConsumedCapacity>,
}

#[derive(Clone, Debug)]
pub struct QueryInput {
    pub table: String,
    pub index_name: Option<String>,
    pub key_condition: String,
    pub filter: Option<String>,
    pub names: BTreeMap<String, String>,
    pub values: BTreeMap<String, Scalar>,
    pub limit: Option<u32>,
    pub exclusive_start_key: Option<Item>,
    pub reverse: bool,
    pub count_only: bool,
    pub return_consumed_capacity: bool,
}

#[derive(Clone, Debug, Default)]
pub struct QueryOutput {
    pub items: Vec<Item>,
    pub count: u64,
    pub scanned_count: u64,
    pub last_evaluated_key: Option<Item>,
    pub consumed_capacity: Option<ConsumedCapacity>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReturnValues {
    #[default]
    None,
    AllOld,
    AllNew,
}

#[derive(Clone, Debug)]
pub struct UpdateItemInput {
    pub table: String,
    pub key: Item,
    pub update: String,
    pub condition: Option<String>,
    pub names: BTreeMap<String, String>,
    pub values: BTreeMap<String, Scalar>,
    pub return_values: ReturnValues,
    pub return_consumed_capacity: bool,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateItemOutput {
    pub attributes: Option<Item>,
    pub consumed_capacity: Option<ConsumedCapacity>,
}

#[derive(Clone, Debug)]
pub struct DeleteItemInput {
    pub table: String,
    pub key: Item,
    pub condition: Option<String>,
    pub names: BTreeMap<String, String>,
    pub values: BTreeMap<String, Scalar>,
    pub return_values: ReturnValues,
    pub return_consumed_capacity: bool,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteItemOutput {
    pub attributes: Option<Item>,
    pub consumed_capacity: Option<ConsumedCapacity>,
}

#[derive(Clone, Debug)]
pub struct BatchGetItemInput {
    pub table: String,
    pub keys: Vec<Item>,
    pub return_consumed_capacity: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BatchGetItemOutput {
    pub responses: Vec<Item>,
    pub unprocessed_keys: Vec<Item>,
    pub consumed_capacity: Option<ConsumedCapacity>,
}

///
/// TransactWriteItem
///
/// One participant in a transactional write. Cancellation reasons come back
/// positionally aligned with the submitted participants.
///

#[derive(Clone, Debug)]
pub enum TransactWriteItem {
    Put {
        item: Item,
        condition: Option<String>,
        names: BTreeMap<String, String>,
        values: BTreeMap<String, Scalar>,
    },
    Update {
        key: Item,
        update: String,
        condition: Option<String>,
        names: BTreeMap<String, String>,
        values: BTreeMap<String, Scalar>,
    },
    Delete {
        key: Item,
        condition: Option<String>,
        names: BTreeMap<String, String>,
        values: BTreeMap<String, Scalar>,
    },
}

#[derive(Clone, Debug)]
pub struct TransactWriteItemsInput {
    pub table: String,
    pub items: Vec<TransactWriteItem>,
    pub return_consumed_capacity: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TransactWriteItemsOutput {
    pub consumed_capacity: Option<ConsumedCapacity>,
}

///
/// CancellationReason
///

#[derive(Clone, Debug, Default)]
pub struct CancellationReason {
    pub code: Option<String>,
    pub message: Option<String>,
}

impl CancellationReason {
    pub const CONDITIONAL_CHECK_FAILED: &'static str = "ConditionalCheckFailed";
    pub const NONE: &'static str = "None";

    #[must_use]
    pub fn is_conditional_check_failed(&self) -> bool {
        self.code.as_deref() == Some(Self::CONDITIONAL_CHECK_FAILED)
    }
}

#[derive(Clone, Debug)]
pub struct TableDescription {
    pub name: String,
    pub item_count: u64,
}

///
/// StoreError
///

#[derive(Clone, Debug, ThisError)]
pub enum StoreError {
    #[error("conditional check failed")]
    ConditionalCheckFailed { message: Option<String> },

    #[error("transaction canceled")]
    TransactionCanceled { reasons: Vec<CancellationReason> },

    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("malformed expression: {message}")]
    MalformedExpression { message: String },

    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
}

///
/// StoreClient
///
/// Every method is one backend round-trip and one suspension point.
///

#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    async fn get_item(&self, input: GetItemInput) -> Result<GetItemOutput, StoreError>;

    async fn put_item(&self, input: PutItemInput) -> Result<PutItemOutput, StoreError>;

    async fn query(&self, input: QueryInput) -> Result<QueryOutput, StoreError>;

    async fn update_item(&self, input: UpdateItemInput) -> Result<UpdateItemOutput, StoreError>;

    async fn delete_item(&self, input: DeleteItemInput) -> Result<DeleteItemOutput, StoreError>;

    async fn batch_get_item(
        &self,
        input: BatchGetItemInput,
    ) -> Result<BatchGetItemOutput, StoreError>;

    async fn transact_write_items(
        &self,
        input: TransactWriteItemsInput,
    ) -> Result<TransactWriteItemsOutput, StoreError>;

    async fn describe_table(&self, table: &str) -> Result<TableDescription, StoreError>;
}
