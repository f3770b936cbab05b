use crate::schema::{EntityDef, IndexSlot, UniqueSlot};
use std::fmt;
use thiserror::Error as ThisError;
use xxhash_rust::xxh3::xxh3_64;

///
/// Physical key grammar.
///
/// Every reserved attribute name and key-string shape in this module is
/// load-bearing for on-disk compatibility; none of them may drift.
///

pub const ATTR_PK: &str = "_pk";
pub const ATTR_SK: &str = "_sk";
pub const ATTR_TENANT: &str = "_tenant_id";
pub const ATTR_ITER_PK: &str = "_iter_pk";
pub const ATTR_ITER_SK: &str = "_iter_sk";

/// Uniqueness records store the owning primary id and entity under these.
pub const ATTR_UC_OWNER: &str = "_owner_id";
pub const ATTR_UC_ENTITY: &str = "_owner_entity";

pub const TTL_ATTR: &str = "ttl";

/// Sentinel key-field name meaning "use the entity prefix as the literal
/// key component".
pub const MODEL_PREFIX_SENTINEL: &str = "modelPrefix";

/// Literal substituted for the tenant segment when tenancy is disabled.
pub const NO_TENANT: &str = "no-tenant";

const UC_TAG: &str = "_uc";
const ITER_TAG: &str = "iter";
const COMPOSITE_SEPARATOR: &str = "##__SK__##";

///
/// DataFormatError
///

#[derive(Clone, Debug, ThisError)]
pub enum DataFormatError {
    #[error("unparsable primary id {data}: expected {expected}")]
    PrimaryId {
        data: String,
        expected: &'static str,
    },

    #[error("stored item {primary_id} lacks field {field} needed to rebuild index {index}")]
    MissingBackfill {
        primary_id: String,
        field: String,
        index: String,
    },

    #[error("stored item lacks reserved attribute {attr}")]
    MissingReservedAttr { attr: &'static str },

    #[error("unparsable continuation token")]
    Continuation { data: String },
}

///
/// PrimaryId
///
/// User-facing name of one record. Composite when the entity's primary key
/// declares a sort field; the composite text form is
/// `pk##__SK__##sk`, the single-field form is the bare partition value.
///

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PrimaryId {
    pub partition: String,
    pub sort: Option<String>,
}

impl PrimaryId {
    #[must_use]
    pub fn simple(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: None,
        }
    }

    #[must_use]
    pub fn composite(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: Some(sort.into()),
        }
    }

    /// Parse the opaque text form back into its components.
    pub fn parse(raw: &str) -> Result<Self, DataFormatError> {
        if raw.is_empty() {
            return Err(DataFormatError::PrimaryId {
                data: raw.to_string(),
                expected: "a non-empty id",
            });
        }

        match raw.split_once(COMPOSITE_SEPARATOR) {
            None => Ok(Self::simple(raw)),
            Some((partition, sort)) => {
                if partition.is_empty() || sort.is_empty() || sort.contains(COMPOSITE_SEPARATOR) {
                    return Err(DataFormatError::PrimaryId {
                        data: raw.to_string(),
                        expected: "pk##__SK__##sk with non-empty components",
                    });
                }
                Ok(Self::composite(partition, sort))
            }
        }
    }
}

impl fmt::Display for PrimaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sort {
            None => write!(f, "{}", self.partition),
            Some(sort) => write!(f, "{}{COMPOSITE_SEPARATOR}{sort}", self.partition),
        }
    }
}

///
/// KeyCodec
///
/// Composes and parses every physical key shape for one entity under one
/// tenant. Field values arrive already index-encoded; the codec only owns
/// the surrounding grammar.
///

#[derive(Clone, Copy, Debug)]
pub struct KeyCodec<'a> {
    entity: &'a EntityDef,
    tenant: &'a str,
}

impl<'a> KeyCodec<'a> {
    #[must_use]
    pub const fn new(entity: &'a EntityDef, tenant: &'a str) -> Self {
        Self { entity, tenant }
    }

    /// `_pk` of the main item: `[T]#P#I`.
    #[must_use]
    pub fn primary_pk(&self, id: &PrimaryId) -> String {
        format!("{}#{}#{}", self.tenant, self.entity.prefix, id.partition)
    }

    /// `_sk` of the main item: the sort component, or the entity prefix for
    /// single-field primary keys.
    #[must_use]
    pub fn primary_sk(&self, id: &PrimaryId) -> String {
        id.sort
            .clone()
            .unwrap_or_else(|| self.entity.prefix.clone())
    }

    /// Recover the primary id from stored `_pk`/`_sk` attributes.
    pub fn parse_primary(&self, pk: &str, sk: &str) -> Result<PrimaryId, DataFormatError> {
        let prefix = format!("{}#{}#", self.tenant, self.entity.prefix);
        let partition = pk
            .strip_prefix(&prefix)
            .ok_or_else(|| DataFormatError::PrimaryId {
                data: pk.to_string(),
                expected: "tenant#prefix#partition",
            })?;

        if self.entity.primary_key.sort.is_some() {
            Ok(PrimaryId::composite(partition, sk))
        } else {
            Ok(PrimaryId::simple(partition))
        }
    }

    /// `_gsi{n}_pk`: `[T]#P#ix{n}#<encoded partition value>`.
    #[must_use]
    pub fn gsi_pk(&self, slot: IndexSlot, encoded_partition: &str) -> String {
        format!(
            "{}#{}#{}#{encoded_partition}",
            self.tenant,
            self.entity.prefix,
            slot.token()
        )
    }

    /// Uniqueness record `_pk`: `[T]#_uc#<slot>#P#<field>:<encoded value>`.
    #[must_use]
    pub fn unique_pk(&self, slot: UniqueSlot, field: &str, encoded_value: &str) -> String {
        format!(
            "{}#{UC_TAG}#{}#{}#{field}:{encoded_value}",
            self.tenant,
            slot.token(),
            self.entity.prefix
        )
    }

    /// Uniqueness record `_sk` (constant).
    #[must_use]
    pub const fn unique_sk() -> &'static str {
        UC_TAG
    }

    /// `_iter_pk`: `[T]#P#iter#<bucket>`, or `[T]#P#iter` for single-bucket
    /// entities.
    #[must_use]
    pub fn iter_pk(&self, bucket: u32) -> String {
        if self.entity.iteration.buckets == 1 {
            format!("{}#{}#{ITER_TAG}", self.tenant, self.entity.prefix)
        } else {
            format!("{}#{}#{ITER_TAG}#{bucket}", self.tenant, self.entity.prefix)
        }
    }

    /// Iteration bucket for a primary id.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bucket_for(&self, id: &PrimaryId) -> u32 {
        let buckets = self.entity.iteration.buckets;
        if buckets == 1 {
            return 0;
        }
        (xxh3_64(id.to_string().as_bytes()) % u64::from(buckets)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures;

    fn codec(entity: &EntityDef) -> KeyCodec<'_> {
        KeyCodec::new(entity, "t1")
    }

    #[test]
    fn primary_key_grammar() {
        let registry = test_fixtures::registry();
        let user = registry.entity("user").unwrap();
        let codec = codec(&user);
        let id = PrimaryId::simple("01ARZ3NDEKTSV4RRFFQ69G5FAV");

        assert_eq!(codec.primary_pk(&id), "t1#u#01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(codec.primary_sk(&id), "u");
    }

    #[test]
    fn composite_primary_id_round_trips() {
        let id = PrimaryId::composite("order-1", "00000000000000001234");
        let text = id.to_string();

        assert_eq!(text, "order-1##__SK__##00000000000000001234");
        assert_eq!(PrimaryId::parse(&text).unwrap(), id);
    }

    #[test]
    fn primary_id_rejects_empty_components() {
        assert!(PrimaryId::parse("").is_err());
        assert!(PrimaryId::parse("a##__SK__##").is_err());
        assert!(PrimaryId::parse("##__SK__##b").is_err());
    }

    #[test]
    fn unique_record_grammar() {
        let registry = test_fixtures::registry();
        let user = registry.entity("user").unwrap();
        let codec = codec(&user);

        assert_eq!(
            codec.unique_pk(UniqueSlot::Uc1, "email", "a@b.test"),
            "t1#_uc#uc1#u#email:a@b.test"
        );
        assert_eq!(KeyCodec::unique_sk(), "_uc");
    }

    #[test]
    fn gsi_partition_grammar() {
        let registry = test_fixtures::registry();
        let user = registry.entity("user").unwrap();
        let codec = codec(&user);

        assert_eq!(codec.gsi_pk(IndexSlot::Ix1, "admin"), "t1#u#ix1#admin");
    }

    #[test]
    fn iteration_key_omits_bucket_when_single() {
        let registry = test_fixtures::registry();
        let user = registry.entity("user").unwrap();
        let task = registry.entity("task").unwrap();

        assert_eq!(codec(&task).iter_pk(0), "t1#tk#iter");
        assert_eq!(codec(&user).iter_pk(3), "t1#u#iter#3");
    }

    #[test]
    fn buckets_are_stable_and_in_range() {
        let registry = test_fixtures::registry();
        let user = registry.entity("user").unwrap();
        let codec = codec(&user);

        for i in 0..50 {
            let id = PrimaryId::simple(format!("id-{i}"));
            let bucket = codec.bucket_for(&id);
            assert!(bucket < user.iteration.buckets);
            assert_eq!(bucket, codec.bucket_for(&id));
        }
    }
}
