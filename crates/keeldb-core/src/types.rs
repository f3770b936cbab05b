use chrono::{DateTime, SecondsFormat, Utc};
use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use ulid::Ulid as WrappedUlid;

///
/// UlidError
///

#[derive(Debug, ThisError)]
pub enum UlidError {
    #[error("invalid ulid string")]
    InvalidString,
}

///
/// UlidId
///
/// 26-character Crockford base-32 identifier.
/// The text form is the only shape that ever reaches storage.
///

#[derive(
    Clone, Copy, Debug, Deref, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd, Serialize,
    Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct UlidId(WrappedUlid);

impl UlidId {
    pub const ENCODED_LEN: usize = 26;

    #[must_use]
    pub const fn nil() -> Self {
        Self(WrappedUlid::nil())
    }

    /// Generate a ULID with the current timestamp and fresh randomness.
    #[must_use]
    pub fn generate() -> Self {
        Self(WrappedUlid::new())
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(WrappedUlid::from_bytes(bytes))
    }

    pub fn parse(encoded: &str) -> Result<Self, UlidError> {
        if encoded.len() != Self::ENCODED_LEN {
            return Err(UlidError::InvalidString);
        }
        let this = WrappedUlid::from_string(encoded).map_err(|_| UlidError::InvalidString)?;

        Ok(Self(this))
    }

    #[must_use]
    pub const fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for UlidId {
    fn default() -> Self {
        Self::nil()
    }
}

///
/// InstantError
///

#[derive(Debug, ThisError)]
pub enum InstantError {
    #[error("unparsable instant: {input}")]
    Unparsable { input: String },
}

///
/// Instant
/// (epoch milliseconds, UTC)
///
/// Ingress accepts millisecond integers or ISO-8601 strings; index encoding
/// and storage always use the millisecond integer form.
///

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deref,
    Display,
    Eq,
    From,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Instant(i64);

impl Instant {
    pub const EPOCH: Self = Self(0);
    pub const MIN: Self = Self(i64::MIN);
    pub const MAX: Self = Self(i64::MAX);

    #[must_use]
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000)
    }

    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Whole seconds since the epoch (TTL attributes store this form).
    #[must_use]
    pub const fn as_secs(&self) -> i64 {
        self.0.div_euclid(1_000)
    }

    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Parse an ISO-8601 / RFC 3339 datetime string.
    pub fn parse_iso8601(input: &str) -> Result<Self, InstantError> {
        DateTime::parse_from_rfc3339(input)
            .map(|dt| Self(dt.timestamp_millis()))
            .map_err(|_| InstantError::Unparsable {
                input: input.to_string(),
            })
    }

    #[must_use]
    pub fn to_iso8601(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.0)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

///
/// TenantId
///
/// Opaque tenant identifier prefixed onto every physical key.
///

#[derive(
    Clone, Debug, Deref, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd, Serialize,
    Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct TenantId(String);

impl TenantId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
