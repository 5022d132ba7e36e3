//! Core domain models and strongly-typed identifiers.
//!
//! Defines the persisted work item ([`Record`]), the content-derived
//! [`RecordId`], the per-process [`OwnerId`], and the [`TopicSet`] a worker
//! subscribes to. Identifier newtypes carry their own sqlx encodings so they
//! bind directly into queries.

use std::{collections::BTreeSet, fmt, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Content-derived record identifier.
///
/// The lowercase hex SHA-256 digest of the payload bytes. Two sends of the
/// same payload always produce the same identifier, which is what lets the
/// store's primary key deduplicate work.
///
/// # Example
///
/// ```
/// use leaseq_core::models::RecordId;
///
/// let id = RecordId::from_payload(b"A");
/// assert_eq!(
///     id.as_str(),
///     "559aead08264d5795d3909718cdd05abd49572e84fe55590eef31a88a08fdffd"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Computes the identifier for a payload.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(payload)))
    }

    /// Wraps an identifier read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl sqlx::Type<PgDb> for RecordId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RecordId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let hex = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(hex))
    }
}

impl sqlx::Encode<'_, PgDb> for RecordId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Worker session identity.
///
/// Generated once per worker controller and stamped onto every record it
/// claims. Heartbeats only match records carrying the caller's owner, so a
/// lease reclaimed from a stalled worker can never be renewed by it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    /// Creates a new random owner identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OwnerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for OwnerId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OwnerId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for OwnerId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Topics a worker subscribes to.
///
/// A record is eligible for a worker when it carries no topic or its topic
/// is in the set. An empty set therefore only admits untagged records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicSet(BTreeSet<String>);

impl TopicSet {
    /// Creates an empty topic set.
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Returns whether a record tagged with `topic` may be claimed.
    pub fn admits(&self, topic: Option<&str>) -> bool {
        topic.map_or(true, |topic| self.0.contains(topic))
    }

    /// Adds a topic, returning whether it was new.
    pub fn insert(&mut self, topic: impl Into<String>) -> bool {
        self.0.insert(topic.into())
    }

    /// Iterates topics in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of subscribed topics.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no topics are subscribed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Topics as an owned list, for binding as a SQL array.
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for TopicSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A persisted unit of work.
///
/// State machine, driven entirely by conditional writes:
///
/// ```text
///            claim                     complete
/// available ───────▶ in progress ──────────────▶ deleted
///     ▲                  │ │
///     │   requeue        │ │ lease expires
///     └──────────────────┘ └──────────────▶ available (reclaimed)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Record {
    /// Digest of the payload; primary key.
    pub id: RecordId,

    /// Transport-encoded message body.
    pub payload: Vec<u8>,

    /// Routing tag, or `None` for records any worker may claim.
    pub topic: Option<String>,

    /// True while a worker holds the lease.
    pub in_progress: bool,

    /// Session identity of the leaseholder.
    pub owner: Option<OwnerId>,

    /// Claim time or most recent heartbeat.
    pub lease_timestamp: DateTime<Utc>,

    /// Set once the record has been released for redelivery.
    pub requeued: bool,

    /// When the record was first inserted.
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// Builds a new, unclaimed record for a payload.
    pub fn new(payload: impl Into<Bytes>, topic: Option<String>, now: DateTime<Utc>) -> Self {
        let payload: Bytes = payload.into();

        Self {
            id: RecordId::from_payload(&payload),
            payload: payload.to_vec(),
            topic,
            in_progress: false,
            owner: None,
            lease_timestamp: now,
            requeued: false,
            created_at: now,
        }
    }

    /// Payload as Bytes for zero-copy handoff.
    pub fn payload_bytes(&self) -> Bytes {
        Bytes::from(self.payload.clone())
    }

    /// Whether a leaseholder has gone longer than `lifetime` without a
    /// heartbeat as of `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>, lifetime: Duration) -> bool {
        if !self.in_progress {
            return false;
        }
        chrono::Duration::from_std(lifetime)
            .map(|lifetime| self.lease_timestamp < now - lifetime)
            .unwrap_or(false)
    }
}

/// A record returned by a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ClaimedRecord {
    /// The record as stored after the claim.
    #[sqlx(flatten)]
    pub record: Record,

    /// Whether the record had been released for redelivery before this
    /// claim picked it up.
    pub redelivered: bool,
}
