//! Typed 128-bit identifiers for every primitive in the engine.
//!
//! `Id<T>` wraps a `uuid::Uuid` with a zero-sized marker so that, for example,
//! a `JoinId` cannot be passed where a `WorkItemId` is expected. The wrapper
//! is transparent to the database layer: it encodes and decodes as a plain
//! `UUID` column, including inside array binds.
//!
//! # Example
//!
//! ```rust
//! use conveyor::id::{WorkItemId, OwnerToken};
//!
//! let item: WorkItemId = WorkItemId::random();
//! let owner: OwnerToken = OwnerToken::random();
//!
//! // This would be a compile error:
//! // let wrong: OwnerToken = item;
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Marker types
// ============================================================================

/// Marker for outbox work-item rows (the `id` primary key).
pub struct WorkItem;

/// Marker for consumer-facing outbox message ids (stable across retries,
/// distinct from the work-item row id).
pub struct Message;

/// Marker for inbox message identities.
pub struct InboxMessage;

/// Marker for join aggregates.
pub struct Join;

/// Marker for engine instances.
pub struct Instance;

/// Marker for tenant databases.
pub struct Database;

/// Marker for claim/lease owners.
pub struct Owner;

/// Marker for scheduler timers.
pub struct Timer;

/// Marker for scheduler job runs.
pub struct JobRun;

// ============================================================================
// Type aliases - the primary API
// ============================================================================

/// Typed id for an outbox work-item row.
pub type WorkItemId = Id<WorkItem>;

/// Typed id for a consumer-facing outbox message.
pub type MessageId = Id<Message>;

/// Typed id for an inbox message.
pub type InboxMessageId = Id<InboxMessage>;

/// Typed id for a join aggregate.
pub type JoinId = Id<Join>;

/// Typed id for an engine instance.
pub type InstanceId = Id<Instance>;

/// Typed id for a tenant database.
pub type DatabaseId = Id<Database>;

/// Random token identifying the current holder of a claim or lease.
///
/// Row updates are fenced on this value: ack/abandon/fail and lease renew
/// only touch rows whose stored token matches the caller's.
pub type OwnerToken = Id<Owner>;

/// Typed id for a scheduler timer row.
pub type TimerId = Id<Timer>;

/// Typed id for a scheduler job-run row.
pub type JobRunId = Id<JobRun>;

// ============================================================================
// Id
// ============================================================================

/// An opaque 128-bit identifier tagged with the entity type `T`.
///
/// Generation is random (collision-resistant); a nil sentinel exists for
/// "no value" columns.
#[repr(transparent)]
pub struct Id<T>(Uuid, PhantomData<fn() -> T>);

impl<T> Id<T> {
    /// Generates a fresh random id.
    #[inline]
    pub fn random() -> Self {
        Self(Uuid::new_v4(), PhantomData)
    }

    /// Wraps a raw `Uuid` (database loads, deserialization).
    #[inline]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid, PhantomData)
    }

    /// Returns the inner `Uuid`.
    #[inline]
    pub fn into_uuid(self) -> Uuid {
        self.0
    }

    /// Borrows the inner `Uuid`.
    #[inline]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parses an id from its canonical string form.
    #[inline]
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?, PhantomData))
    }

    /// The all-zero sentinel.
    #[inline]
    pub fn empty() -> Self {
        Self(Uuid::nil(), PhantomData)
    }

    /// Returns `true` for the all-zero sentinel.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::random()
    }
}

// ============================================================================
// Standard trait implementations
// ============================================================================

impl<T> Clone for Id<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(&format!("Id<{}>", std::any::type_name::<T>()))
            .field(&self.0)
            .finish()
    }
}

impl<T> Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<T> PartialEq for Id<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T> Hash for Id<T> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> AsRef<Uuid> for Id<T> {
    #[inline]
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl<T> From<Uuid> for Id<T> {
    #[inline]
    fn from(uuid: Uuid) -> Self {
        Self::from_uuid(uuid)
    }
}

impl<T> From<Id<T>> for Uuid {
    #[inline]
    fn from(id: Id<T>) -> Self {
        id.0
    }
}

impl<T> FromStr for Id<T> {
    type Err = uuid::Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Serde support
// ============================================================================

impl<T> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Uuid::deserialize(deserializer).map(Self::from_uuid)
    }
}

// ============================================================================
// sqlx support
// ============================================================================

use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgHasArrayType, PgTypeInfo, PgValueRef, Postgres};
use sqlx::{Decode, Encode, Type};

impl<T> Type<Postgres> for Id<T> {
    fn type_info() -> PgTypeInfo {
        <Uuid as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <Uuid as Type<Postgres>>::compatible(ty)
    }
}

impl<T> PgHasArrayType for Id<T> {
    fn array_type_info() -> PgTypeInfo {
        <Uuid as PgHasArrayType>::array_type_info()
    }
}

impl<T> Encode<'_, Postgres> for Id<T> {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <Uuid as Encode<Postgres>>::encode_by_ref(&self.0, buf)
    }
}

impl<T> Decode<'_, Postgres> for Id<T> {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        <Uuid as Decode<Postgres>>::decode(value).map(Self::from_uuid)
    }
}

// ============================================================================
// Tests
// ============================================================================
