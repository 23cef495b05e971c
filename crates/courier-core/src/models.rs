//! Core domain models and strongly-typed identifiers.
//!
//! Defines workers, queues, messages, delivery rows, and newtype ID wrappers
//! for compile-time type safety, along with the delivery state machine:
//!
//! ```text
//! Pending -> Leased -> Acknowledged            (2xx)
//!                   -> Pending                 (failure, budget remains)
//!                   -> dead-letter row         (failure, budget exhausted)
//! ```

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Strongly-typed worker identifier.
    ///
    /// A worker is an HTTP endpoint that consumes deliveries. The ID is
    /// referenced by every queue bound to the worker.
    WorkerId
}

uuid_id! {
    /// Strongly-typed queue identifier.
    QueueId
}

uuid_id! {
    /// Strongly-typed message identifier, supplied by the publisher.
    MessageId
}

/// A registered worker endpoint.
///
/// Deleting a worker cascades to every queue that references it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Worker {
    /// Unique identifier for this worker.
    pub id: WorkerId,

    /// Human-readable display name.
    pub name: String,

    /// HTTP endpoint URL deliveries are POSTed to.
    pub endpoint: String,

    /// Requests-per-second ceiling. Each queue bound to this worker leases
    /// at most this many rows per tick.
    pub rps: i32,

    /// When this worker was registered.
    pub created_at: DateTime<Utc>,

    /// Last time the worker reported a heartbeat, if it ever did.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// A queue binding a routing-key pattern to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Queue {
    /// Unique identifier for this queue.
    pub id: QueueId,

    /// Unique queue name. Validated as a strict identifier (letters,
    /// digits, underscore; must not start with a digit).
    pub name: String,

    /// Pattern matched against message routing keys; `*` matches any
    /// substring.
    pub binding_pattern: String,

    /// Worker that receives this queue's deliveries.
    pub worker_id: WorkerId,

    /// Failed attempts allowed before a delivery is dead-lettered. The
    /// first attempt runs at zero recorded retries, so a row is attempted
    /// `max_retries + 1` times in total.
    pub max_retries: i32,

    /// When this queue was created.
    pub created_at: DateTime<Utc>,
}

/// A published message. Immutable after insertion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Publisher-supplied unique identifier.
    pub id: MessageId,

    /// Routing key matched against queue binding patterns at publish time.
    pub routing_key: String,

    /// JSON document delivered verbatim as the POST body.
    pub body: serde_json::Value,

    /// Optional JSON headers. Stored but never transmitted to workers.
    pub headers: Option<serde_json::Value>,

    /// Earliest time any queue may lease a delivery of this message.
    pub visible_at: DateTime<Utc>,

    /// Publisher wall-clock at submission. May be later than `visible_at`;
    /// messages can be backdated.
    pub occurred_at: DateTime<Utc>,
}

/// Per-queue unit of work the dispatcher drives through its state machine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    /// Monotonically-assigned local id; the tie-break for lease ordering.
    pub id: i64,

    /// Queue this delivery belongs to.
    pub queue_id: QueueId,

    /// Message being delivered.
    pub message_id: MessageId,

    /// True once the worker returned 2xx. Terminal.
    pub acknowledged: bool,

    /// Failed attempts already made against this row.
    pub retries: i32,

    /// True while exactly one dispatcher holds the lease on this row.
    pub locked: bool,

    /// When the current lease was taken. Cleared on resolution; drives the
    /// abandoned-lease sweep.
    pub locked_at: Option<DateTime<Utc>>,

    /// Copied from the message's `visible_at`; lease order and visibility
    /// are both derived from it.
    pub enqueued_at: DateTime<Utc>,

    /// Set when the delivery is acknowledged.
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Derives the state-machine state from the row flags.
    pub fn state(&self) -> DeliveryState {
        if self.acknowledged {
            DeliveryState::Acknowledged
        } else if self.locked {
            DeliveryState::Leased
        } else {
            DeliveryState::Pending
        }
    }
}

/// Delivery lifecycle state derived from row flags.
///
/// Dead-lettered rows do not appear here: dead-lettering deletes the
/// delivery row and writes its frozen copy to the dead-letter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Waiting to be leased.
    Pending,
    /// Exclusively claimed by one dispatcher for an attempt in flight.
    Leased,
    /// Worker returned 2xx. Terminal.
    Acknowledged,
}

/// A delivery that exhausted its retry budget. Written once, never mutated.
///
/// Mirrors the delivery-row shape; the lock and acknowledgement columns are
/// frozen at their final values.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetter {
    /// Local id in the dead-letter table.
    pub id: i64,

    /// Queue the delivery belonged to.
    pub queue_id: QueueId,

    /// Message that could not be delivered.
    pub message_id: MessageId,

    /// Always false; kept for shape parity with delivery rows.
    pub acknowledged: bool,

    /// Final retry count. Equals the queue's `max_retries`.
    pub retries: i32,

    /// Always false; kept for shape parity with delivery rows.
    pub locked: bool,

    /// When the row was moved into the dead-letter table.
    pub enqueued_at: DateTime<Utc>,

    /// Always `None`; kept for shape parity with delivery rows.
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// A leased delivery joined with the message payload, as returned by the
/// lease phase.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeasedDelivery {
    /// Delivery row id.
    pub id: i64,

    /// Message being delivered.
    pub message_id: MessageId,

    /// Failed attempts already made; the current attempt runs at this
    /// value.
    pub retries: i32,

    /// Lease-ordering timestamp.
    pub enqueued_at: DateTime<Utc>,

    /// Raw JSON body to POST.
    pub body: serde_json::Value,
}

/// When a published message becomes visible to dispatchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Visible immediately.
    Immediate,
    /// Visible at an absolute timestamp.
    At(DateTime<Utc>),
    /// Visible after a delay in seconds from publish time.
    After(u32),
}

impl Visibility {
    /// Resolves to the absolute `visible_at` timestamp for a publish
    /// happening at `now`.
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Immediate => now,
            Self::At(at) => at,
            Self::After(seconds) => now + Duration::seconds(i64::from(seconds)),
        }
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Self::Immediate
    }
}

/// Input to `publish`: a message plus its visibility.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Publisher-supplied unique identifier.
    pub id: MessageId,

    /// Routing key matched against queue binding patterns.
    pub routing_key: String,

    /// JSON document delivered as the POST body.
    pub body: serde_json::Value,

    /// Optional JSON headers, stored alongside the message.
    pub headers: Option<serde_json::Value>,

    /// When the message becomes leasable.
    pub visibility: Visibility,
}

impl NewMessage {
    /// Creates an immediately-visible message with no headers.
    pub fn new(id: MessageId, routing_key: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id,
            routing_key: routing_key.into(),
            body,
            headers: None,
            visibility: Visibility::Immediate,
        }
    }

    /// Sets the message headers.
    #[must_use]
    pub fn with_headers(mut self, headers: serde_json::Value) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Sets the visibility.
    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }
}
