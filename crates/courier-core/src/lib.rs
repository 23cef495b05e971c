//! Core domain models, routing, and storage for the courier broker.
//!
//! Provides strongly-typed identifiers, the binding-pattern matcher used to
//! fan published messages onto queues, the clock abstraction, and the
//! PostgreSQL repository layer every other crate builds on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod pattern;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    DeadLetter, Delivery, DeliveryState, LeasedDelivery, Message, MessageId, NewMessage, Queue,
    QueueId, Visibility, Worker, WorkerId,
};
pub use time::{Clock, RealClock};
