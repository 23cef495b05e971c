//! Dispatch engine for the courier broker.
//!
//! Drives per-queue delivery with at-least-once semantics over PostgreSQL
//! `FOR UPDATE SKIP LOCKED` leasing:
//!
//! ```text
//!                      ┌──────────────────────────────────────┐
//!                      │              PostgreSQL              │
//!                      │  ┌────────────────────────────────┐  │
//!                      │  │        deliveries table        │  │
//!                      │  │   FOR UPDATE SKIP LOCKED lease │  │
//!                      │  └────────────────────────────────┘  │
//!                      └──────────────────────────────────────┘
//!                                        │
//!                            one ticker task per queue
//!                                        │
//!                      ┌─────────────────┼─────────────────┐
//!                      ▼                 ▼                 ▼
//!               ┌────────────┐    ┌────────────┐    ┌────────────┐
//!               │ Dispatcher │    │ Dispatcher │    │ Dispatcher │
//!               │  tick(Q1)  │    │  tick(Q2)  │    │  tick(Qn)  │
//!               └────────────┘    └────────────┘    └────────────┘
//!                      │                 │                 │
//!                      ▼                 ▼                 ▼
//!               ┌────────────┐    ┌────────────┐    ┌────────────┐
//!               │  Worker A  │    │  Worker B  │    │  Worker N  │
//!               │  endpoint  │    │  endpoint  │    │  endpoint  │
//!               └────────────┘    └────────────┘    └────────────┘
//! ```
//!
//! Each tick leases at most the worker's configured requests-per-second,
//! which at the nominal one-tick-per-second cadence is the rate limit.
//! Any number of engine processes may share one store; the lease protocol
//! keeps them from ever sharing a row.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod scheduler;

pub use admin::Admin;
pub use client::{AttemptOutcome, ClientConfig, WorkerClient, SYNTHETIC_FAILURE_STATUS};
pub use config::Config;
pub use dispatcher::{DispatchConfig, Dispatcher, EngineStats, Resolution, TickSummary};
pub use error::{DispatchError, Result};
pub use scheduler::Scheduler;

/// Default seconds a lease may be held before it is considered abandoned.
pub const DEFAULT_LEASE_TIMEOUT_SECONDS: u64 = 60;

/// Default per-request HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 30;

/// Default milliseconds between dispatch ticks per queue.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
