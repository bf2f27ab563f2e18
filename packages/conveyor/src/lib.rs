//! Conveyor: relational reliable messaging and coordination.
//!
//! Three intertwined primitives over a transactional row store:
//!
//! - a **transactional outbox**: work items written atomically with
//!   application data, drained by a dispatcher;
//! - a **deduplicating inbox**: idempotent receipt of externally-identified
//!   messages;
//! - a **fencing lease**: mutual exclusion with a monotone token and a loss
//!   signal.
//!
//! Layered on top: a **scheduler** (timers and cron jobs that materialize as
//! outbox messages at their due time), a **join** coordinator (N sibling
//! messages complete → one follow-up), and a **multi-tenant provider/router**
//! surface with static or discovery-refreshed tenant sets.
//!
//! # The shared state machine
//!
//! Outbox, inbox, timers, and job runs all move through the same work-queue
//! engine: `claim` (batch, `FOR UPDATE SKIP LOCKED`, FIFO) → `ack` /
//! `abandon` / `fail`, with lease-expiry reaping. Every post-claim mutation
//! is fenced on the claimer's owner token and silently skips rows the caller
//! no longer owns; duplicate acks, superseded workers, and reaped claims
//! are all benign.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use conveyor::{ConveyorBuilder, TenantConfig, NewMessage};
//!
//! let conveyor = ConveyorBuilder::new()
//!     .tenant(TenantConfig::new("acme", "postgres://localhost/acme"))
//!     .handler("orders.sync", Arc::new(SyncOrdersHandler))
//!     .build()?;
//! conveyor.deploy_schemas().await?;
//!
//! // Application code: write domain rows + outbox row in one transaction.
//! let outbox = conveyor.outboxes.get("acme").await?;
//! let mut tx = outbox.pool().begin().await?;
//! // ... domain writes ...
//! outbox.enqueue_in(&mut tx, NewMessage::new("orders.sync", payload)).await?;
//! tx.commit().await?;
//!
//! let running = conveyor.start();
//! // ...
//! running.stop().await;
//! ```

pub mod builder;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod inbox;
pub mod join;
pub mod lease;
pub mod outbox;
pub mod provider;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod schema;
pub mod service;

pub use builder::{Conveyor, ConveyorBuilder, RunningConveyor};
pub use cleanup::{CleanupService, ReaperService, SweepFn};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    DispatcherOptions, InboxOptions, JoinOptions, LeaseOptions, OutboxOptions, SchedulerOptions,
    TenantConfig, DEFAULT_SCHEMA,
};
pub use dispatch::{
    default_backoff, BackoffFn, DispatchContext, DispatchService, Dispatcher, HandlerResolver,
    OutboxHandler, RoundRobin, SelectionStrategy,
};
pub use error::{Error, Result};
pub use id::{
    DatabaseId, Id, InboxMessageId, InstanceId, JobRunId, JoinId, MessageId, OwnerToken, TimerId,
    WorkItemId,
};
pub use inbox::{InboxRecord, InboxRegistration, InboxStatus, InboxStore};
pub use join::{
    Join, JoinStatus, JoinStore, JoinWaitHandler, JoinWaitPayload, JOIN_WAIT_TOPIC,
};
pub use lease::{AcquireOutcome, Lease, LeaseStore};
pub use outbox::{NewMessage, OutboxMessage, OutboxStore, WorkStatus};
pub use provider::{
    ConfiguredProvider, Discovery, DynamicProvider, PoolCache, StaticDiscovery, StoreFactory,
    StoreProvider, UNKNOWN_STORE,
};
pub use router::{InboxRouter, JoinRouter, LeaseRouter, OutboxRouter, Router, SchedulerRouter};
pub use scheduler::{
    next_due_utc, CronJob, JobRunRow, ScheduleStatus, SchedulerService, SchedulerStore, TimerRow,
};
pub use service::{RunningServices, Service, ServiceHost};
