//! Job engine: durable, priority-ordered, at-least-once execution.
//!
//! # Architecture
//!
//! ```text
//! Producers (routes, webhook intake, handlers, scheduler)
//!     │
//!     └─► JobQueue.enqueue(NewJob)        validation + idempotency dedup
//!             └─► jobs table (Postgres)
//!
//! JobRunner (any number of processes)
//!     │
//!     ├─► Claim per tenant (FOR UPDATE SKIP LOCKED + lease reclaim)
//!     ├─► Execute via JobRegistry (typed payload + cancellation + timeout)
//!     └─► CAS terminal transition + audit + tenant stream event
//! ```
//!
//! Ordering within a tenant is `(priority ASC, scheduled_at ASC)` at claim
//! time only; execution is concurrent. Callers needing per-entity
//! serialization encode it into their idempotency keys.

pub mod handlers;
mod job;
mod queue;
mod registry;
mod runner;

pub use job::{Job, JobStatus, QueueDepth};
pub use queue::{retry_backoff, EnqueueResult, JobQueue, NewJob, PostgresJobQueue};
pub use registry::{JobContext, JobOutcome, JobRegistry, SharedJobRegistry};
pub use runner::{JobRunner, JobRunnerConfig};
