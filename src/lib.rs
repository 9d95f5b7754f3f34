//! Cooperative task runtime.
//!
//! `coflow` lets sequential-looking code suspend at explicit points, be
//! resumed later (possibly from another thread), yield intermediate values,
//! offload blocking work to a worker pool, and be canceled or dropped safely
//! even while a matching operation is in flight elsewhere. It is
//! infrastructure for building higher-level schedulers, not an application.
//!
//! Three subsystems, leaves first:
//!
//! - [`queue`]: a multi-producer, single-consumer-pop lock-free queue with
//!   segmented block storage and block recycling.
//! - [`pool`]: a fixed set of worker threads popping from the queue, and
//!   the cancellation-safe offload handshake ([`AsyncCall`]).
//! - [`task`]: the cooperative core, with [`UniqueTask`]/[`SharedTask`]
//!   handles over a resumable computation, the [`Co`] suspension scope, and
//!   the `break_if`/`cancel_if`/`wait_until` combinators.
//!
//! # Example
//!
//! ```
//! use coflow::{Status, UniqueTask};
//!
//! let task: UniqueTask<i32> = UniqueTask::new(|co| async move {
//!     co.suspend().await;
//!     42
//! });
//!
//! assert_eq!(task.status(), Status::Suspended);
//! task.resume(); // runs to the suspension point
//! task.resume(); // runs to completion
//! assert_eq!(task.status(), Status::Done);
//! assert_eq!(task.consume(), Some(42));
//! assert_eq!(task.consume(), None);
//! ```

#![warn(rust_2018_idioms)]

pub mod pool;
pub mod queue;
pub mod task;
pub mod util;

pub use pool::{AsyncCall, AsyncStatus, PoolConfig, PoolError, ThreadPool};
pub use queue::LockFreeQueue;
pub use task::{break_if, cancel_if, wait_until, Co, SharedTask, Status, UniqueTask};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
