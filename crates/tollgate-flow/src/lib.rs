//! # tollgate-flow
//!
//! Asynchronous task execution and billing reservations for the Tollgate
//! metered inference API.
//!
//! This crate implements the paid execution path:
//!
//! - **Ledger**: Append-only funds movements whose completed entries define
//!   each user's balance
//! - **Reservations**: Per-user locked holds that are settled on success and
//!   rolled back on failure
//! - **Priority Dispatch**: Bounded low/normal/high lanes with per-user limits
//!   and wait estimates
//! - **Workers**: Inference execution with retry backoff, batch chunking and
//!   progress reporting
//! - **Reaper**: Periodic rollback of reservations abandoned by crashed workers
//! - **Reports**: Daily ledger totals plus per-user transaction and usage
//!   reports rendered as JSON or CSV
//!
//! ## Core Concepts
//!
//! - **Task**: One single or batch prediction request, moving
//!   `pending -> processing -> completed | failed`
//! - **Reservation**: A pending charge entry that holds funds for one task
//! - **Lane**: The dispatch queue for one priority
//!
//! ## Guarantees
//!
//! - **No double spend**: Debits are checked against the balance minus
//!   pending debits under the user's lock
//! - **One charge per task**: Retries reuse the task's reservation
//! - **No orphaned holds**: Every reservation ends settled, rolled back or
//!   cancelled, if need be by the reaper
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use rust_decimal_macros::dec;
//! use tollgate_core::{InMemoryAdvisoryLock, TaskId, UserId};
//! use tollgate_flow::ledger::Ledger;
//! use tollgate_flow::ledger::memory::InMemoryLedgerStore;
//! use tollgate_flow::reservation::ReservationManager;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tollgate_flow::error::Result<()> {
//! let user = UserId::generate();
//! let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new().with_account(user, dec!(100))));
//! let reservations = ReservationManager::new(ledger.clone(), Arc::new(InMemoryAdvisoryLock::new()));
//!
//! let hold = reservations.reserve(&user, dec!(30), &TaskId::generate()).await?;
//! assert_eq!(ledger.available_balance(&user).await?, dec!(70));
//!
//! reservations.settle(&hold.id).await?;
//! assert_eq!(ledger.balance(&user).await?, dec!(70));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod app;
pub mod billing;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod inference;
pub mod ledger;
pub mod metrics;
pub mod pricing;
pub mod reaper;
pub mod report;
pub mod reservation;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod store;
pub mod task;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::app::{Backends, Tollgate};
    pub use crate::billing::BillingService;
    pub use crate::catalog::{InMemoryModelCatalog, ModelCatalog, ModelInfo};
    pub use crate::config::{FlowConfig, LaneCapacities};
    pub use crate::dispatch::{JobDescriptor, JobQueue, SubmitOptions, SubmitResult};
    pub use crate::dispatcher::PriorityDispatcher;
    pub use crate::error::{Error, Result};
    pub use crate::inference::{InferenceEngine, InferenceError};
    pub use crate::ledger::{EntryKind, EntryStatus, Ledger, LedgerEntry, LedgerStore};
    pub use crate::metrics::FlowMetrics;
    pub use crate::pricing::{CostBreakdown, PricingService};
    pub use crate::reaper::ReservationReaper;
    pub use crate::report::{
        LedgerReport, ReportFormat, ReportPeriod, TransactionReport, UsageReport,
    };
    pub use crate::reservation::ReservationManager;
    pub use crate::retry::RetryPolicy;
    pub use crate::runtime::{Runtime, WorkerPool};
    pub use crate::service::{CreateTaskRequest, Requester, TaskService};
    pub use crate::store::lifecycle::TaskLifecycle;
    pub use crate::store::{CasResult, TaskStore};
    pub use crate::task::{Payload, Priority, Task, TaskInput, TaskStatus};
    pub use crate::worker::{JobOutcome, Worker};
}
