//! Assembly of the full service stack from configuration.
//!
//! [`Tollgate`] is the composition root: it wires the ledger, reservations,
//! dispatcher, services and worker pool over a set of [`Backends`], with
//! every tunable taken from one [`FlowConfig`].

use std::sync::Arc;

use tollgate_core::{AdvisoryLock, InMemoryAdvisoryLock};

use crate::billing::BillingService;
use crate::catalog::ModelCatalog;
use crate::config::FlowConfig;
use crate::dispatch::JobQueue;
use crate::dispatch::memory::InMemoryJobQueue;
use crate::dispatcher::PriorityDispatcher;
use crate::error::Result;
use crate::inference::InferenceEngine;
use crate::ledger::memory::InMemoryLedgerStore;
use crate::ledger::{Ledger, LedgerStore};
use crate::pricing::PricingService;
use crate::reaper::ReservationReaper;
use crate::reservation::ReservationManager;
use crate::runtime::{Runtime, WorkerPool};
use crate::service::TaskService;
use crate::store::TaskStore;
use crate::store::lifecycle::TaskLifecycle;
use crate::store::memory::InMemoryTaskStore;
use crate::worker::Worker;

/// Storage, queue and collaborator implementations.
#[derive(Clone)]
pub struct Backends {
    /// Ledger entries and balances.
    pub ledger: Arc<dyn LedgerStore>,
    /// Task records.
    pub tasks: Arc<dyn TaskStore>,
    /// Job transport.
    pub queue: Arc<dyn JobQueue>,
    /// Per-user advisory lock.
    pub lock: Arc<dyn AdvisoryLock>,
    /// Model metadata.
    pub catalog: Arc<dyn ModelCatalog>,
    /// Inference backend.
    pub engine: Arc<dyn InferenceEngine>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("queue", &self.queue.queue_name())
            .finish_non_exhaustive()
    }
}

impl Backends {
    /// In-memory stores, queue and lock around the given catalog and engine.
    #[must_use]
    pub fn in_memory(catalog: Arc<dyn ModelCatalog>, engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            ledger: Arc::new(InMemoryLedgerStore::new()),
            tasks: Arc::new(InMemoryTaskStore::new()),
            queue: Arc::new(InMemoryJobQueue::new("ml")),
            lock: Arc::new(InMemoryAdvisoryLock::new()),
            catalog,
            engine,
        }
    }
}

/// The wired service stack.
#[derive(Debug, Clone)]
pub struct Tollgate {
    config: FlowConfig,
    ledger: Ledger,
    billing: BillingService,
    tasks: TaskService,
    dispatcher: Arc<PriorityDispatcher>,
    pool: WorkerPool,
    reaper: ReservationReaper,
}

impl Tollgate {
    /// Wires every component.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Configuration`] if `config` is invalid.
    pub fn new(config: FlowConfig, backends: Backends) -> Result<Self> {
        config.validate()?;

        let ledger = Ledger::new(backends.ledger);
        let reservations = ReservationManager::new(ledger.clone(), backends.lock.clone())
            .with_lock_ttl(config.lock_ttl);
        let pricing = PricingService::new(backends.catalog.clone())
            .with_base_discount(config.base_discount_percent);
        let dispatcher = Arc::new(
            PriorityDispatcher::from_config(backends.queue.clone(), backends.tasks.clone(), &config)
                .with_admission_lock(backends.lock.clone()),
        );
        let lifecycle = TaskLifecycle::new(backends.tasks);

        let billing = BillingService::new(reservations.clone(), pricing.clone());
        let tasks = TaskService::new(
            backends.catalog,
            pricing.clone(),
            reservations.clone(),
            lifecycle.clone(),
            dispatcher.clone(),
        )
        .with_max_batch_size(config.max_batch_size);
        let worker = Worker::new(
            lifecycle,
            reservations.clone(),
            dispatcher.clone(),
            pricing,
            backends.engine,
        )
        .with_chunk_size(config.batch_chunk_size);

        tracing::info!(
            workers = config.worker_concurrency,
            user_task_limit = config.user_task_limit,
            "tollgate stack wired"
        );
        Ok(Self {
            pool: WorkerPool::new(worker, backends.queue),
            reaper: ReservationReaper::new(reservations),
            config,
            ledger,
            billing,
            tasks,
            dispatcher,
        })
    }

    /// Wires the stack from `TOLLGATE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Configuration`] for invalid variables.
    pub fn from_env(backends: Backends) -> Result<Self> {
        Self::new(FlowConfig::from_env()?, backends)
    }

    /// Installs the global subscriber in the configured format.
    pub fn init_logging(&self) {
        tollgate_core::init_logging(self.config.log_format());
    }

    /// Spawns the worker loops and the reaper.
    #[must_use]
    pub fn start(&self) -> Runtime {
        Runtime::from_config(self.pool.clone(), self.reaper.clone(), &self.config)
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// The ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Billing operations.
    #[must_use]
    pub const fn billing(&self) -> &BillingService {
        &self.billing
    }

    /// Task operations.
    #[must_use]
    pub const fn tasks(&self) -> &TaskService {
        &self.tasks
    }

    /// The priority dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &PriorityDispatcher {
        &self.dispatcher
    }

    /// The worker pool, for polling without spawning loops.
    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
