//! Shared fixtures: a fully wired in-memory stack with a scripted engine.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;

use tollgate_core::{InMemoryAdvisoryLock, ModelId, ModelVersionId, UserId};
use tollgate_flow::billing::BillingService;
use tollgate_flow::catalog::{InMemoryModelCatalog, ModelCatalog, ModelInfo};
use tollgate_flow::config::LaneCapacities;
use tollgate_flow::dispatch::JobQueue;
use tollgate_flow::dispatch::memory::InMemoryJobQueue;
use tollgate_flow::dispatcher::PriorityDispatcher;
use tollgate_flow::error::Result;
use tollgate_flow::inference::{InferenceEngine, InferenceError};
use tollgate_flow::ledger::Ledger;
use tollgate_flow::ledger::memory::InMemoryLedgerStore;
use tollgate_flow::pricing::PricingService;
use tollgate_flow::reaper::ReservationReaper;
use tollgate_flow::reservation::ReservationManager;
use tollgate_flow::service::{CreateTaskRequest, Requester, TaskService};
use tollgate_flow::store::lifecycle::TaskLifecycle;
use tollgate_flow::store::memory::InMemoryTaskStore;
use tollgate_flow::task::{Payload, TaskInput};
use tollgate_flow::worker::{JobOutcome, Worker};

/// Inference engine that replays a script of failures, then succeeds.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<std::result::Result<(), InferenceError>>>,
    calls: Mutex<usize>,
}

impl ScriptedEngine {
    pub fn fail_next(&self, err: InferenceError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    fn step(&self) -> std::result::Result<(), InferenceError> {
        *self.calls.lock().unwrap() += 1;
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

fn classify(item: &Payload) -> Payload {
    let mut out = item.clone();
    out.insert("label".into(), "positive".into());
    out
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn predict(
        &self,
        _model_id: &ModelId,
        _version_id: Option<&ModelVersionId>,
        payload: &Payload,
    ) -> std::result::Result<Payload, InferenceError> {
        self.step().map(|()| classify(payload))
    }

    async fn batch_predict(
        &self,
        _model_id: &ModelId,
        _version_id: Option<&ModelVersionId>,
        items: &[Payload],
    ) -> std::result::Result<Vec<Payload>, InferenceError> {
        self.step()?;
        Ok(items.iter().map(classify).collect())
    }
}

/// Every component wired over in-memory stores.
pub struct Stack {
    pub user: UserId,
    pub model: ModelInfo,
    pub ledger: Ledger,
    pub reservations: ReservationManager,
    pub lifecycle: TaskLifecycle,
    pub queue: Arc<InMemoryJobQueue>,
    pub dispatcher: Arc<PriorityDispatcher>,
    pub engine: Arc<ScriptedEngine>,
    pub service: TaskService,
    pub billing: BillingService,
    pub worker: Worker,
}

impl Stack {
    pub fn new(balance: Decimal, price: Decimal) -> Self {
        Self::with_capacities(balance, price, LaneCapacities::default())
    }

    pub fn with_capacities(balance: Decimal, price: Decimal, capacities: LaneCapacities) -> Self {
        Self::with_limits(balance, price, capacities, 1000)
    }

    pub fn with_limits(
        balance: Decimal,
        price: Decimal,
        capacities: LaneCapacities,
        user_limit: usize,
    ) -> Self {
        let user = UserId::generate();
        let model = ModelInfo::new("sentiment", price);
        let catalog: Arc<dyn ModelCatalog> =
            Arc::new(InMemoryModelCatalog::new().with_model(model.clone()));
        let ledger = Ledger::new(Arc::new(
            InMemoryLedgerStore::new().with_account(user, balance),
        ));
        let reservations =
            ReservationManager::new(ledger.clone(), Arc::new(InMemoryAdvisoryLock::new()));
        let tasks = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryJobQueue::new("ml"));
        let dispatcher = Arc::new(PriorityDispatcher::with_limits(
            queue.clone(),
            tasks.clone(),
            capacities,
            user_limit,
        ));
        let lifecycle = TaskLifecycle::new(tasks);
        let pricing = PricingService::new(catalog.clone());
        let engine = Arc::new(ScriptedEngine::default());

        let service = TaskService::new(
            catalog,
            pricing.clone(),
            reservations.clone(),
            lifecycle.clone(),
            dispatcher.clone(),
        );
        let billing = BillingService::new(reservations.clone(), pricing.clone());
        let worker = Worker::new(
            lifecycle.clone(),
            reservations.clone(),
            dispatcher.clone(),
            pricing,
            engine.clone(),
        );

        Self {
            user,
            model,
            ledger,
            reservations,
            lifecycle,
            queue,
            dispatcher,
            engine,
            service,
            billing,
            worker,
        }
    }

    pub fn owner(&self) -> Requester {
        Requester::user(self.user)
    }

    pub fn reaper(&self) -> ReservationReaper {
        ReservationReaper::new(self.reservations.clone())
    }

    pub fn single(&self, text: &str) -> CreateTaskRequest {
        CreateTaskRequest::new(self.user, self.model.id, TaskInput::Single(payload(text)))
    }

    /// Handles the next visible job, if any.
    pub async fn work_once(&self) -> Result<Option<JobOutcome>> {
        let Some(received) = self.queue.receive().await? else {
            return Ok(None);
        };
        self.worker.handle(&received.descriptor).await.map(Some)
    }

    /// Handles visible jobs until the queue has none left.
    pub async fn drain(&self) -> Result<Vec<JobOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.work_once().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

pub fn payload(text: &str) -> Payload {
    let mut p = Payload::new();
    p.insert("text".into(), text.into());
    p
}
