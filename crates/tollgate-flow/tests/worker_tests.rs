//! Worker, reaper and task-service interplay.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use common::{Stack, payload};
use tollgate_flow::error::Result;
use tollgate_flow::inference::InferenceError;
use tollgate_flow::ledger::{EntryKind, EntryStatus};
use tollgate_flow::service::CreateTaskRequest;
use tollgate_flow::task::{TaskInput, TaskStatus};
use tollgate_flow::worker::JobOutcome;

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_and_charge_once() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(10));
    stack.engine.fail_next(InferenceError::failed("GPU out of memory"));
    stack.engine.fail_next(InferenceError::failed("GPU out of memory"));
    let created = stack.service.create_task(stack.single("retry me")).await?;
    let task_id = created.task.id;

    let first = stack.drain().await?;
    assert_eq!(
        first,
        vec![JobOutcome::Retrying {
            task_id,
            attempt: 2,
            delay: Duration::from_secs(30),
        }]
    );
    assert!(stack.drain().await?.is_empty());

    tokio::time::advance(Duration::from_secs(30)).await;
    let second = stack.drain().await?;
    assert!(matches!(second.as_slice(), [JobOutcome::Retrying { attempt: 3, .. }]));

    tokio::time::advance(Duration::from_secs(60)).await;
    let third = stack.drain().await?;
    assert_eq!(third, vec![JobOutcome::Completed { task_id }]);
    assert_eq!(stack.engine.calls(), 3);

    let task = stack.lifecycle.load(&task_id).await?;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt, 3);
    assert!(task.output.is_some());

    let history = stack.ledger.history(&stack.user, 10).await?;
    let charges: Vec<_> = history
        .iter()
        .filter(|e| e.kind == EntryKind::Charge)
        .collect();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].status, EntryStatus::Completed);
    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(90));
    assert_eq!(stack.dispatcher.lane_stats(task.priority).size, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_task_and_release_funds() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(10));
    for _ in 0..4 {
        stack.engine.fail_next(InferenceError::failed("backend unavailable"));
    }
    let created = stack.service.create_task(stack.single("doomed")).await?;

    let mut last = Vec::new();
    for _ in 0..4 {
        last = stack.drain().await?;
        tokio::time::advance(Duration::from_secs(600)).await;
    }
    assert!(matches!(last.as_slice(), [JobOutcome::Failed { .. }]));
    assert_eq!(stack.engine.calls(), 4);

    let task = stack.lifecycle.load(&created.task.id).await?;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("backend unavailable"));

    let entry = stack.ledger.entry(&created.task.reservation_id.unwrap()).await?;
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(100));
    assert_eq!(stack.ledger.available_balance(&stack.user).await?, dec!(100));
    Ok(())
}

#[tokio::test]
async fn invalid_input_fails_without_retry() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(10));
    stack.engine.fail_next(InferenceError::invalid_input("unsupported language"));
    let created = stack.service.create_task(stack.single("???")).await?;

    let outcomes = stack.drain().await?;
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Failed { .. }]));
    assert_eq!(stack.engine.calls(), 1);
    assert_eq!(
        stack.lifecycle.load(&created.task.id).await?.status,
        TaskStatus::Failed
    );
    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(100));
    Ok(())
}

#[tokio::test]
async fn reaper_rolls_back_abandoned_reservation() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(30));
    let created = stack.service.create_task(stack.single("never run")).await?;
    let entry_id = created.task.reservation_id.unwrap();
    assert_eq!(stack.ledger.available_balance(&stack.user).await?, dec!(70));

    let reaper = stack.reaper();
    let early = reaper
        .sweep_at(Utc::now() + chrono::Duration::minutes(10), Duration::from_secs(15 * 60))
        .await?;
    assert_eq!(early.rolled_back, 0);

    let report = reaper
        .sweep_at(Utc::now() + chrono::Duration::minutes(20), Duration::from_secs(15 * 60))
        .await?;
    assert_eq!(report.rolled_back, 1);

    let entry = stack.ledger.entry(&entry_id).await?;
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(100));
    assert_eq!(stack.ledger.available_balance(&stack.user).await?, dec!(100));

    // A late worker must not run unpaid work.
    let outcomes = stack.drain().await?;
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Failed { .. }]));
    assert_eq!(stack.engine.calls(), 0);
    assert_eq!(
        stack.lifecycle.load(&created.task.id).await?.status,
        TaskStatus::Failed
    );
    Ok(())
}

#[tokio::test]
async fn reservation_references_its_task() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(10));
    let created = stack.service.create_task(stack.single("link")).await?;

    let entry = stack
        .ledger
        .entry(&created.task.reservation_id.unwrap())
        .await?;
    assert_eq!(entry.kind, EntryKind::Charge);
    assert_eq!(entry.reference_task_id, Some(created.task.id));
    assert_eq!(entry.amount, -created.cost.discounted_cost);

    stack.drain().await?;
    let entry = stack.ledger.entry(&entry.id).await?;
    assert_eq!(entry.status, EntryStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn cancelled_task_is_never_run() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(10));
    let created = stack.service.create_task(stack.single("stop")).await?;

    let cancelled = stack
        .service
        .cancel_task(&created.task.id, &stack.owner())
        .await?;
    assert_eq!(cancelled.status, TaskStatus::Failed);

    assert!(stack.drain().await?.is_empty());
    assert_eq!(stack.engine.calls(), 0);

    let entry = stack
        .ledger
        .entry(&created.task.reservation_id.unwrap())
        .await?;
    assert_eq!(entry.status, EntryStatus::Cancelled);
    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(100));
    Ok(())
}

#[tokio::test]
async fn batch_reports_progress_and_partial_results() -> Result<()> {
    let stack = Stack::new(dec!(1000), dec!(10));
    stack.engine.fail_next(InferenceError::failed("chunk crashed"));
    let items = (0..25).map(|i| payload(&format!("review {i}"))).collect();
    let created = stack
        .service
        .create_task(CreateTaskRequest::new(
            stack.user,
            stack.model.id,
            TaskInput::Batch(items),
        ))
        .await?;
    assert_eq!(created.cost.breakdown.volume_discount, dec!(12.5));
    assert_eq!(created.cost.discounted_cost, dec!(237.5));

    let outcomes = stack.drain().await?;
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Completed { .. }]));

    let view = stack
        .service
        .task_status(&created.task.id, &stack.owner())
        .await?;
    assert_eq!(view.status, TaskStatus::Completed);
    let progress = view.progress.expect("batch progress is reported");
    assert_eq!((progress.current, progress.total), (25, 25));

    let output = view.output.unwrap();
    assert_eq!(output["total"], 25);
    assert_eq!(output["succeeded"], 15);
    assert_eq!(output["failed"], 10);
    assert_eq!(output["results"].as_array().unwrap().len(), 25);

    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(762.5));
    Ok(())
}

#[tokio::test]
async fn rerun_of_failed_task_is_billed_again() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(10));
    stack.engine.fail_next(InferenceError::invalid_input("bad"));
    let created = stack.service.create_task(stack.single("first try")).await?;
    stack.drain().await?;

    let rerun = stack
        .service
        .rerun_failed_task(&created.task.id, &stack.owner())
        .await?;
    let outcomes = stack.drain().await?;
    assert_eq!(
        outcomes,
        vec![JobOutcome::Completed {
            task_id: rerun.task.id
        }]
    );
    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(90));
    Ok(())
}
