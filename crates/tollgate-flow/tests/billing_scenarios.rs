//! End-to-end billing scenarios over the in-memory stack.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::Stack;
use tollgate_core::{InMemoryAdvisoryLock, TaskId, UserId};
use tollgate_flow::error::{Error, Result};
use tollgate_flow::ledger::memory::InMemoryLedgerStore;
use tollgate_flow::ledger::{EntryFilter, EntryKind, EntryStatus, Ledger};
use tollgate_flow::reservation::ReservationManager;
use tollgate_flow::worker::JobOutcome;

#[tokio::test]
async fn reserve_then_settle_moves_balance_once() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(30));

    let entry = stack
        .reservations
        .reserve(&stack.user, dec!(30), &TaskId::generate())
        .await?;
    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(100));
    assert_eq!(stack.ledger.available_balance(&stack.user).await?, dec!(70));

    let settled = stack.reservations.settle(&entry.id).await?;
    assert_eq!(settled.status, EntryStatus::Completed);
    assert!(settled.completed_at.is_some());
    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(70));
    assert_eq!(stack.ledger.available_balance(&stack.user).await?, dec!(70));

    let err = stack.reservations.settle(&entry.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(70));
    Ok(())
}

#[tokio::test]
async fn sequential_reservations_cannot_double_spend() -> Result<()> {
    let stack = Stack::new(dec!(50), dec!(30));

    stack
        .reservations
        .reserve(&stack.user, dec!(30), &TaskId::generate())
        .await?;
    let err = stack
        .reservations
        .reserve(&stack.user, dec!(30), &TaskId::generate())
        .await
        .unwrap_err();
    match err {
        Error::InsufficientFunds {
            available,
            required,
            ..
        } => {
            assert_eq!(available, dec!(20));
            assert_eq!(required, dec!(30));
        }
        other => panic!("expected insufficient funds, got {other}"),
    }

    let err = stack.billing.withdraw(&stack.user, dec!(21)).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_overdraw() -> Result<()> {
    let user = UserId::generate();
    let ledger = Ledger::new(Arc::new(
        InMemoryLedgerStore::new().with_account(user, dec!(50)),
    ));
    let reservations = ReservationManager::new(ledger.clone(), Arc::new(InMemoryAdvisoryLock::new()));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let reservations = reservations.clone();
            tokio::spawn(async move {
                reservations
                    .reserve(&user, dec!(10), &TaskId::generate())
                    .await
            })
        })
        .collect();

    let mut reserved = Decimal::ZERO;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(entry) => reserved += entry.amount.abs(),
            Err(Error::InsufficientFunds { .. } | Error::ConcurrentModification { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert!(reserved <= dec!(50));
    assert!(reserved > Decimal::ZERO);
    let available = ledger.available_balance(&user).await?;
    assert_eq!(available, dec!(50) - reserved);
    assert!(available >= Decimal::ZERO);
    Ok(())
}

#[tokio::test]
async fn rollback_is_not_repeatable() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(30));
    let entry = stack
        .reservations
        .reserve(&stack.user, dec!(40), &TaskId::generate())
        .await?;

    let failed = stack.reservations.rollback(&entry.id, "worker crashed").await?;
    assert_eq!(failed.status, EntryStatus::Failed);
    assert!(failed.description.as_deref().unwrap_or_default().contains("worker crashed"));

    let err = stack
        .reservations
        .rollback(&entry.id, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    assert_eq!(stack.ledger.balance(&stack.user).await?, dec!(100));
    assert_eq!(stack.ledger.available_balance(&stack.user).await?, dec!(100));
    Ok(())
}

#[tokio::test]
async fn completed_task_charge_can_be_refunded_once() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(10));
    let created = stack.service.create_task(stack.single("great product")).await?;

    let outcomes = stack.drain().await?;
    assert_eq!(
        outcomes,
        vec![JobOutcome::Completed {
            task_id: created.task.id
        }]
    );
    assert_eq!(stack.billing.get_balance(&stack.user).await?, dec!(90));

    let charge_id = created.task.reservation_id.expect("billed task has a reservation");
    let refund = stack.billing.refund(&charge_id, "customer complaint").await?;
    assert_eq!(refund.kind, EntryKind::Refund);
    assert_eq!(refund.reference_task_id, Some(created.task.id));
    assert_eq!(stack.billing.get_balance(&stack.user).await?, dec!(100));

    let err = stack.billing.refund(&charge_id, "twice").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(stack.billing.get_balance(&stack.user).await?, dec!(100));

    let filter = EntryFilter {
        kind: Some(EntryKind::Charge),
        status: Some(EntryStatus::Completed),
    };
    let charges = stack
        .billing
        .get_transactions(&stack.user, &filter, None)
        .await?;
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].amount, dec!(-10));
    Ok(())
}

#[tokio::test]
async fn pending_reservation_blocks_withdrawal_until_released() -> Result<()> {
    let stack = Stack::new(dec!(100), dec!(60));
    let created = stack.service.create_task(stack.single("hold my funds")).await?;

    let err = stack.billing.withdraw(&stack.user, dec!(50)).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds { .. }));

    stack
        .service
        .cancel_task(&created.task.id, &stack.owner())
        .await?;
    let (_, balance) = stack.billing.withdraw(&stack.user, dec!(50)).await?;
    assert_eq!(balance, dec!(50));
    Ok(())
}
