//! Ledger summaries and per-user reports.
//!
//! [`LedgerReport`] covers one UTC day across all accounts. The per-user
//! [`TransactionReport`] and [`UsageReport`] cover an inclusive date range and
//! render as JSON or CSV.

use std::collections::BTreeMap;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use tollgate_core::{EntryId, UserId};

use crate::error::{Error, Result};
use crate::ledger::{EntryKind, EntryStatus, Ledger, LedgerEntry};
use crate::store::TaskStore;
use crate::task::TaskStatus;

/// Output format of a rendered report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Pretty-printed JSON of the whole report.
    #[default]
    Json,
    /// A header line plus one line per row. No rows renders as empty.
    Csv,
}

impl ReportFormat {
    /// Returns the lowercase format name.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(Error::validation(format!(
                "unsupported report format '{other}'"
            ))),
        }
    }
}

/// Inclusive date range covered by a per-user report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportPeriod {
    /// First day covered.
    pub start: NaiveDate,
    /// Last day covered.
    pub end: NaiveDate,
}

impl ReportPeriod {
    /// Creates a period.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::validation(format!(
                "report period starts after it ends: {start} > {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Returns true if `at` falls on a day in the period (UTC).
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let day = at.date_naive();
        self.start <= day && day <= self.end
    }

    /// Half-open instant bounds `[start 00:00, end + 1 day 00:00)`.
    fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let from = self.start.and_time(NaiveTime::MIN).and_utc();
        let to = self
            .end
            .and_time(NaiveTime::MIN)
            .and_utc()
            .checked_add_days(Days::new(1))
            .ok_or_else(|| Error::validation(format!("date out of range: {}", self.end)))?;
        Ok((from, to))
    }
}

/// One ledger entry as it appears in a transaction report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRow {
    /// Entry ID.
    pub id: EntryId,
    /// Kind of movement.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Signed amount.
    pub amount: Decimal,
    /// Entry status.
    pub status: EntryStatus,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
    /// When the entry left pending, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-text note.
    pub description: Option<String>,
}

impl From<&LedgerEntry> for TransactionRow {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id,
            kind: entry.kind,
            amount: entry.amount,
            status: entry.status,
            created_at: entry.created_at,
            completed_at: entry.completed_at,
            description: entry.description.clone(),
        }
    }
}

/// A user's ledger entries over a period, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionReport {
    /// Account owner.
    pub user_id: UserId,
    /// Days covered.
    pub period: ReportPeriod,
    /// Number of rows.
    pub transaction_count: usize,
    /// The entries.
    pub transactions: Vec<TransactionRow>,
}

impl TransactionReport {
    /// Collects `user_id`'s entries created within `period`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger store fails.
    pub async fn for_user(
        ledger: &Ledger,
        user_id: &UserId,
        period: ReportPeriod,
    ) -> Result<Self> {
        let (from, to) = period.bounds()?;
        let transactions: Vec<TransactionRow> = ledger
            .entries_between(from, to)
            .await?
            .iter()
            .filter(|e| e.user_id == *user_id)
            .map(TransactionRow::from)
            .collect();

        tracing::debug!(%user_id, start = %period.start, end = %period.end, rows = transactions.len(), "built transaction report");
        Ok(Self {
            user_id: *user_id,
            period,
            transaction_count: transactions.len(),
            transactions,
        })
    }

    /// Renders the report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn render(&self, format: ReportFormat) -> Result<String> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Csv => rows_to_csv(&self.transactions),
        }
    }
}

/// Call counts for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    /// Model the calls went to.
    pub model_id: String,
    /// Tasks created.
    pub total_calls: usize,
    /// Tasks that completed.
    pub successful_calls: usize,
    /// Tasks that failed, cancellations included.
    pub failed_calls: usize,
    /// Completed over total, as a percentage with two decimals.
    pub success_rate: Decimal,
}

impl ModelUsage {
    fn new(model_id: String) -> Self {
        Self {
            model_id,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            success_rate: Decimal::ZERO,
        }
    }
}

/// A user's task counts per model over a period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    /// Task owner.
    pub user_id: UserId,
    /// Days covered.
    pub period: ReportPeriod,
    /// Number of models used.
    pub model_count: usize,
    /// Tasks created across all models.
    pub total_usage: usize,
    /// Per-model counts, ordered by model ID.
    pub models: Vec<ModelUsage>,
}

impl UsageReport {
    /// Counts `user_id`'s tasks created within `period`, grouped by model.
    ///
    /// Pending and processing tasks count toward the total only.
    ///
    /// # Errors
    ///
    /// Returns an error if the task store fails.
    pub async fn for_user(
        tasks: &dyn TaskStore,
        user_id: &UserId,
        period: ReportPeriod,
    ) -> Result<Self> {
        let page = tasks.list_for_user(user_id, None, 0, usize::MAX).await?;

        let mut by_model: BTreeMap<String, ModelUsage> = BTreeMap::new();
        for task in page.tasks.iter().filter(|t| period.contains(t.created_at)) {
            let key = task.model_id.to_string();
            let usage = by_model
                .entry(key.clone())
                .or_insert_with(|| ModelUsage::new(key));
            usage.total_calls += 1;
            match task.status {
                TaskStatus::Completed => usage.successful_calls += 1,
                TaskStatus::Failed => usage.failed_calls += 1,
                TaskStatus::Pending | TaskStatus::Processing => {}
            }
        }

        let models: Vec<ModelUsage> = by_model
            .into_values()
            .map(|mut usage| {
                usage.success_rate = success_rate(usage.successful_calls, usage.total_calls);
                usage
            })
            .collect();
        let total_usage = models.iter().map(|m| m.total_calls).sum();

        tracing::debug!(%user_id, start = %period.start, end = %period.end, models = models.len(), total_usage, "built usage report");
        Ok(Self {
            user_id: *user_id,
            period,
            model_count: models.len(),
            total_usage,
            models,
        })
    }

    /// Renders the report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn render(&self, format: ReportFormat) -> Result<String> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Csv => rows_to_csv(&self.models),
        }
    }
}

fn success_rate(successful: usize, total: usize) -> Decimal {
    if total == 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(successful) * Decimal::ONE_HUNDRED / Decimal::from(total)).round_dp(2)
}

fn rows_to_csv<T: Serialize>(rows: &[T]) -> Result<String> {
    if rows.is_empty() {
        return Ok(String::new());
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    let bytes = writer.into_inner().map_err(|e| Error::Serialization {
        message: e.to_string(),
    })?;
    String::from_utf8(bytes).map_err(|e| Error::Serialization {
        message: e.to_string(),
    })
}

/// Completed totals for one entry kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindTotal {
    /// Number of completed entries.
    pub count: usize,
    /// Sum of absolute amounts.
    pub amount: Decimal,
}

/// Summary of one UTC day of ledger activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerReport {
    /// The day covered.
    pub date: NaiveDate,
    /// Completed entries by kind.
    pub completed: BTreeMap<String, KindTotal>,
    /// Entries still pending.
    pub pending_count: usize,
    /// Entries that failed.
    pub failed_count: usize,
    /// Entries cancelled by users.
    pub cancelled_count: usize,
    /// Completed charges minus completed refunds.
    pub net_revenue: Decimal,
}

impl LedgerReport {
    /// Builds the report for entries created on `date` (UTC).
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger store fails.
    pub async fn for_day(ledger: &Ledger, date: NaiveDate) -> Result<Self> {
        let (from, to) = ReportPeriod { start: date, end: date }.bounds()?;
        let entries = ledger.entries_between(from, to).await?;

        let mut report = Self {
            date,
            completed: BTreeMap::new(),
            pending_count: 0,
            failed_count: 0,
            cancelled_count: 0,
            net_revenue: Decimal::ZERO,
        };
        for entry in &entries {
            match entry.status {
                EntryStatus::Completed => {
                    let total = report
                        .completed
                        .entry(entry.kind.to_string())
                        .or_default();
                    total.count += 1;
                    total.amount += entry.amount.abs();
                }
                EntryStatus::Pending => report.pending_count += 1,
                EntryStatus::Failed => report.failed_count += 1,
                EntryStatus::Cancelled => report.cancelled_count += 1,
            }
        }
        report.net_revenue =
            report.total(EntryKind::Charge).amount - report.total(EntryKind::Refund).amount;

        tracing::debug!(%date, entries = entries.len(), net_revenue = %report.net_revenue, "built ledger report");
        Ok(report)
    }

    /// Completed totals for `kind`, zero if none.
    #[must_use]
    pub fn total(&self, kind: EntryKind) -> KindTotal {
        self.completed
            .get(kind.as_label())
            .copied()
            .unwrap_or_default()
    }
}
