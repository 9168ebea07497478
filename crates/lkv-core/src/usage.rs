use crate::error::{Error, Result};
use crate::keymanager::{validate_provider, validate_user_id};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Costs are accumulated in integer micro-dollars so sums are exact and
/// independent of aggregation order.
const MICROS_PER_USD: f64 = 1_000_000.0;

// ---------------------------------------------------------------------------
// Records & aggregates
// ---------------------------------------------------------------------------

/// One completed provider call. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub provider: String,
    pub tokens: u64,
    pub cost_micros: u64,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// Cost in USD.
    pub fn cost(&self) -> f64 {
        micros_to_usd(self.cost_micros)
    }
}

/// Selects records for aggregation. The time window is half-open: `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageFilter {
    pub user_id: Option<String>,
    pub provider: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UsageFilter {
    pub fn matches(&self, record: &UsageRecord) -> bool {
        self.user_id.as_deref().is_none_or(|u| u == record.user_id)
            && self.provider.as_deref().is_none_or(|p| p == record.provider)
            && record.timestamp >= self.start
            && record.timestamp < self.end
    }
}

/// Running sums over a set of records. `merge` is associative and
/// commutative, so partial totals can be combined in any order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub requests: u64,
    pub tokens: u64,
    pub cost_micros: u64,
}

impl UsageTotals {
    pub fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        self.tokens = self.tokens.saturating_add(record.tokens);
        self.cost_micros = self.cost_micros.saturating_add(record.cost_micros);
    }

    pub fn merge(self, other: UsageTotals) -> UsageTotals {
        UsageTotals {
            requests: self.requests + other.requests,
            tokens: self.tokens.saturating_add(other.tokens),
            cost_micros: self.cost_micros.saturating_add(other.cost_micros),
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let mut totals = UsageTotals::default();
        for record in records {
            totals.add(record);
        }
        totals
    }
}

/// Usage report for one provider over one period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub provider: String,
    /// `None` when aggregated across all users.
    pub user_id: Option<String>,
    pub period: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_requests: u64,
    pub tokens_used: u64,
    /// Estimated cost in USD.
    pub estimated_cost: f64,
    pub estimated_cost_micros: u64,
}

// ---------------------------------------------------------------------------
// Period
// ---------------------------------------------------------------------------

/// A labelled half-open reporting window `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(label: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidPeriod(format!(
                "end ({}) is before start ({})",
                end, start
            )));
        }
        Ok(Self {
            label: label.into(),
            start,
            end,
        })
    }

    /// Calendar month in UTC, labelled `YYYY-MM`.
    pub fn month(year: i32, month: u32) -> Result<Self> {
        let invalid = || Error::InvalidPeriod(format!("{:04}-{:02} is not a valid month", year, month));
        let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let next = NaiveDate::from_ymd_opt(next_year, next_month, 1).ok_or_else(invalid)?;

        Self::new(
            format!("{:04}-{:02}", year, month),
            first.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc(),
            next.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc(),
        )
    }

    /// Parse a `YYYY-MM` label into its calendar month.
    pub fn parse_month(label: &str) -> Result<Self> {
        let invalid = || Error::InvalidPeriod(format!("'{}' is not in YYYY-MM format", label));
        let (year, month) = label.split_once('-').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::month(year, month)
    }

    /// The calendar month containing now.
    pub fn current_month() -> Result<Self> {
        let today = Utc::now().date_naive();
        Self::month(today.year(), today.month())
    }

    /// Rolling window of `days` days ending now.
    pub fn last_days(days: u32) -> Result<Self> {
        if days == 0 {
            return Err(Error::InvalidPeriod("window must span at least one day".to_string()));
        }
        let out_of_range = || Error::InvalidPeriod(format!("a {}-day window is out of range", days));
        let end = Utc::now();
        let start = Duration::try_days(i64::from(days))
            .and_then(|span| end.checked_sub_signed(span))
            .ok_or_else(out_of_range)?;
        Self::new(format!("last-{}d", days), start, end)
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

// ---------------------------------------------------------------------------
// UsageStore trait
// ---------------------------------------------------------------------------

/// Append-only persistence for usage records.
#[async_trait]
pub trait UsageStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn append(&self, record: &UsageRecord) -> Result<()>;

    async fn totals(&self, filter: &UsageFilter) -> Result<UsageTotals>;

    /// Distinct providers with at least one matching record. `filter.provider` is ignored.
    async fn providers(&self, filter: &UsageFilter) -> Result<BTreeSet<String>>;
}

// ---------------------------------------------------------------------------
// UsageTracker
// ---------------------------------------------------------------------------

/// Records provider calls and answers usage questions.
pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store,
            last_timestamp: Mutex::new(None),
        }
    }

    /// Append a usage record for a completed call.
    ///
    /// Zero tokens and zero cost are valid. Negative or non-finite values are
    /// rejected with [`Error::InvalidUsageValue`] before anything is written.
    pub async fn record(
        &self,
        user_id: &str,
        provider: &str,
        tokens: i64,
        cost: f64,
    ) -> Result<UsageRecord> {
        validate_user_id(user_id)?;
        validate_provider(provider)?;
        let tokens = u64::try_from(tokens).map_err(|_| Error::InvalidUsageValue {
            field: "tokens",
            value: tokens.to_string(),
        })?;
        let cost_micros = usd_to_micros(cost)?;

        let record = UsageRecord {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            tokens,
            cost_micros,
            timestamp: self.next_timestamp(),
        };
        self.store.append(&record).await?;

        debug!(
            user = user_id,
            provider,
            tokens,
            cost_micros,
            backend = self.store.backend_name(),
            "usage recorded"
        );
        Ok(record)
    }

    /// Aggregate usage for `provider` over `period`, for one user or (with
    /// `None`) across all users.
    pub async fn stats(
        &self,
        user_id: Option<&str>,
        provider: &str,
        period: &Period,
    ) -> Result<UsageStats> {
        if let Some(user_id) = user_id {
            validate_user_id(user_id)?;
        }
        validate_provider(provider)?;

        let filter = UsageFilter {
            user_id: user_id.map(str::to_string),
            provider: Some(provider.to_string()),
            start: period.start,
            end: period.end,
        };
        let totals = self.store.totals(&filter).await?;

        Ok(UsageStats {
            provider: provider.to_string(),
            user_id: filter.user_id,
            period: period.label.clone(),
            period_start: period.start,
            period_end: period.end,
            total_requests: totals.requests,
            tokens_used: totals.tokens,
            estimated_cost: micros_to_usd(totals.cost_micros),
            estimated_cost_micros: totals.cost_micros,
        })
    }

    /// Providers with recorded usage in `period`.
    pub async fn providers(&self, user_id: Option<&str>, period: &Period) -> Result<BTreeSet<String>> {
        let filter = UsageFilter {
            user_id: user_id.map(str::to_string),
            provider: None,
            start: period.start,
            end: period.end,
        };
        self.store.providers(&filter).await
    }

    /// Stamps never go backwards, even if the wall clock does.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let stamp = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn usd_to_micros(cost: f64) -> Result<u64> {
    let invalid = || Error::InvalidUsageValue {
        field: "cost",
        value: cost.to_string(),
    };
    if !cost.is_finite() || cost < 0.0 {
        return Err(invalid());
    }
    let micros = (cost * MICROS_PER_USD).round();
    if micros >= i64::MAX as f64 {
        return Err(invalid());
    }
    Ok(micros as u64)
}

fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Format USD as a dollar string (e.g. 13.5 → "$13.50").
pub fn format_cost(usd: f64) -> String {
    if !usd.is_finite() {
        return "$-.--".to_string();
    }
    format!("${:.2}", usd)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
