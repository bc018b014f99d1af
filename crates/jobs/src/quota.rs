//! Plan tiers, billing periods and per-period usage records.

use core::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use productsnap_core::{DomainError, OwnerId};

/// Subscription tier of an owner.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Personal,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Personal => "personal",
            PlanTier::Pro => "pro",
        }
    }

    /// Paid tiers are dispatched from the priority lane.
    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }
}

impl core::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = DomainError;

    /// Accepts tier names as well as the billing provider's plan ids
    /// (`basic_monthly`, `pro_yearly`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanTier::Free),
            "personal" | "basic_monthly" | "basic_yearly" => Ok(PlanTier::Personal),
            "pro" | "pro_monthly" | "pro_yearly" => Ok(PlanTier::Pro),
            other => Err(DomainError::validation(format!("unknown plan tier: {other:?}"))),
        }
    }
}

/// Length of a quota period.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    Daily,
    Monthly,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Daily => "daily",
            PeriodKind::Monthly => "monthly",
        }
    }
}

impl FromStr for PeriodKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(PeriodKind::Daily),
            "monthly" => Ok(PeriodKind::Monthly),
            other => Err(DomainError::validation(format!("unknown period kind: {other:?}"))),
        }
    }
}

/// Admission allowance of one tier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimit {
    pub period_kind: PeriodKind,
    pub limit: u32,
    /// Unfinished jobs an owner may have at once; `None` means no cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_jobs: Option<u32>,
}

impl PlanLimit {
    pub fn daily(limit: u32) -> Self {
        Self {
            period_kind: PeriodKind::Daily,
            limit,
            concurrent_jobs: None,
        }
    }

    pub fn monthly(limit: u32) -> Self {
        Self {
            period_kind: PeriodKind::Monthly,
            limit,
            concurrent_jobs: None,
        }
    }

    pub fn with_concurrent_jobs(mut self, concurrent_jobs: u32) -> Self {
        self.concurrent_jobs = Some(concurrent_jobs);
        self
    }

    /// Whether an owner with `in_flight` unfinished jobs may start another.
    pub fn admits_concurrent(&self, in_flight: usize) -> bool {
        self.concurrent_jobs
            .is_none_or(|cap| in_flight < cap as usize)
    }
}

/// Tier -> allowance table published by billing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub free: PlanLimit,
    pub personal: PlanLimit,
    pub pro: PlanLimit,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            free: PlanLimit::daily(5).with_concurrent_jobs(1),
            personal: PlanLimit::monthly(100).with_concurrent_jobs(3),
            pro: PlanLimit::monthly(1000).with_concurrent_jobs(5),
        }
    }
}

impl PlanLimits {
    pub fn for_tier(&self, tier: PlanTier) -> PlanLimit {
        match tier {
            PlanTier::Free => self.free,
            PlanTier::Personal => self.personal,
            PlanTier::Pro => self.pro,
        }
    }
}

/// Half-open UTC window `[start, end)` of one billing period.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPeriod {
    pub kind: PeriodKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QuotaPeriod {
    /// The calendar day or month (UTC) containing `now`.
    pub fn containing(kind: PeriodKind, now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        let (start, end) = match kind {
            PeriodKind::Daily => (today, today.succ_opt().unwrap_or(NaiveDate::MAX)),
            PeriodKind::Monthly => {
                let first = today.with_day(1).unwrap_or(today);
                let next = first
                    .checked_add_months(Months::new(1))
                    .unwrap_or(NaiveDate::MAX);
                (first, next)
            }
        };
        Self {
            kind,
            start: midnight(start),
            end: midnight(end),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::default()).and_utc()
}

/// Usage of one owner within one period.
///
/// The limit is captured when the record is opened, so plan changes take
/// effect at the next rollover instead of retroactively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPeriodRecord {
    pub owner_id: OwnerId,
    pub plan_tier: PlanTier,
    pub period_kind: PeriodKind,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub usage_count: u32,
    pub limit: u32,
}

impl QuotaPeriodRecord {
    /// Open the record for the period containing `now`.
    pub fn open(owner_id: OwnerId, plan_tier: PlanTier, limit: PlanLimit, now: DateTime<Utc>) -> Self {
        let period = QuotaPeriod::containing(limit.period_kind, now);
        Self {
            owner_id,
            plan_tier,
            period_kind: limit.period_kind,
            period_start: period.start,
            period_end: period.end,
            usage_count: 0,
            limit: limit.limit,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.period_end
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.usage_count)
    }

    /// Debit one unit if the limit allows it.
    pub fn try_increment(&mut self) -> bool {
        if self.usage_count >= self.limit {
            return false;
        }
        self.usage_count += 1;
        true
    }

    /// Credit one unit back; never drops below zero.
    pub fn decrement(&mut self) {
        self.usage_count = self.usage_count.saturating_sub(1);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            period_kind: self.period_kind,
            usage_count: self.usage_count,
            limit: self.limit,
            remaining: self.remaining(),
            period_start: self.period_start,
            period_end: self.period_end,
        }
    }
}

/// Usage report for the owner's active period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub period_kind: PeriodKind,
    pub usage_count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}
