use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use productsnap_core::OwnerId;
use productsnap_jobs::{
    PeriodKind, PlanLimit, PlanTier, QuotaPeriod, QuotaPeriodRecord, UsageSnapshot,
};

/// Per-owner usage counters, one record per billing period.
///
/// `try_debit` is the only way usage grows and it is atomic: concurrent
/// callers against a period with `limit - usage = n` headroom see exactly `n`
/// successes.
#[async_trait]
pub trait QuotaLedger: Send + Sync + 'static {
    /// Check-and-increment the owner's active period, opening or rolling the
    /// period record when needed.
    async fn try_debit(
        &self,
        owner_id: OwnerId,
        plan_tier: PlanTier,
        limit: PlanLimit,
        now: DateTime<Utc>,
    ) -> Result<QuotaDebit, QuotaError>;

    /// Give back one unit to the owner's `period_kind` record starting at
    /// `period_start`. A daily and a monthly record may share a start, so
    /// both are needed to find the record that was debited.
    async fn credit(
        &self,
        owner_id: OwnerId,
        period_kind: PeriodKind,
        period_start: DateTime<Utc>,
    ) -> Result<(), QuotaError>;

    /// Usage of the period active at `now`. Reports an empty period when no
    /// record has been opened yet.
    async fn snapshot(
        &self,
        owner_id: OwnerId,
        plan_tier: PlanTier,
        limit: PlanLimit,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, QuotaError>;
}

/// A successful debit and the period it was charged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDebit {
    pub owner_id: OwnerId,
    pub period_kind: PeriodKind,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Usage after this debit.
    pub usage_count: u32,
    pub limit: u32,
}

impl QuotaDebit {
    /// The period this debit was charged to.
    pub fn period(&self) -> QuotaPeriod {
        QuotaPeriod {
            kind: self.period_kind,
            start: self.period_start,
            end: self.period_end,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QuotaError {
    #[error("quota exceeded: {limit} per {} period, resets at {period_end}", .period_kind.as_str())]
    Exceeded {
        limit: u32,
        period_kind: PeriodKind,
        period_end: DateTime<Utc>,
    },
    #[error("quota storage error: {0}")]
    Storage(String),
}

/// The record covering `now`, if one was opened.
fn active_record(
    records: &mut [QuotaPeriodRecord],
    now: DateTime<Utc>,
) -> Option<&mut QuotaPeriodRecord> {
    records
        .iter_mut()
        .rev()
        .find(|r| r.period_start <= now && !r.is_expired(now))
}

/// Single-writer ledger: one mutex arbitrates every debit.
#[derive(Debug, Default)]
pub struct InMemoryQuotaLedger {
    records: Mutex<HashMap<OwnerId, Vec<QuotaPeriodRecord>>>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records ever opened for `owner_id`, oldest first.
    pub fn history(&self, owner_id: OwnerId) -> Vec<QuotaPeriodRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&owner_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn try_debit(
        &self,
        owner_id: OwnerId,
        plan_tier: PlanTier,
        limit: PlanLimit,
        now: DateTime<Utc>,
    ) -> Result<QuotaDebit, QuotaError> {
        let mut records = self.records.lock().unwrap();
        let owner_records = records.entry(owner_id).or_default();

        if active_record(owner_records, now).is_none() {
            owner_records.push(QuotaPeriodRecord::open(owner_id, plan_tier, limit, now));
        }
        let record = active_record(owner_records, now)
            .ok_or_else(|| QuotaError::Storage("period record vanished".to_string()))?;

        if !record.try_increment() {
            return Err(QuotaError::Exceeded {
                limit: record.limit,
                period_kind: record.period_kind,
                period_end: record.period_end,
            });
        }

        Ok(QuotaDebit {
            owner_id,
            period_kind: record.period_kind,
            period_start: record.period_start,
            period_end: record.period_end,
            usage_count: record.usage_count,
            limit: record.limit,
        })
    }

    async fn credit(
        &self,
        owner_id: OwnerId,
        period_kind: PeriodKind,
        period_start: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(&owner_id).and_then(|rs| {
            rs.iter_mut()
                .find(|r| r.period_kind == period_kind && r.period_start == period_start)
        }) {
            record.decrement();
        }
        Ok(())
    }

    async fn snapshot(
        &self,
        owner_id: OwnerId,
        plan_tier: PlanTier,
        limit: PlanLimit,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, QuotaError> {
        let mut records = self.records.lock().unwrap();
        let snapshot = records
            .get_mut(&owner_id)
            .and_then(|rs| active_record(rs, now))
            .map(|r| r.snapshot())
            .unwrap_or_else(|| QuotaPeriodRecord::open(owner_id, plan_tier, limit, now).snapshot());
        Ok(snapshot)
    }
}

#[async_trait]
impl<L: QuotaLedger> QuotaLedger for Arc<L> {
    async fn try_debit(
        &self,
        owner_id: OwnerId,
        plan_tier: PlanTier,
        limit: PlanLimit,
        now: DateTime<Utc>,
    ) -> Result<QuotaDebit, QuotaError> {
        (**self).try_debit(owner_id, plan_tier, limit, now).await
    }

    async fn credit(
        &self,
        owner_id: OwnerId,
        period_kind: PeriodKind,
        period_start: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        (**self).credit(owner_id, period_kind, period_start).await
    }

    async fn snapshot(
        &self,
        owner_id: OwnerId,
        plan_tier: PlanTier,
        limit: PlanLimit,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, QuotaError> {
        (**self).snapshot(owner_id, plan_tier, limit, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn noon(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn debits_stop_at_the_limit() {
        let ledger = InMemoryQuotaLedger::new();
        let owner = OwnerId::new();
        let limit = PlanLimit::daily(2);

        assert_eq!(
            ledger
                .try_debit(owner, PlanTier::Free, limit, noon(1))
                .await
                .unwrap()
                .usage_count,
            1
        );
        ledger
            .try_debit(owner, PlanTier::Free, limit, noon(1))
            .await
            .unwrap();

        let err = ledger
            .try_debit(owner, PlanTier::Free, limit, noon(1))
            .await
            .unwrap_err();
        match err {
            QuotaError::Exceeded {
                limit, period_end, ..
            } => {
                assert_eq!(limit, 2);
                assert_eq!(period_end, Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn period_rolls_over_after_end() {
        let ledger = InMemoryQuotaLedger::new();
        let owner = OwnerId::new();
        let limit = PlanLimit::daily(1);

        ledger.try_debit(owner, PlanTier::Free, limit, noon(1)).await.unwrap();
        assert!(ledger.try_debit(owner, PlanTier::Free, limit, noon(1)).await.is_err());

        let next_day = ledger.try_debit(owner, PlanTier::Free, limit, noon(2)).await.unwrap();
        assert_eq!(next_day.usage_count, 1);
        assert_eq!(ledger.history(owner).len(), 2);
    }

    #[tokio::test]
    async fn limit_is_fixed_until_rollover() {
        let ledger = InMemoryQuotaLedger::new();
        let owner = OwnerId::new();

        ledger
            .try_debit(owner, PlanTier::Free, PlanLimit::daily(1), noon(1))
            .await
            .unwrap();
        // Upgrade mid-period: the open record keeps its limit.
        assert!(
            ledger
                .try_debit(owner, PlanTier::Pro, PlanLimit::monthly(1000), noon(1))
                .await
                .is_err()
        );
        let upgraded = ledger
            .try_debit(owner, PlanTier::Pro, PlanLimit::monthly(1000), noon(2))
            .await
            .unwrap();
        assert_eq!(upgraded.limit, 1000);
        assert_eq!(upgraded.period_kind, PeriodKind::Monthly);
    }

    #[tokio::test]
    async fn credit_restores_headroom_and_saturates() {
        let ledger = InMemoryQuotaLedger::new();
        let owner = OwnerId::new();
        let limit = PlanLimit::daily(1);

        let debit = ledger.try_debit(owner, PlanTier::Free, limit, noon(1)).await.unwrap();
        ledger.credit(owner, debit.period_kind, debit.period_start).await.unwrap();
        ledger.credit(owner, debit.period_kind, debit.period_start).await.unwrap();

        let snapshot = ledger.snapshot(owner, PlanTier::Free, limit, noon(1)).await.unwrap();
        assert_eq!(snapshot.usage_count, 0);
        assert_eq!(snapshot.remaining, 1);
    }

    #[tokio::test]
    async fn credit_after_tier_change_hits_the_debited_period_kind() {
        let ledger = InMemoryQuotaLedger::new();
        let owner = OwnerId::new();

        // Daily record for March 1, then a monthly record that also starts
        // on March 1 once the owner is upgraded.
        ledger
            .try_debit(owner, PlanTier::Free, PlanLimit::daily(5), noon(1))
            .await
            .unwrap();
        let monthly = ledger
            .try_debit(owner, PlanTier::Pro, PlanLimit::monthly(1000), noon(2))
            .await
            .unwrap();
        assert_eq!(monthly.period_kind, PeriodKind::Monthly);
        assert_eq!(monthly.period_start, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());

        ledger
            .credit(owner, monthly.period_kind, monthly.period_start)
            .await
            .unwrap();

        let usage: Vec<_> = ledger
            .history(owner)
            .iter()
            .map(|r| (r.period_kind, r.usage_count))
            .collect();
        assert_eq!(usage, vec![(PeriodKind::Daily, 1), (PeriodKind::Monthly, 0)]);
    }

    #[tokio::test]
    async fn snapshot_without_record_reports_empty_period() {
        let ledger = InMemoryQuotaLedger::new();
        let snapshot = ledger
            .snapshot(OwnerId::new(), PlanTier::Personal, PlanLimit::monthly(100), noon(15))
            .await
            .unwrap();
        assert_eq!(snapshot.usage_count, 0);
        assert_eq!(snapshot.remaining, 100);
        assert_eq!(snapshot.period_start, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_debits_admit_exactly_the_headroom() {
        let ledger = Arc::new(InMemoryQuotaLedger::new());
        let owner = OwnerId::new();
        let limit = PlanLimit::daily(5);
        for _ in 0..3 {
            ledger.try_debit(owner, PlanTier::Free, limit, noon(1)).await.unwrap();
        }

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger.try_debit(owner, PlanTier::Free, limit, noon(1)).await.is_ok()
                })
            })
            .collect();

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 2);
        let snapshot = ledger.snapshot(owner, PlanTier::Free, limit, noon(1)).await.unwrap();
        assert_eq!(snapshot.usage_count, 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]

        #[test]
        fn admitted_is_min_of_requests_and_headroom(
            limit in 1u32..20,
            used in 0u32..20,
            requests in 0u32..40,
        ) {
            let used = used.min(limit);
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let ledger = InMemoryQuotaLedger::new();
                let owner = OwnerId::new();
                let plan = PlanLimit::daily(limit);
                for _ in 0..used {
                    ledger.try_debit(owner, PlanTier::Free, plan, noon(1)).await.unwrap();
                }

                let mut admitted = 0;
                for _ in 0..requests {
                    if ledger.try_debit(owner, PlanTier::Free, plan, noon(1)).await.is_ok() {
                        admitted += 1;
                    }
                }

                prop_assert_eq!(admitted, requests.min(limit - used));
                let snapshot = ledger.snapshot(owner, PlanTier::Free, plan, noon(1)).await.unwrap();
                prop_assert!(snapshot.usage_count <= limit);
                Ok(())
            })?;
        }
    }
}
