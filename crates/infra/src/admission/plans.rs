use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use productsnap_core::OwnerId;
use productsnap_jobs::{PlanLimit, PlanLimits, PlanTier};

/// Read-only view of the billing collaborator: who is on which plan, and
/// what each plan allows.
#[async_trait]
pub trait PlanDirectory: Send + Sync + 'static {
    async fn tier_for(&self, owner_id: OwnerId) -> PlanTier;

    fn limit_for(&self, tier: PlanTier) -> PlanLimit;
}

/// Plan assignments held in memory. Owners without a subscription are on
/// the free tier.
#[derive(Debug, Default)]
pub struct InMemoryPlanDirectory {
    limits: PlanLimits,
    tiers: RwLock<HashMap<OwnerId, PlanTier>>,
}

impl InMemoryPlanDirectory {
    pub fn new(limits: PlanLimits) -> Self {
        Self {
            limits,
            tiers: RwLock::new(HashMap::new()),
        }
    }

    /// Record a subscription change.
    pub fn set_tier(&self, owner_id: OwnerId, tier: PlanTier) {
        self.tiers.write().unwrap().insert(owner_id, tier);
    }
}

#[async_trait]
impl PlanDirectory for InMemoryPlanDirectory {
    async fn tier_for(&self, owner_id: OwnerId) -> PlanTier {
        self.tiers
            .read()
            .unwrap()
            .get(&owner_id)
            .copied()
            .unwrap_or(PlanTier::Free)
    }

    fn limit_for(&self, tier: PlanTier) -> PlanLimit {
        self.limits.for_tier(tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_owner_is_free_tier() {
        let plans = InMemoryPlanDirectory::default();
        let owner = OwnerId::new();
        assert_eq!(plans.tier_for(owner).await, PlanTier::Free);

        plans.set_tier(owner, PlanTier::Pro);
        assert_eq!(plans.tier_for(owner).await, PlanTier::Pro);
        assert_eq!(
            plans.limit_for(PlanTier::Pro),
            PlanLimit::monthly(1000).with_concurrent_jobs(5)
        );
    }
}
