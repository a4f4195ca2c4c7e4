//! Reward distribution engine.
//!
//! A level-up event fans out one reward record per matrix root whose tree
//! contains the triggering member. The recipient is the root; the layer the
//! trigger occupies in that root's tree selects the qualification rule. A
//! qualified recipient gets a claimable record, an unqualified one a pending
//! record with an expiry window for the rollup sweep to resolve.
//!
//! Record ids are derived from the (trigger, level, root, recipient) tuple,
//! so replaying the same event inserts nothing new and returns the records
//! that already exist.

mod qualify;

pub use qualify::{MemberDirectory, Qualification, Qualifier, StoreDirectory};

use std::sync::Arc;
use tracing::{debug, warn};
use trellis_model::{
    Error, LevelSchedule, MatrixConfig, QualificationSchedule, Result, RewardEvent, RewardId,
    RewardRecord, RewardStatus, Wallet,
};
use trellis_store::Store;

/// Outcome of one `distribute_rewards` call.
///
/// Every root that holds the trigger appears in exactly one of `created`,
/// `existing` or `indeterminate`.
#[derive(Debug, Clone, Default)]
pub struct DistributionOutcome {
    /// Records created by this call.
    pub created: Vec<RewardRecord>,
    /// Records that already existed for this (trigger, level) event.
    pub existing: Vec<RewardRecord>,
    /// Roots whose qualification could not be established; no record was
    /// written for them and a replay of the event will retry.
    pub indeterminate: Vec<Wallet>,
    /// Pending rewards of the trigger promoted to claimable by this level-up.
    pub promoted: Vec<RewardId>,
    /// Change events for downstream notification fan-out.
    pub events: Vec<RewardEvent>,
}

/// Fans rewards out across the trigger's upline trees.
pub struct RewardEngine<S, D> {
    store: Arc<S>,
    qualifier: Qualifier<D>,
    levels: LevelSchedule,
    pending_window_ms: u64,
}

impl<S: Store, D: MemberDirectory> RewardEngine<S, D> {
    pub fn new(
        store: Arc<S>,
        directory: D,
        config: &MatrixConfig,
        qualification: QualificationSchedule,
        levels: LevelSchedule,
    ) -> Self {
        Self {
            store,
            qualifier: Qualifier::new(directory, qualification, config.lookup_retry_budget),
            levels,
            pending_window_ms: config.pending_window_ms,
        }
    }

    /// Distribute rewards for one level-up event.
    ///
    /// Raises the trigger's stored level (levels never decrease; a replay of
    /// an older event leaves it alone), writes one record per root holding
    /// the trigger, and promotes the trigger's own pending rewards that this
    /// level-up qualifies.
    pub fn distribute_rewards(
        &self,
        trigger: &Wallet,
        new_level: u8,
        payment_minor: u64,
        now_ms: u64,
    ) -> Result<DistributionOutcome> {
        let tier = self
            .levels
            .tier(new_level)
            .ok_or(Error::UnknownLevel(new_level))?;
        if payment_minor != tier.price_minor {
            warn!(
                trigger = %trigger,
                level = new_level,
                paid = payment_minor,
                price = tier.price_minor,
                "payment does not match the level price"
            );
        }
        let member = self
            .store
            .member(trigger)?
            .ok_or_else(|| Error::UnknownMember(trigger.clone()))?;
        if new_level > member.current_level {
            self.store.raise_member_level(trigger, new_level)?;
        }

        let mut outcome = DistributionOutcome::default();
        for placement in self.store.placements_of_member(trigger)? {
            let recipient = placement.root.clone();
            let qualification = match self.qualifier.evaluate(&recipient, placement.layer) {
                Ok(q) => q,
                Err(Error::QualificationIndeterminate { wallet, reason }) => {
                    warn!(recipient = %wallet, reason, "reward creation deferred");
                    outcome.indeterminate.push(wallet);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (status, expires_at_ms) = if qualification.qualified {
                (RewardStatus::Claimable, None)
            } else {
                (RewardStatus::Pending, Some(now_ms + self.pending_window_ms))
            };
            let record = RewardRecord {
                id: RewardId::derive(trigger, new_level, &placement.root, &recipient),
                recipient: recipient.clone(),
                trigger: trigger.clone(),
                trigger_level: new_level,
                root: placement.root.clone(),
                layer: placement.layer,
                required_level: qualification.rule.required_level,
                recipient_level_at_trigger: qualification.level,
                amount: tier.reward_minor,
                status,
                created_at_ms: now_ms,
                expires_at_ms,
                rolled_up_to: None,
                claimed_at_ms: None,
            };

            if self.store.insert_reward(&record)? {
                debug!(
                    id = %record.id,
                    recipient = %recipient,
                    layer = record.layer,
                    status = %record.status,
                    "reward created"
                );
                outcome.events.push(RewardEvent::Created {
                    id: record.id.clone(),
                    recipient: record.recipient.clone(),
                    trigger: record.trigger.clone(),
                    root: record.root.clone(),
                    layer: record.layer,
                    amount: record.amount,
                    status: record.status,
                    at_ms: now_ms,
                });
                outcome.created.push(record);
            } else if let Some(stored) = self.store.reward(&record.id)? {
                outcome.existing.push(stored);
            }
        }

        let promoted = self.promote_pending(trigger, now_ms)?;
        for event in promoted {
            if let RewardEvent::Qualified { ref id, .. } = event {
                outcome.promoted.push(id.clone());
            }
            outcome.events.push(event);
        }
        Ok(outcome)
    }

    /// Promote this wallet's pending rewards that it now qualifies for.
    ///
    /// Invoked after every level raise; also safe to run standalone when a
    /// qualification input changed out of band (a new direct referral, for
    /// instance).
    pub fn promote_pending(&self, wallet: &Wallet, now_ms: u64) -> Result<Vec<RewardEvent>> {
        let mut events = Vec::new();
        for record in self.store.rewards_by_recipient(wallet)? {
            if record.status != RewardStatus::Pending {
                continue;
            }
            let qualification = match self.qualifier.evaluate(wallet, record.layer) {
                Ok(q) => q,
                Err(Error::QualificationIndeterminate { reason, .. }) => {
                    warn!(recipient = %wallet, reward = %record.id, reason, "promotion deferred");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !qualification.qualified {
                continue;
            }
            // CAS: the rollup sweep may have taken the record meanwhile.
            if self
                .store
                .transition_reward(&record.id, RewardStatus::Pending, RewardStatus::Claimable)?
            {
                debug!(recipient = %wallet, reward = %record.id, "pending reward promoted");
                events.push(RewardEvent::Qualified {
                    id: record.id,
                    recipient: record.recipient,
                    amount: record.amount,
                    at_ms: now_ms,
                });
            }
        }
        Ok(events)
    }
}
