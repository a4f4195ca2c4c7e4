//! Balance ledger.
//!
//! Read-side aggregation of reward state per wallet, recomputed from the
//! records themselves so the buckets reconcile by construction. The one
//! mutating entry point is [`Ledger::claim_rewards`], which settles a batch
//! of claimable records atomically through the store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use trellis_model::{Result, RewardEvent, RewardId, RewardRecord, RewardStatus, Wallet};
use trellis_store::Store;

/// Per-wallet totals, in minor currency units.
///
/// `pending` includes records a sweep currently holds in `processing`; they
/// are unresolved from the wallet's point of view. The five buckets always
/// sum to `total_created`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub claimable: u64,
    pub pending: u64,
    pub claimed: u64,
    pub rolled_up: u64,
    pub expired_terminal: u64,
    /// Lifetime total of every reward ever created for this wallet.
    pub total_created: u64,
}

/// Result of a claim batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimResult {
    pub claimed: Vec<RewardId>,
    pub total_minor: u64,
    pub events: Vec<RewardEvent>,
}

/// Read-side view over reward records plus the claim entry point.
pub struct Ledger<S> {
    store: Arc<S>,
}

impl<S: Store> Ledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Aggregate every reward record of a wallet into bucket totals.
    pub fn balance(&self, wallet: &Wallet) -> Result<BalanceSnapshot> {
        let mut snapshot = BalanceSnapshot::default();
        for record in self.store.rewards_by_recipient(wallet)? {
            snapshot.total_created += record.amount;
            match record.status {
                RewardStatus::Claimable => snapshot.claimable += record.amount,
                RewardStatus::Pending | RewardStatus::Processing => {
                    snapshot.pending += record.amount;
                }
                RewardStatus::Claimed => snapshot.claimed += record.amount,
                RewardStatus::RolledUp => snapshot.rolled_up += record.amount,
                RewardStatus::ExpiredTerminal => snapshot.expired_terminal += record.amount,
            }
        }
        Ok(snapshot)
    }

    /// Claim a batch of rewards, all or nothing.
    ///
    /// Every referenced record must belong to `wallet` and be claimable;
    /// otherwise the call fails and no record changes.
    pub fn claim_rewards(
        &self,
        wallet: &Wallet,
        ids: &[RewardId],
        now_ms: u64,
    ) -> Result<ClaimResult> {
        if ids.is_empty() {
            return Ok(ClaimResult {
                claimed: Vec::new(),
                total_minor: 0,
                events: Vec::new(),
            });
        }
        // Settle and report each distinct id once, however often it appears
        // in the request.
        let mut unique: Vec<RewardId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }
        let total_minor = self.store.claim_all_or_nothing(wallet, &unique, now_ms)?;
        info!(wallet = %wallet, count = unique.len(), total_minor, "rewards claimed");
        let mut events = Vec::with_capacity(unique.len());
        for id in &unique {
            if let Some(record) = self.store.reward(id)? {
                events.push(RewardEvent::Claimed {
                    id: id.clone(),
                    recipient: record.recipient,
                    amount: record.amount,
                    at_ms: now_ms,
                });
            }
        }
        Ok(ClaimResult {
            claimed: unique,
            total_minor,
            events,
        })
    }

    /// Most recent reward records of a wallet, newest first.
    pub fn history(&self, wallet: &Wallet, limit: usize) -> Result<Vec<RewardRecord>> {
        let mut records = self.store.rewards_by_recipient(wallet)?;
        records.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        records.truncate(limit);
        Ok(records)
    }
}
