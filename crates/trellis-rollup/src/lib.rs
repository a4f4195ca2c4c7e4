//! Expiry and rollup scheduler.
//!
//! Pending rewards carry an expiry. Once it passes, the sweep claims the
//! record with a compare-and-set (`Pending -> Processing`, so overlapping
//! sweeps never double-process), re-checks the original recipient, and if
//! they still do not qualify walks their upline looking for an ancestor who
//! does. The reward is reassigned with a linked audit entry, or marked
//! `expired_terminal` when the chain runs out. Nothing is silently dropped.

mod sweep;

pub use sweep::SweepRunner;

use std::sync::Arc;
use tracing::{debug, info, warn};
use trellis_model::{
    Error, MatrixConfig, QualificationSchedule, Result, RewardEvent, RewardId, RewardRecord,
    RewardStatus, RollupEntry, RollupReason, Wallet,
};
use trellis_rewards::{MemberDirectory, Qualifier};
use trellis_store::Store;

/// How one expired record was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollupResolution {
    /// The original recipient qualified in the meantime; promoted in place.
    Requalified { id: RewardId },
    /// Reassigned to a qualifying ancestor.
    RolledUp {
        original: RewardId,
        successor: RewardId,
        from: Wallet,
        to: Wallet,
    },
    /// A qualification lookup was indeterminate; the record went back to
    /// pending with a fresh window and the next sweep retries.
    Reopened { id: RewardId },
    /// No qualifying ancestor up the whole chain. Flagged for review.
    ExpiredTerminal { id: RewardId, recipient: Wallet },
}

/// Result of one sweep run.
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub resolutions: Vec<RollupResolution>,
    pub events: Vec<RewardEvent>,
}

/// Resolves expired pending rewards. Safe to run concurrently and repeatedly.
pub struct RollupEngine<S, D> {
    store: Arc<S>,
    qualifier: Qualifier<D>,
    pending_window_ms: u64,
    upline_walk_bound: u32,
}

impl<S: Store, D: MemberDirectory> RollupEngine<S, D> {
    pub fn new(
        store: Arc<S>,
        directory: D,
        config: &MatrixConfig,
        qualification: QualificationSchedule,
    ) -> Self {
        Self {
            store,
            qualifier: Qualifier::new(directory, qualification, config.lookup_retry_budget),
            pending_window_ms: config.pending_window_ms,
            upline_walk_bound: config.upline_depth,
        }
    }

    /// Settle every pending reward whose expiry has passed.
    pub fn resolve_expired(&self, now_ms: u64) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome::default();
        for record in self.store.expired_pending(now_ms)? {
            // Claim the record; a concurrent sweep may already own it.
            if !self
                .store
                .transition_reward(&record.id, RewardStatus::Pending, RewardStatus::Processing)?
            {
                continue;
            }
            let resolution = self.resolve_one(&record, now_ms, &mut outcome.events)?;
            outcome.resolutions.push(resolution);
        }
        if !outcome.resolutions.is_empty() {
            info!(resolved = outcome.resolutions.len(), "sweep settled expired rewards");
        }
        Ok(outcome)
    }

    /// Settle one record the sweep owns (status `Processing`).
    fn resolve_one(
        &self,
        record: &RewardRecord,
        now_ms: u64,
        events: &mut Vec<RewardEvent>,
    ) -> Result<RollupResolution> {
        // The recipient may have qualified since the record was created
        // without anything promoting it.
        match self.qualifier.evaluate(&record.recipient, record.layer) {
            Ok(q) if q.qualified => {
                self.store
                    .resolve_processing(&record.id, RewardStatus::Claimable, None, None)?;
                debug!(id = %record.id, recipient = %record.recipient, "expired record requalified");
                events.push(RewardEvent::Qualified {
                    id: record.id.clone(),
                    recipient: record.recipient.clone(),
                    amount: record.amount,
                    at_ms: now_ms,
                });
                return Ok(RollupResolution::Requalified {
                    id: record.id.clone(),
                });
            }
            Ok(_) => {}
            Err(Error::QualificationIndeterminate { reason, .. }) => {
                return self.reopen(record, now_ms, &reason);
            }
            Err(e) => return Err(e),
        }

        // Walk the recipient's upline, nearest ancestor first, re-applying
        // the same layer rule.
        let mut cursor = self
            .store
            .member(&record.recipient)?
            .and_then(|m| m.referrer);
        let mut steps = 0;
        while let Some(ancestor) = cursor {
            if steps >= self.upline_walk_bound {
                break;
            }
            steps += 1;
            match self.qualifier.evaluate(&ancestor, record.layer) {
                Ok(q) if q.qualified => {
                    return self.roll_up_to(record, &ancestor, q.level, now_ms, events);
                }
                Ok(_) => {
                    cursor = self.store.member(&ancestor)?.and_then(|m| m.referrer);
                }
                Err(Error::QualificationIndeterminate { reason, .. }) => {
                    return self.reopen(record, now_ms, &reason);
                }
                Err(e) => return Err(e),
            }
        }

        // Chain exhausted.
        self.store
            .resolve_processing(&record.id, RewardStatus::ExpiredTerminal, None, None)?;
        warn!(
            id = %record.id,
            recipient = %record.recipient,
            amount = record.amount,
            "no qualifying ancestor; reward expired terminally"
        );
        events.push(RewardEvent::ExpiredTerminal {
            id: record.id.clone(),
            recipient: record.recipient.clone(),
            amount: record.amount,
            at_ms: now_ms,
        });
        Ok(RollupResolution::ExpiredTerminal {
            id: record.id.clone(),
            recipient: record.recipient.clone(),
        })
    }

    /// Put an indeterminate record back to pending with a fresh window.
    fn reopen(
        &self,
        record: &RewardRecord,
        now_ms: u64,
        reason: &str,
    ) -> Result<RollupResolution> {
        self.store.resolve_processing(
            &record.id,
            RewardStatus::Pending,
            None,
            Some(now_ms + self.pending_window_ms),
        )?;
        warn!(id = %record.id, reason, "rollup deferred; record reopened");
        Ok(RollupResolution::Reopened {
            id: record.id.clone(),
        })
    }

    fn roll_up_to(
        &self,
        record: &RewardRecord,
        ancestor: &Wallet,
        ancestor_level: u8,
        now_ms: u64,
        events: &mut Vec<RewardEvent>,
    ) -> Result<RollupResolution> {
        let successor = RewardRecord {
            id: RewardId::derive(&record.trigger, record.trigger_level, &record.root, ancestor),
            recipient: ancestor.clone(),
            trigger: record.trigger.clone(),
            trigger_level: record.trigger_level,
            root: record.root.clone(),
            layer: record.layer,
            required_level: record.required_level,
            recipient_level_at_trigger: ancestor_level,
            amount: record.amount,
            status: RewardStatus::Claimable,
            created_at_ms: now_ms,
            expires_at_ms: None,
            rolled_up_to: None,
            claimed_at_ms: None,
        };
        // Insert-if-absent keeps a replayed resolution from duplicating the
        // successor.
        self.store.insert_reward(&successor)?;
        self.store.resolve_processing(
            &record.id,
            RewardStatus::RolledUp,
            Some(ancestor.clone()),
            None,
        )?;
        self.store.append_rollup(&RollupEntry {
            original_reward: record.id.clone(),
            new_reward: successor.id.clone(),
            reason: RollupReason::PendingExpired,
            at_ms: now_ms,
        })?;
        info!(
            original = %record.id,
            successor = %successor.id,
            from = %record.recipient,
            to = %ancestor,
            amount = record.amount,
            "reward rolled up"
        );
        events.push(RewardEvent::RolledUp {
            original: record.id.clone(),
            successor: successor.id.clone(),
            from: record.recipient.clone(),
            to: ancestor.clone(),
            amount: record.amount,
            at_ms: now_ms,
        });
        Ok(RollupResolution::RolledUp {
            original: record.id.clone(),
            successor: successor.id,
            from: record.recipient.clone(),
            to: ancestor.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_model::{LevelSchedule, Wallet};
    use trellis_placement::PlacementEngine;
    use trellis_rewards::{RewardEngine, StoreDirectory};
    use trellis_store::MemoryStore;

    fn w(s: &str) -> Wallet {
        Wallet::new(s)
    }

    /// Directory whose lookups always fail, forcing indeterminate
    /// qualifications.
    struct OfflineDirectory;

    impl MemberDirectory for OfflineDirectory {
        fn current_level(&self, _: &Wallet) -> Result<u8> {
            Err(Error::Storage("directory offline".into()))
        }
        fn direct_referral_count(&self, _: &Wallet) -> Result<u32> {
            Err(Error::Storage("directory offline".into()))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        rewards: RewardEngine<MemoryStore, StoreDirectory<MemoryStore>>,
        rollup: RollupEngine<MemoryStore, StoreDirectory<MemoryStore>>,
    }

    /// g <- a <- b <- c referral chain, all at level 1, g at `root_level`.
    fn fixture(root_level: u8) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = MatrixConfig::default();
        let placement = PlacementEngine::new(store.clone(), config.clone());
        placement.bootstrap_root(&w("g"), root_level, 0).unwrap();
        for (i, (member, referrer)) in [("a", "g"), ("b", "a"), ("c", "b")].iter().enumerate() {
            placement.place_member(&w(member), &w(referrer), i as u64).unwrap();
            store.raise_member_level(&w(member), 1).unwrap();
        }
        let rewards = RewardEngine::new(
            store.clone(),
            StoreDirectory::new(store.clone()),
            &config,
            QualificationSchedule::standard(),
            LevelSchedule::standard(),
        );
        let rollup = RollupEngine::new(
            store.clone(),
            StoreDirectory::new(store.clone()),
            &config,
            QualificationSchedule::standard(),
        );
        Fixture {
            store,
            rewards,
            rollup,
        }
    }

    /// The pending record for recipient `a` created by c's level-1 event:
    /// c sits at layer 2 of a's tree and a is only level 1.
    fn pending_for_a(fx: &Fixture) -> RewardId {
        let outcome = fx.rewards.distribute_rewards(&w("c"), 1, 10_000, 1_000).unwrap();
        outcome
            .created
            .iter()
            .find(|r| r.recipient == w("a"))
            .map(|r| r.id.clone())
            .unwrap()
    }

    #[test]
    fn unexpired_records_are_left_alone() {
        let fx = fixture(9);
        let id = pending_for_a(&fx);
        let outcome = fx.rollup.resolve_expired(1_500).unwrap();
        assert!(outcome.resolutions.is_empty());
        assert_eq!(
            fx.store.reward(&id).unwrap().unwrap().status,
            RewardStatus::Pending
        );
    }

    #[test]
    fn expired_record_rolls_up_to_qualified_ancestor() {
        // g holds level 9; a (level 1) misses the layer-2 requirement.
        let fx = fixture(9);
        let id = pending_for_a(&fx);

        let after_expiry = 1_000 + trellis_model::DEFAULT_PENDING_WINDOW_MS + 1;
        let outcome = fx.rollup.resolve_expired(after_expiry).unwrap();
        assert_eq!(outcome.resolutions.len(), 1);
        let RollupResolution::RolledUp { original, successor, from, to } =
            outcome.resolutions[0].clone()
        else {
            panic!("expected rollup, got {:?}", outcome.resolutions[0]);
        };
        assert_eq!(original, id);
        assert_eq!(from, w("a"));
        assert_eq!(to, w("g"));

        let original = fx.store.reward(&id).unwrap().unwrap();
        assert_eq!(original.status, RewardStatus::RolledUp);
        assert_eq!(original.rolled_up_to, Some(w("g")));

        let successor = fx.store.reward(&successor).unwrap().unwrap();
        assert_eq!(successor.status, RewardStatus::Claimable);
        assert_eq!(successor.recipient, w("g"));
        assert_eq!(successor.amount, original.amount);

        let trail = fx.store.rollups_for(&id).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].reason, RollupReason::PendingExpired);
    }

    #[test]
    fn chain_without_qualified_ancestor_expires_terminally() {
        // g is also only level 1: nobody up the chain qualifies for layer 2.
        let fx = fixture(1);
        let id = pending_for_a(&fx);

        let after_expiry = 1_000 + trellis_model::DEFAULT_PENDING_WINDOW_MS + 1;
        let outcome = fx.rollup.resolve_expired(after_expiry).unwrap();
        // g's own layer-3 record expired too; find the resolution for a's.
        let for_a = outcome
            .resolutions
            .iter()
            .find(|r| matches!(r, RollupResolution::ExpiredTerminal { id: rid, .. } if *rid == id));
        assert!(for_a.is_some(), "{:?}", outcome.resolutions);
        let record = fx.store.reward(&id).unwrap().unwrap();
        assert_eq!(record.status, RewardStatus::ExpiredTerminal);
        assert!(fx.store.rollups_for(&id).unwrap().is_empty());
    }

    #[test]
    fn recipient_who_qualified_meanwhile_is_promoted_in_place() {
        let fx = fixture(9);
        let id = pending_for_a(&fx);
        fx.store.raise_member_level(&w("a"), 2).unwrap();

        let after_expiry = 1_000 + trellis_model::DEFAULT_PENDING_WINDOW_MS + 1;
        let outcome = fx.rollup.resolve_expired(after_expiry).unwrap();
        assert_eq!(
            outcome.resolutions,
            vec![RollupResolution::Requalified { id: id.clone() }]
        );
        let record = fx.store.reward(&id).unwrap().unwrap();
        assert_eq!(record.status, RewardStatus::Claimable);
        assert_eq!(record.expires_at_ms, None);
    }

    #[test]
    fn indeterminate_lookup_reopens_with_fresh_window() {
        let fx = fixture(9);
        let id = pending_for_a(&fx);
        let offline = RollupEngine::new(
            fx.store.clone(),
            OfflineDirectory,
            &MatrixConfig::default(),
            QualificationSchedule::standard(),
        );

        let after_expiry = 1_000 + trellis_model::DEFAULT_PENDING_WINDOW_MS + 1;
        let outcome = offline.resolve_expired(after_expiry).unwrap();
        assert_eq!(
            outcome.resolutions,
            vec![RollupResolution::Reopened { id: id.clone() }]
        );
        assert!(outcome.events.is_empty());

        // Back to pending with a window starting at the sweep, not rolled up.
        let record = fx.store.reward(&id).unwrap().unwrap();
        assert_eq!(record.status, RewardStatus::Pending);
        assert_eq!(
            record.expires_at_ms,
            Some(after_expiry + trellis_model::DEFAULT_PENDING_WINDOW_MS)
        );
        assert!(fx.store.rollups_for(&id).unwrap().is_empty());

        // A later sweep with the directory back picks it up again.
        let next_expiry = after_expiry + trellis_model::DEFAULT_PENDING_WINDOW_MS + 1;
        let outcome = fx.rollup.resolve_expired(next_expiry).unwrap();
        assert!(outcome
            .resolutions
            .iter()
            .any(|r| matches!(r, RollupResolution::RolledUp { original, .. } if *original == id)));
    }

    #[test]
    fn repeated_sweeps_do_not_double_process() {
        let fx = fixture(9);
        let id = pending_for_a(&fx);

        let after_expiry = 1_000 + trellis_model::DEFAULT_PENDING_WINDOW_MS + 1;
        let first = fx.rollup.resolve_expired(after_expiry).unwrap();
        let second = fx.rollup.resolve_expired(after_expiry).unwrap();
        assert_eq!(first.resolutions.len(), 1);
        assert!(second.resolutions.is_empty());
        assert_eq!(fx.store.rollups_for(&id).unwrap().len(), 1);
    }
}
