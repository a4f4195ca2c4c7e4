//! In-memory store for tests and embedding.

use crate::Store;
use std::collections::HashMap;
use std::sync::Mutex;
use trellis_model::{
    DeferredPlacement, Error, Member, Placement, Position, Result, RewardId, RewardRecord,
    RewardStatus, RollupEntry, Wallet,
};

#[derive(Default)]
struct Inner {
    members: HashMap<Wallet, Member>,
    /// (root, member) -> placement
    placements: HashMap<(Wallet, Wallet), Placement>,
    /// (root, parent, position) -> occupant. A parent appears at exactly one
    /// layer of a root's tree, so the layer is not part of the key.
    slots: HashMap<(Wallet, Wallet, Position), Wallet>,
    /// (root, layer) -> members in insertion order
    layer_order: HashMap<(Wallet, u32), Vec<Wallet>>,
    rewards: HashMap<RewardId, RewardRecord>,
    rollups: Vec<RollupEntry>,
    deferred: Vec<DeferredPlacement>,
    activation_seq: u64,
}

/// HashMap-backed [`Store`]. All state behind one mutex, which trivially
/// gives every conditional write the required atomicity.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("memory store mutex poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn create_member(
        &self,
        wallet: &Wallet,
        referrer: Option<&Wallet>,
        level: u8,
        now_ms: u64,
    ) -> Result<Member> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.members.get(wallet) {
            return Ok(existing.clone());
        }
        inner.activation_seq += 1;
        let member = Member {
            wallet: wallet.clone(),
            referrer: referrer.cloned(),
            current_level: level,
            activation_seq: inner.activation_seq,
            activated_at_ms: now_ms,
        };
        inner.members.insert(wallet.clone(), member.clone());
        Ok(member)
    }

    fn member(&self, wallet: &Wallet) -> Result<Option<Member>> {
        Ok(self.lock()?.members.get(wallet).cloned())
    }

    fn raise_member_level(&self, wallet: &Wallet, level: u8) -> Result<Member> {
        let mut inner = self.lock()?;
        let member = inner
            .members
            .get_mut(wallet)
            .ok_or_else(|| Error::UnknownMember(wallet.clone()))?;
        if level > member.current_level {
            member.current_level = level;
        }
        Ok(member.clone())
    }

    fn direct_referral_count(&self, wallet: &Wallet) -> Result<u32> {
        let inner = self.lock()?;
        let count = inner
            .members
            .values()
            .filter(|m| m.referrer.as_ref() == Some(wallet))
            .count();
        Ok(count as u32)
    }

    fn insert_placement(&self, placement: &Placement) -> Result<()> {
        let mut inner = self.lock()?;
        let member_key = (placement.root.clone(), placement.member.clone());
        if inner.placements.contains_key(&member_key) {
            return Err(Error::AlreadyPlaced {
                root: placement.root.clone(),
                member: placement.member.clone(),
            });
        }
        let slot_key = (
            placement.root.clone(),
            placement.parent.clone(),
            placement.position,
        );
        if inner.slots.contains_key(&slot_key) {
            return Err(Error::SlotContention {
                root: placement.root.clone(),
            });
        }
        inner.slots.insert(slot_key, placement.member.clone());
        inner
            .layer_order
            .entry((placement.root.clone(), placement.layer))
            .or_default()
            .push(placement.member.clone());
        inner.placements.insert(member_key, placement.clone());
        Ok(())
    }

    fn placement(&self, root: &Wallet, member: &Wallet) -> Result<Option<Placement>> {
        Ok(self
            .lock()?
            .placements
            .get(&(root.clone(), member.clone()))
            .cloned())
    }

    fn placements_of_member(&self, member: &Wallet) -> Result<Vec<Placement>> {
        let inner = self.lock()?;
        let mut found: Vec<Placement> = inner
            .placements
            .values()
            .filter(|p| &p.member == member)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.root.cmp(&b.root));
        Ok(found)
    }

    fn placements_of_root(&self, root: &Wallet) -> Result<Vec<Placement>> {
        let inner = self.lock()?;
        let mut found: Vec<Placement> = inner
            .placements
            .values()
            .filter(|p| &p.root == root)
            .cloned()
            .collect();
        found.sort_by_key(|p| (p.layer, p.created_at_ms));
        Ok(found)
    }

    fn nodes_at_layer(&self, root: &Wallet, layer: u32) -> Result<Vec<Wallet>> {
        Ok(self
            .lock()?
            .layer_order
            .get(&(root.clone(), layer))
            .cloned()
            .unwrap_or_default())
    }

    fn occupied_positions(&self, root: &Wallet, parent: &Wallet) -> Result<Vec<Position>> {
        let inner = self.lock()?;
        let occupied = inner
            .slots
            .keys()
            .filter(|(r, p, _)| r == root && p == parent)
            .map(|(_, _, pos)| *pos)
            .collect();
        Ok(occupied)
    }

    fn insert_reward(&self, record: &RewardRecord) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.rewards.contains_key(&record.id) {
            return Ok(false);
        }
        inner.rewards.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    fn reward(&self, id: &RewardId) -> Result<Option<RewardRecord>> {
        Ok(self.lock()?.rewards.get(id).cloned())
    }

    fn rewards_by_recipient(&self, wallet: &Wallet) -> Result<Vec<RewardRecord>> {
        let inner = self.lock()?;
        let mut found: Vec<RewardRecord> = inner
            .rewards
            .values()
            .filter(|r| &r.recipient == wallet)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at_ms);
        Ok(found)
    }

    fn rewards_by_trigger(&self, trigger: &Wallet, level: u8) -> Result<Vec<RewardRecord>> {
        let inner = self.lock()?;
        let mut found: Vec<RewardRecord> = inner
            .rewards
            .values()
            .filter(|r| &r.trigger == trigger && r.trigger_level == level)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.root.cmp(&b.root));
        Ok(found)
    }

    fn expired_pending(&self, now_ms: u64) -> Result<Vec<RewardRecord>> {
        let inner = self.lock()?;
        let mut found: Vec<RewardRecord> = inner
            .rewards
            .values()
            .filter(|r| {
                r.status == RewardStatus::Pending
                    && r.expires_at_ms.map(|e| e <= now_ms).unwrap_or(false)
            })
            .cloned()
            .collect();
        found.sort_by_key(|r| r.expires_at_ms);
        Ok(found)
    }

    fn transition_reward(
        &self,
        id: &RewardId,
        from: RewardStatus,
        to: RewardStatus,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let record = inner
            .rewards
            .get_mut(id)
            .ok_or_else(|| Error::UnknownReward(id.clone()))?;
        if record.status != from {
            return Ok(false);
        }
        record.status = to;
        if from == RewardStatus::Pending && to == RewardStatus::Claimable {
            record.expires_at_ms = None;
        }
        Ok(true)
    }

    fn resolve_processing(
        &self,
        id: &RewardId,
        to: RewardStatus,
        rolled_up_to: Option<Wallet>,
        expires_at_ms: Option<u64>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let record = inner
            .rewards
            .get_mut(id)
            .ok_or_else(|| Error::UnknownReward(id.clone()))?;
        if record.status != RewardStatus::Processing {
            return Ok(false);
        }
        record.status = to;
        record.rolled_up_to = rolled_up_to;
        record.expires_at_ms = expires_at_ms;
        Ok(true)
    }

    fn claim_all_or_nothing(&self, wallet: &Wallet, ids: &[RewardId], now_ms: u64) -> Result<u64> {
        let mut inner = self.lock()?;
        // A repeated id settles once; it must not count twice in the total.
        let mut unique: Vec<&RewardId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        // Validate the whole batch before touching anything.
        let mut total = 0u64;
        for id in &unique {
            let record = inner
                .rewards
                .get(*id)
                .ok_or_else(|| Error::UnknownReward((*id).clone()))?;
            if &record.recipient != wallet {
                return Err(Error::NotRecipient {
                    wallet: wallet.clone(),
                    id: (*id).clone(),
                });
            }
            if record.status != RewardStatus::Claimable {
                return Err(Error::NotClaimable {
                    id: (*id).clone(),
                    status: record.status,
                });
            }
            total += record.amount;
        }
        for id in unique {
            if let Some(record) = inner.rewards.get_mut(id) {
                record.status = RewardStatus::Claimed;
                record.claimed_at_ms = Some(now_ms);
            }
        }
        Ok(total)
    }

    fn append_rollup(&self, entry: &RollupEntry) -> Result<()> {
        self.lock()?.rollups.push(entry.clone());
        Ok(())
    }

    fn rollups_for(&self, original: &RewardId) -> Result<Vec<RollupEntry>> {
        Ok(self
            .lock()?
            .rollups
            .iter()
            .filter(|e| &e.original_reward == original)
            .cloned()
            .collect())
    }

    fn push_deferred(&self, deferred: &DeferredPlacement) -> Result<()> {
        let mut inner = self.lock()?;
        let exists = inner
            .deferred
            .iter()
            .any(|d| d.root == deferred.root && d.member == deferred.member);
        if !exists {
            inner.deferred.push(deferred.clone());
        }
        Ok(())
    }

    fn deferred_placements(&self) -> Result<Vec<DeferredPlacement>> {
        Ok(self.lock()?.deferred.clone())
    }

    fn remove_deferred(&self, root: &Wallet, member: &Wallet) -> Result<()> {
        self.lock()?
            .deferred
            .retain(|d| !(&d.root == root && &d.member == member));
        Ok(())
    }
}
