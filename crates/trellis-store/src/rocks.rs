//! Durable store backed by RocksDB.
//!
//! Rows are JSON values under prefixed keys:
//!
//! ```text
//! member:{wallet}                     Member
//! direct:{referrer}:{member}          marker (direct-referral index)
//! seq:activation                      u64 counter
//! placement:{root}:{member}           Placement
//! pidx:{member}:{root}                Placement (by-member index; immutable rows)
//! slot:{root}:{parent}:{pos}          occupant wallet
//! node:{root}:{layer:02}:{n:08}       wallet (per-layer insertion order)
//! nodecnt:{root}:{layer:02}           u64 counter
//! reward:{id}                         RewardRecord
//! ridx_t:{trigger}:{level:03}:{id}    marker
//! ridx_r:{recipient}:{id}             marker
//! exp:{expires_at:016}:{id}           marker (pending-expiry index)
//! rollup:{original}:{new}             RollupEntry
//! deferred:{root}:{member}            DeferredPlacement
//! ```
//!
//! Wallet segments are %-escaped (`:` and `%`), so a wallet containing the
//! delimiter cannot bleed into a neighboring scan range.
//!
//! Conditional writes (unique placement insert, status compare-and-set,
//! all-or-nothing claim) hold a single writer mutex for their read-check-write
//! step; plain reads never take it. Engines layer optimistic retries on top.

use crate::Store;
use rocksdb::{Options, DB};
use std::path::Path;
use std::sync::Mutex;
use trellis_model::{
    DeferredPlacement, Error, Member, Placement, Position, Result, RewardId, RewardRecord,
    RewardStatus, RollupEntry, Wallet,
};

/// RocksDB-backed [`Store`].
pub struct RocksStore {
    db: DB,
    write: Mutex<()>,
}

/// Escape a wallet for use as a `:`-delimited key segment, so a wallet
/// containing `:` cannot bleed into a neighboring index's scan range.
fn seg(wallet: &Wallet) -> String {
    wallet.as_str().replace('%', "%25").replace(':', "%3a")
}

/// Key in the pending-expiry index. Zero-padded so key order is expiry order.
fn expiry_key(expires_at_ms: u64, id: &RewardId) -> String {
    format!("exp:{expires_at_ms:016}:{id}")
}

impl RocksStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            db,
            write: Mutex::new(()),
        })
    }

    fn write_lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write
            .lock()
            .map_err(|_| Error::Storage("rocks store write mutex poisoned".into()))
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key.as_bytes())
            .map_err(|e| Error::Storage(e.to_string()))
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_bytes(key)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.db
            .put(key.as_bytes(), data)
            .map_err(|e| Error::Storage(e.to_string()))
    }

    fn put_marker(&self, key: &str) -> Result<()> {
        self.db
            .put(key.as_bytes(), b"1")
            .map_err(|e| Error::Storage(e.to_string()))
    }

    /// Collect values under a key prefix, in key order.
    fn scan_json<T: serde::de::DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.db.prefix_iterator(prefix.as_bytes()) {
            let (key, value) = item.map_err(|e| Error::Storage(e.to_string()))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Collect the key suffixes under a prefix, in key order.
    fn scan_suffixes(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for item in self.db.prefix_iterator(prefix.as_bytes()) {
            let (key, _) = item.map_err(|e| Error::Storage(e.to_string()))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key_str = String::from_utf8_lossy(&key);
            if let Some(suffix) = key_str.strip_prefix(prefix) {
                out.push(suffix.to_string());
            }
        }
        Ok(out)
    }

    /// Read-increment-write a u64 counter. Callers hold the write lock.
    fn bump_counter(&self, key: &str) -> Result<u64> {
        let current = match self.get_bytes(key)? {
            Some(data) => String::from_utf8_lossy(&data)
                .parse::<u64>()
                .map_err(|_| Error::Storage(format!("corrupt counter at {key}")))?,
            None => 0,
        };
        let next = current + 1;
        self.db
            .put(key.as_bytes(), next.to_string().as_bytes())
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(next)
    }

    fn update_reward<F>(&self, id: &RewardId, update: F) -> Result<bool>
    where
        F: FnOnce(&mut RewardRecord) -> bool,
    {
        let _guard = self.write_lock()?;
        let key = format!("reward:{id}");
        let mut record: RewardRecord = self
            .get_json(&key)?
            .ok_or_else(|| Error::UnknownReward(id.clone()))?;
        if !update(&mut record) {
            return Ok(false);
        }
        self.put_json(&key, &record)?;
        Ok(true)
    }
}

impl Store for RocksStore {
    fn create_member(
        &self,
        wallet: &Wallet,
        referrer: Option<&Wallet>,
        level: u8,
        now_ms: u64,
    ) -> Result<Member> {
        let _guard = self.write_lock()?;
        let key = format!("member:{}", seg(wallet));
        if let Some(existing) = self.get_json::<Member>(&key)? {
            return Ok(existing);
        }
        let member = Member {
            wallet: wallet.clone(),
            referrer: referrer.cloned(),
            current_level: level,
            activation_seq: self.bump_counter("seq:activation")?,
            activated_at_ms: now_ms,
        };
        self.put_json(&key, &member)?;
        if let Some(referrer) = referrer {
            self.put_marker(&format!("direct:{}:{}", seg(referrer), seg(wallet)))?;
        }
        Ok(member)
    }

    fn member(&self, wallet: &Wallet) -> Result<Option<Member>> {
        self.get_json(&format!("member:{}", seg(wallet)))
    }

    fn raise_member_level(&self, wallet: &Wallet, level: u8) -> Result<Member> {
        let _guard = self.write_lock()?;
        let key = format!("member:{}", seg(wallet));
        let mut member: Member = self
            .get_json(&key)?
            .ok_or_else(|| Error::UnknownMember(wallet.clone()))?;
        if level > member.current_level {
            member.current_level = level;
            self.put_json(&key, &member)?;
        }
        Ok(member)
    }

    fn direct_referral_count(&self, wallet: &Wallet) -> Result<u32> {
        Ok(self.scan_suffixes(&format!("direct:{}:", seg(wallet)))?.len() as u32)
    }

    fn insert_placement(&self, placement: &Placement) -> Result<()> {
        let _guard = self.write_lock()?;
        let placement_key = format!("placement:{}:{}", seg(&placement.root), seg(&placement.member));
        if self.get_bytes(&placement_key)?.is_some() {
            return Err(Error::AlreadyPlaced {
                root: placement.root.clone(),
                member: placement.member.clone(),
            });
        }
        let slot_key = format!(
            "slot:{}:{}:{}",
            seg(&placement.root),
            seg(&placement.parent),
            placement.position
        );
        if self.get_bytes(&slot_key)?.is_some() {
            return Err(Error::SlotContention {
                root: placement.root.clone(),
            });
        }

        self.put_json(&placement_key, placement)?;
        self.put_json(
            &format!("pidx:{}:{}", seg(&placement.member), seg(&placement.root)),
            placement,
        )?;
        self.db
            .put(slot_key.as_bytes(), placement.member.as_str().as_bytes())
            .map_err(|e| Error::Storage(e.to_string()))?;

        let n = self.bump_counter(&format!(
            "nodecnt:{}:{:02}",
            seg(&placement.root),
            placement.layer
        ))?;
        self.db
            .put(
                format!(
                    "node:{}:{:02}:{:08}",
                    seg(&placement.root),
                    placement.layer,
                    n
                )
                .as_bytes(),
                placement.member.as_str().as_bytes(),
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn placement(&self, root: &Wallet, member: &Wallet) -> Result<Option<Placement>> {
        self.get_json(&format!("placement:{}:{}", seg(root), seg(member)))
    }

    fn placements_of_member(&self, member: &Wallet) -> Result<Vec<Placement>> {
        self.scan_json(&format!("pidx:{}:", seg(member)))
    }

    fn placements_of_root(&self, root: &Wallet) -> Result<Vec<Placement>> {
        let mut placements: Vec<Placement> = self.scan_json(&format!("placement:{}:", seg(root)))?;
        placements.sort_by_key(|p| (p.layer, p.created_at_ms));
        Ok(placements)
    }

    fn nodes_at_layer(&self, root: &Wallet, layer: u32) -> Result<Vec<Wallet>> {
        let mut nodes = Vec::new();
        let prefix = format!("node:{}:{layer:02}:", seg(root));
        for item in self.db.prefix_iterator(prefix.as_bytes()) {
            let (key, value) = item.map_err(|e| Error::Storage(e.to_string()))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            nodes.push(Wallet::new(String::from_utf8_lossy(&value)));
        }
        Ok(nodes)
    }

    fn occupied_positions(&self, root: &Wallet, parent: &Wallet) -> Result<Vec<Position>> {
        let mut occupied = Vec::new();
        for pos in Position::ALL {
            if self
                .get_bytes(&format!("slot:{}:{}:{pos}", seg(root), seg(parent)))?
                .is_some()
            {
                occupied.push(pos);
            }
        }
        Ok(occupied)
    }

    fn insert_reward(&self, record: &RewardRecord) -> Result<bool> {
        let _guard = self.write_lock()?;
        let key = format!("reward:{}", record.id);
        if self.get_bytes(&key)?.is_some() {
            return Ok(false);
        }
        self.put_json(&key, record)?;
        self.put_marker(&format!(
            "ridx_t:{}:{:03}:{}",
            seg(&record.trigger),
            record.trigger_level,
            record.id
        ))?;
        self.put_marker(&format!("ridx_r:{}:{}", seg(&record.recipient), record.id))?;
        if record.status == RewardStatus::Pending {
            if let Some(expires) = record.expires_at_ms {
                self.put_marker(&expiry_key(expires, &record.id))?;
            }
        }
        Ok(true)
    }

    fn reward(&self, id: &RewardId) -> Result<Option<RewardRecord>> {
        self.get_json(&format!("reward:{id}"))
    }

    fn rewards_by_recipient(&self, wallet: &Wallet) -> Result<Vec<RewardRecord>> {
        let mut records = Vec::new();
        for id in self.scan_suffixes(&format!("ridx_r:{}:", seg(wallet)))? {
            if let Some(record) = self.get_json(&format!("reward:{id}"))? {
                records.push(record);
            }
        }
        records.sort_by_key(|r: &RewardRecord| r.created_at_ms);
        Ok(records)
    }

    fn rewards_by_trigger(&self, trigger: &Wallet, level: u8) -> Result<Vec<RewardRecord>> {
        let mut records = Vec::new();
        for id in self.scan_suffixes(&format!("ridx_t:{}:{level:03}:", seg(trigger)))? {
            if let Some(record) = self.get_json(&format!("reward:{id}"))? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn expired_pending(&self, now_ms: u64) -> Result<Vec<RewardRecord>> {
        // The index is append-only; entries for records that settled or were
        // reopened with a different window are dropped as the scan meets
        // them. Key order yields expiry order.
        let mut expired = Vec::new();
        for suffix in self.scan_suffixes("exp:")? {
            let Some((ts, id)) = suffix.split_once(':') else {
                continue;
            };
            let ts: u64 = ts
                .parse()
                .map_err(|_| Error::Storage(format!("corrupt expiry index entry exp:{suffix}")))?;
            if ts > now_ms {
                break;
            }
            match self.get_json::<RewardRecord>(&format!("reward:{id}"))? {
                Some(r) if r.status == RewardStatus::Pending && r.expires_at_ms == Some(ts) => {
                    expired.push(r);
                }
                _ => {
                    self.db
                        .delete(format!("exp:{suffix}").as_bytes())
                        .map_err(|e| Error::Storage(e.to_string()))?;
                }
            }
        }
        Ok(expired)
    }

    fn transition_reward(
        &self,
        id: &RewardId,
        from: RewardStatus,
        to: RewardStatus,
    ) -> Result<bool> {
        self.update_reward(id, |record| {
            if record.status != from {
                return false;
            }
            record.status = to;
            if from == RewardStatus::Pending && to == RewardStatus::Claimable {
                record.expires_at_ms = None;
            }
            true
        })
    }

    fn resolve_processing(
        &self,
        id: &RewardId,
        to: RewardStatus,
        rolled_up_to: Option<Wallet>,
        expires_at_ms: Option<u64>,
    ) -> Result<bool> {
        let resolved = self.update_reward(id, |record| {
            if record.status != RewardStatus::Processing {
                return false;
            }
            record.status = to;
            record.rolled_up_to = rolled_up_to;
            record.expires_at_ms = expires_at_ms;
            true
        })?;
        // A reopened record gets a fresh index entry for its new window.
        if resolved && to == RewardStatus::Pending {
            if let Some(expires) = expires_at_ms {
                self.put_marker(&expiry_key(expires, id))?;
            }
        }
        Ok(resolved)
    }

    fn claim_all_or_nothing(&self, wallet: &Wallet, ids: &[RewardId], now_ms: u64) -> Result<u64> {
        let _guard = self.write_lock()?;
        // A repeated id settles once; it must not count twice in the total.
        let mut unique: Vec<&RewardId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        // Validate the whole batch before writing anything.
        let mut records = Vec::with_capacity(unique.len());
        let mut total = 0u64;
        for id in unique {
            let record: RewardRecord = self
                .get_json(&format!("reward:{id}"))?
                .ok_or_else(|| Error::UnknownReward(id.clone()))?;
            if &record.recipient != wallet {
                return Err(Error::NotRecipient {
                    wallet: wallet.clone(),
                    id: id.clone(),
                });
            }
            if record.status != RewardStatus::Claimable {
                return Err(Error::NotClaimable {
                    id: id.clone(),
                    status: record.status,
                });
            }
            total += record.amount;
            records.push(record);
        }
        for mut record in records {
            record.status = RewardStatus::Claimed;
            record.claimed_at_ms = Some(now_ms);
            self.put_json(&format!("reward:{}", record.id), &record)?;
        }
        Ok(total)
    }

    fn append_rollup(&self, entry: &RollupEntry) -> Result<()> {
        self.put_json(
            &format!("rollup:{}:{}", entry.original_reward, entry.new_reward),
            entry,
        )
    }

    fn rollups_for(&self, original: &RewardId) -> Result<Vec<RollupEntry>> {
        self.scan_json(&format!("rollup:{original}:"))
    }

    fn push_deferred(&self, deferred: &DeferredPlacement) -> Result<()> {
        self.put_json(
            &format!("deferred:{}:{}", seg(&deferred.root), seg(&deferred.member)),
            deferred,
        )
    }

    fn deferred_placements(&self) -> Result<Vec<DeferredPlacement>> {
        self.scan_json("deferred:")
    }

    fn remove_deferred(&self, root: &Wallet, member: &Wallet) -> Result<()> {
        self.db
            .delete(format!("deferred:{}:{}", seg(root), seg(member)).as_bytes())
            .map_err(|e| Error::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trellis_model::PlacementType;

    fn placement(root: &str, member: &str, layer: u32, parent: &str, pos: Position) -> Placement {
        Placement {
            root: Wallet::new(root),
            member: Wallet::new(member),
            layer,
            position: pos,
            parent: Wallet::new(parent),
            placement_type: PlacementType::Spillover,
            created_at_ms: 7,
        }
    }

    #[test]
    fn member_roundtrip_and_seq() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();

        let a = store.create_member(&Wallet::new("a"), None, 1, 5).unwrap();
        assert_eq!(a.activation_seq, 1);
        let b = store
            .create_member(&Wallet::new("b"), Some(&Wallet::new("a")), 0, 6)
            .unwrap();
        assert_eq!(b.activation_seq, 2);

        let loaded = store.member(&Wallet::new("b")).unwrap().unwrap();
        assert_eq!(loaded, b);
        assert_eq!(store.direct_referral_count(&Wallet::new("a")).unwrap(), 1);
    }

    #[test]
    fn placement_uniqueness_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store
                .insert_placement(&placement("root", "b", 1, "root", Position::L))
                .unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        let err = store
            .insert_placement(&placement("root", "c", 1, "root", Position::L))
            .unwrap_err();
        assert!(matches!(err, Error::SlotContention { .. }));

        let order = store.nodes_at_layer(&Wallet::new("root"), 1).unwrap();
        assert_eq!(order, vec![Wallet::new("b")]);
    }

    #[test]
    fn by_member_index_sees_all_roots() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store
            .insert_placement(&placement("r1", "b", 1, "r1", Position::L))
            .unwrap();
        store
            .insert_placement(&placement("r2", "b", 2, "x", Position::M))
            .unwrap();

        let placements = store.placements_of_member(&Wallet::new("b")).unwrap();
        assert_eq!(placements.len(), 2);
    }

    #[test]
    fn reward_cas_and_expiry_scan() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let id = RewardId::derive(&Wallet::new("t"), 2, &Wallet::new("r"), &Wallet::new("r"));
        let record = RewardRecord {
            id: id.clone(),
            recipient: Wallet::new("r"),
            trigger: Wallet::new("t"),
            trigger_level: 2,
            root: Wallet::new("r"),
            layer: 1,
            required_level: 1,
            recipient_level_at_trigger: 0,
            amount: 15_000,
            status: RewardStatus::Pending,
            created_at_ms: 0,
            expires_at_ms: Some(100),
            rolled_up_to: None,
            claimed_at_ms: None,
        };
        assert!(store.insert_reward(&record).unwrap());
        assert!(!store.insert_reward(&record).unwrap());

        assert!(store.expired_pending(99).unwrap().is_empty());
        assert_eq!(store.expired_pending(100).unwrap().len(), 1);

        assert!(store
            .transition_reward(&id, RewardStatus::Pending, RewardStatus::Processing)
            .unwrap());
        assert!(store.expired_pending(100).unwrap().is_empty());

        assert!(store
            .resolve_processing(&id, RewardStatus::ExpiredTerminal, None, None)
            .unwrap());
        let settled = store.reward(&id).unwrap().unwrap();
        assert_eq!(settled.status, RewardStatus::ExpiredTerminal);

        let by_trigger = store.rewards_by_trigger(&Wallet::new("t"), 2).unwrap();
        assert_eq!(by_trigger.len(), 1);
        assert_eq!(by_trigger[0].status, RewardStatus::ExpiredTerminal);
    }

    #[test]
    fn delimiter_in_wallet_does_not_bleed_across_scans() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.create_member(&Wallet::new("a"), None, 1, 0).unwrap();
        store.create_member(&Wallet::new("a:b"), None, 1, 0).unwrap();
        store
            .create_member(&Wallet::new("m1"), Some(&Wallet::new("a")), 0, 1)
            .unwrap();
        store
            .create_member(&Wallet::new("m2"), Some(&Wallet::new("a:b")), 0, 2)
            .unwrap();

        // Unescaped, "a:b"'s entry would land inside the "direct:a:" range.
        assert_eq!(store.direct_referral_count(&Wallet::new("a")).unwrap(), 1);
        assert_eq!(store.direct_referral_count(&Wallet::new("a:b")).unwrap(), 1);

        store
            .insert_placement(&placement("a", "m1", 1, "a", Position::L))
            .unwrap();
        assert!(store
            .placements_of_root(&Wallet::new("a:b"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn expiry_index_tracks_reopened_windows() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let id = RewardId::derive(&Wallet::new("t"), 1, &Wallet::new("r"), &Wallet::new("r"));
        store
            .insert_reward(&RewardRecord {
                id: id.clone(),
                recipient: Wallet::new("r"),
                trigger: Wallet::new("t"),
                trigger_level: 1,
                root: Wallet::new("r"),
                layer: 1,
                required_level: 1,
                recipient_level_at_trigger: 0,
                amount: 10_000,
                status: RewardStatus::Pending,
                created_at_ms: 0,
                expires_at_ms: Some(100),
                rolled_up_to: None,
                claimed_at_ms: None,
            })
            .unwrap();

        assert!(store
            .transition_reward(&id, RewardStatus::Pending, RewardStatus::Processing)
            .unwrap());
        assert!(store
            .resolve_processing(&id, RewardStatus::Pending, None, Some(200))
            .unwrap());

        // The old window's entry is stale and dropped; only the new window
        // fires, and it keeps firing until the record settles.
        assert!(store.expired_pending(150).unwrap().is_empty());
        assert_eq!(store.expired_pending(200).unwrap().len(), 1);
        assert_eq!(store.expired_pending(250).unwrap().len(), 1);

        assert!(store
            .transition_reward(&id, RewardStatus::Pending, RewardStatus::Claimable)
            .unwrap());
        assert!(store.expired_pending(250).unwrap().is_empty());
    }

    #[test]
    fn repeated_id_in_claim_batch_counts_once() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let wallet = Wallet::new("r");
        let id = RewardId::derive(&Wallet::new("t"), 1, &wallet, &wallet);
        store
            .insert_reward(&RewardRecord {
                id: id.clone(),
                recipient: wallet.clone(),
                trigger: Wallet::new("t"),
                trigger_level: 1,
                root: wallet.clone(),
                layer: 1,
                required_level: 1,
                recipient_level_at_trigger: 1,
                amount: 5_000,
                status: RewardStatus::Claimable,
                created_at_ms: 0,
                expires_at_ms: None,
                rolled_up_to: None,
                claimed_at_ms: None,
            })
            .unwrap();

        let total = store
            .claim_all_or_nothing(&wallet, &[id.clone(), id.clone()], 10)
            .unwrap();
        assert_eq!(total, 5_000);
        let record = store.reward(&id).unwrap().unwrap();
        assert_eq!(record.status, RewardStatus::Claimed);
    }
}
