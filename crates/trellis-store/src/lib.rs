//! Persistence for the Trellis matrix core.
//!
//! Engines never lock around their algorithms; instead they rely on the
//! conditional-write primitives defined here and retry optimistically:
//!
//! - [`Store::insert_placement`] enforces both uniqueness constraints of a
//!   slot assignment (one slot per (root, member), one member per
//!   (root, layer, parent, position)) in a single atomic step and reports
//!   [`Error::SlotContention`] on the losing side of a race.
//! - [`Store::insert_reward`] is insert-if-absent on the deterministic
//!   reward id, which makes event replay a no-op.
//! - [`Store::transition_reward`] is the compare-and-set the rollup sweep
//!   uses to claim a pending record before acting on it, so overlapping
//!   sweeps never double-process.
//! - [`Store::claim_all_or_nothing`] settles a claim batch atomically.
//!
//! Two backends: [`MemoryStore`] for tests and embedding, [`RocksStore`] for
//! durable deployments.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use trellis_model::{
    DeferredPlacement, Member, Placement, Position, Result, RewardId, RewardRecord, RewardStatus,
    RollupEntry, Wallet,
};

/// Storage contract for the matrix core.
///
/// Methods are synchronous; async callers wrap them. Every method is safe to
/// call from concurrent threads.
pub trait Store: Send + Sync {
    // --- Members ---

    /// Create a member, allocating the next activation sequence number.
    /// Idempotent: if the wallet already exists the stored member is returned
    /// unchanged (the referrer is immutable once set).
    fn create_member(
        &self,
        wallet: &Wallet,
        referrer: Option<&Wallet>,
        level: u8,
        now_ms: u64,
    ) -> Result<Member>;

    fn member(&self, wallet: &Wallet) -> Result<Option<Member>>;

    /// Raise a member's level. Levels only increase; an equal or lower level
    /// leaves the record untouched and returns it as stored.
    fn raise_member_level(&self, wallet: &Wallet, level: u8) -> Result<Member>;

    /// Number of members directly referred by this wallet.
    fn direct_referral_count(&self, wallet: &Wallet) -> Result<u32>;

    // --- Placements ---

    /// Insert a slot assignment. Fails with [`trellis_model::Error::AlreadyPlaced`]
    /// if the member holds a slot in this root's tree, and with
    /// [`trellis_model::Error::SlotContention`] if the specific slot was taken
    /// by a concurrent writer. Checks and insert are one atomic step.
    fn insert_placement(&self, placement: &Placement) -> Result<()>;

    fn placement(&self, root: &Wallet, member: &Wallet) -> Result<Option<Placement>>;

    /// Every slot this member occupies, across all roots.
    fn placements_of_member(&self, member: &Wallet) -> Result<Vec<Placement>>;

    /// Every placement in one root's tree.
    fn placements_of_root(&self, root: &Wallet) -> Result<Vec<Placement>>;

    /// Members placed at a layer of a root's tree, in insertion order.
    /// Layer 0 is not stored; the root itself is the only layer-0 node.
    fn nodes_at_layer(&self, root: &Wallet, layer: u32) -> Result<Vec<Wallet>>;

    /// Which child positions under a parent node are taken.
    fn occupied_positions(&self, root: &Wallet, parent: &Wallet) -> Result<Vec<Position>>;

    // --- Rewards ---

    /// Insert a reward record if its id is absent. Returns `false` (leaving
    /// the stored record untouched) when the id already exists.
    fn insert_reward(&self, record: &RewardRecord) -> Result<bool>;

    fn reward(&self, id: &RewardId) -> Result<Option<RewardRecord>>;

    fn rewards_by_recipient(&self, wallet: &Wallet) -> Result<Vec<RewardRecord>>;

    /// Records produced by one (trigger, level) event, across all roots.
    fn rewards_by_trigger(&self, trigger: &Wallet, level: u8) -> Result<Vec<RewardRecord>>;

    /// Pending records whose expiry is at or before `now_ms`.
    fn expired_pending(&self, now_ms: u64) -> Result<Vec<RewardRecord>>;

    /// Compare-and-set on status. Returns whether the transition happened.
    /// Promoting `Pending -> Claimable` clears the expiry.
    fn transition_reward(
        &self,
        id: &RewardId,
        from: RewardStatus,
        to: RewardStatus,
    ) -> Result<bool>;

    /// Settle a record the sweep owns (status `Processing`): move it to
    /// `to`, record where it rolled up, and set or clear the expiry. Returns
    /// `false` if the record was not in `Processing`.
    fn resolve_processing(
        &self,
        id: &RewardId,
        to: RewardStatus,
        rolled_up_to: Option<Wallet>,
        expires_at_ms: Option<u64>,
    ) -> Result<bool>;

    /// Transition every referenced record `Claimable -> Claimed`, or none of
    /// them. Returns the total amount claimed, in minor units.
    fn claim_all_or_nothing(&self, wallet: &Wallet, ids: &[RewardId], now_ms: u64) -> Result<u64>;

    // --- Rollup audit trail ---

    /// Append-only.
    fn append_rollup(&self, entry: &RollupEntry) -> Result<()>;

    fn rollups_for(&self, original: &RewardId) -> Result<Vec<RollupEntry>>;

    // --- Deferred placement queue ---

    fn push_deferred(&self, deferred: &DeferredPlacement) -> Result<()>;

    fn deferred_placements(&self) -> Result<Vec<DeferredPlacement>>;

    fn remove_deferred(&self, root: &Wallet, member: &Wallet) -> Result<()>;
}
