//! Core domain types: members, placements, reward records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Width of every node in a placement tree. Fixed by the matrix design:
/// each node has exactly an L, M and R child slot.
pub const SLOTS_PER_NODE: usize = 3;

/// A wallet identifier, normalized to lowercase on construction.
///
/// Wallets arrive from the payment collaborator in mixed case; every lookup
/// key in the system is the lowercased form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Wallet(String);

impl Wallet {
    /// Create a wallet id, lowercasing the input.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_lowercase())
    }

    /// The normalized string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Wallet {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Position of a child under its parent node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Position {
    L,
    M,
    R,
}

impl Position {
    /// All positions in fill order. Placement always tries L, then M, then R.
    pub const ALL: [Position; SLOTS_PER_NODE] = [Position::L, Position::M, Position::R];

    /// Single-letter form used in storage keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Position::L => "L",
            Position::M => "M",
            Position::R => "R",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A member of the network. Created once, on first paid level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub wallet: Wallet,
    /// Referrer wallet. Immutable once set; `None` only for bootstrap roots.
    pub referrer: Option<Wallet>,
    /// Current paid level. Only ever increases.
    pub current_level: u8,
    /// Global activation order, allocated by the store's atomic counter.
    pub activation_seq: u64,
    pub activated_at_ms: u64,
}

/// How a member landed in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementType {
    /// Placed directly under their literal referrer.
    Direct,
    /// Placed under a deeper node because the referrer's capacity was full.
    Spillover,
}

impl fmt::Display for PlacementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementType::Direct => f.write_str("direct"),
            PlacementType::Spillover => f.write_str("spillover"),
        }
    }
}

/// A member's slot within one root's tree.
///
/// Composite key is (root, member): a member occupies at most one slot per
/// root, but holds slots in many roots' trees (one per upline ancestor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub root: Wallet,
    pub member: Wallet,
    /// Depth within the root's tree. Direct children of the root are layer 1.
    pub layer: u32,
    pub position: Position,
    /// The node directly above this slot, within the same root's tree.
    pub parent: Wallet,
    pub placement_type: PlacementType,
    pub created_at_ms: u64,
}

/// A placement that exhausted its contention retries and was queued for
/// asynchronous resumption. Other roots of the same activation proceed
/// independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredPlacement {
    pub root: Wallet,
    pub member: Wallet,
    pub referrer: Wallet,
    pub queued_at_ms: u64,
}

/// Reward record lifecycle.
///
/// ```text
/// pending ----> processing ----> rolled_up
///    |              |----------> expired_terminal
///    |              '----------> pending        (lookup indeterminate, retried)
///    '--(qualified at creation)
/// claimable --> claimed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    /// Recipient not yet qualified; expires unless they qualify in time.
    Pending,
    /// Interim state while a scheduler run owns the record.
    Processing,
    /// Qualified and waiting to be claimed.
    Claimable,
    Claimed,
    /// Reassigned to an upline ancestor; see `rolled_up_to`.
    RolledUp,
    /// No qualifying ancestor existed. Reportable, never silently dropped.
    ExpiredTerminal,
}

impl fmt::Display for RewardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RewardStatus::Pending => "pending",
            RewardStatus::Processing => "processing",
            RewardStatus::Claimable => "claimable",
            RewardStatus::Claimed => "claimed",
            RewardStatus::RolledUp => "rolled_up",
            RewardStatus::ExpiredTerminal => "expired_terminal",
        };
        f.write_str(s)
    }
}

/// Deterministic reward record id.
///
/// Derived from the identifying tuple so that replaying the same level-up
/// event regenerates the same id; the store's insert-if-absent on this id is
/// the idempotency constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RewardId(String);

impl RewardId {
    /// Derive the id for a (trigger, level, root, recipient) tuple.
    #[must_use]
    pub fn derive(trigger: &Wallet, level: u8, root: &Wallet, recipient: &Wallet) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(trigger.as_str().as_bytes());
        hasher.update(&[0, level]);
        hasher.update(root.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(recipient.as_str().as_bytes());
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RewardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One reward owed (or paid) to one recipient for one level-up event.
///
/// Amounts are integer minor currency units throughout; no floats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub id: RewardId,
    pub recipient: Wallet,
    /// The member whose level-up triggered this reward.
    pub trigger: Wallet,
    /// The level the trigger reached.
    pub trigger_level: u8,
    /// The matrix root whose tree produced this reward.
    pub root: Wallet,
    /// The trigger's layer in that tree.
    pub layer: u32,
    pub required_level: u8,
    pub recipient_level_at_trigger: u8,
    pub amount: u64,
    pub status: RewardStatus,
    pub created_at_ms: u64,
    /// Set only while the record is pending.
    pub expires_at_ms: Option<u64>,
    pub rolled_up_to: Option<Wallet>,
    pub claimed_at_ms: Option<u64>,
}

impl RewardRecord {
    /// True once the record can never change again.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            RewardStatus::Claimed | RewardStatus::RolledUp | RewardStatus::ExpiredTerminal
        )
    }
}

/// Why a reward was reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupReason {
    /// The pending window elapsed without the recipient qualifying.
    PendingExpired,
}

/// Append-only audit trail entry linking an original reward to its successor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEntry {
    pub original_reward: RewardId,
    pub new_reward: RewardId,
    pub reason: RollupReason,
    pub at_ms: u64,
}

/// Derived per-root statistics for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamStats {
    pub total_team_size: u64,
    pub direct_referrals: u64,
    pub layer_counts: BTreeMap<u32, u64>,
}
