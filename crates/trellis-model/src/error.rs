//! Error types shared across the Trellis engines.

use crate::types::{RewardId, RewardStatus, Wallet};
use thiserror::Error;

/// Result type for Trellis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the matrix core.
///
/// Transient classes (`SlotContention`) are retried internally by the engines
/// and only surface once budgets are exhausted. Deferrals (a root queued for
/// resumption, an exhausted rollup chain) are outcome variants on the engine
/// results, not errors: callers always receive an explicit per-root /
/// per-record outcome.
#[derive(Debug, Error)]
pub enum Error {
    /// Self-referral, missing or non-activated referrer. Rejected before any
    /// placement happens.
    #[error("invalid referral: {0}")]
    InvalidReferral(String),

    /// Transient race on one specific slot of one root's tree.
    #[error("slot contention in matrix rooted at {root}")]
    SlotContention { root: Wallet },

    /// The member already occupies a slot in this root's tree.
    #[error("{member} is already placed in the matrix rooted at {root}")]
    AlreadyPlaced { root: Wallet, member: Wallet },

    /// A dependency lookup (level, referral count) kept failing; the
    /// qualification is neither granted nor denied.
    #[error("qualification indeterminate for {wallet}: {reason}")]
    QualificationIndeterminate { wallet: Wallet, reason: String },

    #[error("unknown member: {0}")]
    UnknownMember(Wallet),

    #[error("unknown reward: {0}")]
    UnknownReward(RewardId),

    #[error("unknown level: {0}")]
    UnknownLevel(u8),

    /// A claim referenced a record that is not claimable. The whole claim is
    /// rejected; no record in the batch changes.
    #[error("reward {id} is {status}, not claimable")]
    NotClaimable { id: RewardId, status: RewardStatus },

    /// A claim referenced a record belonging to a different wallet.
    #[error("{wallet} is not the recipient of reward {id}")]
    NotRecipient { wallet: Wallet, id: RewardId },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
