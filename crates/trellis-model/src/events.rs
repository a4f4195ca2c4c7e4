//! Reward change events for downstream consumers.
//!
//! The core is invoked as pure operations; dashboards and notification
//! services learn about state changes from these events, which the engines
//! return alongside their results. Delivery is owned by the caller.

use crate::types::{RewardId, RewardStatus, Wallet};
use serde::{Deserialize, Serialize};

/// A change to reward state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RewardEvent {
    /// A reward record was created for a level-up event.
    Created {
        id: RewardId,
        recipient: Wallet,
        trigger: Wallet,
        root: Wallet,
        layer: u32,
        amount: u64,
        status: RewardStatus,
        at_ms: u64,
    },

    /// A pending reward became claimable because its recipient qualified.
    Qualified {
        id: RewardId,
        recipient: Wallet,
        amount: u64,
        at_ms: u64,
    },

    /// An expired pending reward was reassigned up the chain.
    RolledUp {
        original: RewardId,
        successor: RewardId,
        from: Wallet,
        to: Wallet,
        amount: u64,
        at_ms: u64,
    },

    /// No qualifying ancestor existed; flagged for manual review.
    ExpiredTerminal {
        id: RewardId,
        recipient: Wallet,
        amount: u64,
        at_ms: u64,
    },

    /// A claimable reward was paid out.
    Claimed {
        id: RewardId,
        recipient: Wallet,
        amount: u64,
        at_ms: u64,
    },
}
