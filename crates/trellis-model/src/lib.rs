//! Trellis domain model.
//!
//! Trellis operates a referral-driven membership network. Every activated
//! member occupies one slot in the placement tree of *each* of their upline
//! ancestors, and paid level upgrades fan rewards out across those trees.
//!
//! This crate holds the shared vocabulary of the engines:
//!
//! - [`types`] - wallets, members, placements, reward records and their
//!   status machine
//! - [`config`] - the data-driven qualification and level schedules plus the
//!   engine constants (depths, windows, retry budgets)
//! - [`error`] - the single error enum shared across the workspace
//! - [`events`] - reward change events handed to downstream consumers
//!
//! The engines themselves live in `trellis-placement`, `trellis-rewards`,
//! `trellis-rollup` and `trellis-ledger`; persistence behind the `Store`
//! trait in `trellis-store`.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::{
    ActivationEvent, LevelSchedule, LevelTier, MatrixConfig, QualificationRule,
    QualificationSchedule, DEFAULT_PENDING_WINDOW_MS,
};
pub use error::{Error, Result};
pub use events::RewardEvent;
pub use types::{
    DeferredPlacement, Member, Placement, PlacementType, Position, RewardId, RewardRecord,
    RewardStatus, RollupEntry, RollupReason, TeamStats, Wallet, SLOTS_PER_NODE,
};

/// Milliseconds since the Unix epoch.
///
/// Engines take explicit `now_ms` arguments so tests can drive time; this is
/// the production clock callers pass in.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
