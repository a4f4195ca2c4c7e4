//! Test harness wiring the four engines over one store.
//!
//! Mirrors how a service layer drives the core: an activation event from the
//! payment collaborator first places the member (on their first level), then
//! distributes rewards for the level reached.

use std::sync::Arc;
use trellis_ledger::Ledger;
use trellis_model::{
    ActivationEvent, Error, LevelSchedule, MatrixConfig, QualificationSchedule, Result, Wallet,
};
use trellis_placement::{PlacementEngine, PlacementOutcome};
use trellis_rewards::{DistributionOutcome, RewardEngine, StoreDirectory};
use trellis_rollup::RollupEngine;
use trellis_store::Store;

/// What one activation event produced.
#[derive(Debug)]
pub struct ActivationOutcome {
    /// `None` when the member was already placed (an upgrade, not a join).
    pub placement: Option<PlacementOutcome>,
    pub distribution: DistributionOutcome,
}

/// All four engines over a shared store.
pub struct Network<S> {
    pub store: Arc<S>,
    pub placement: PlacementEngine<S>,
    pub rewards: RewardEngine<S, StoreDirectory<S>>,
    pub rollup: RollupEngine<S, StoreDirectory<S>>,
    pub ledger: Ledger<S>,
}

impl<S: Store> Network<S> {
    pub fn new(store: Arc<S>, config: MatrixConfig) -> Self {
        Self {
            placement: PlacementEngine::new(store.clone(), config.clone()),
            rewards: RewardEngine::new(
                store.clone(),
                StoreDirectory::new(store.clone()),
                &config,
                QualificationSchedule::standard(),
                LevelSchedule::standard(),
            ),
            rollup: RollupEngine::new(
                store.clone(),
                StoreDirectory::new(store.clone()),
                &config,
                QualificationSchedule::standard(),
            ),
            ledger: Ledger::new(store.clone()),
            store,
        }
    }

    /// Seed a bootstrap root at the given level.
    pub fn bootstrap(&self, wallet: &Wallet, level: u8, now_ms: u64) -> Result<()> {
        self.placement.bootstrap_root(wallet, level, now_ms)?;
        Ok(())
    }

    /// Apply one activation event: place on first join, then distribute.
    pub fn activate(&self, event: &ActivationEvent, now_ms: u64) -> Result<ActivationOutcome> {
        let placement = if self.store.member(&event.wallet)?.is_none() {
            let referrer = event
                .referrer
                .as_ref()
                .ok_or_else(|| Error::InvalidReferral("activation without referrer".into()))?;
            Some(self.placement.place_member(&event.wallet, referrer, now_ms)?)
        } else {
            None
        };
        let distribution =
            self.rewards
                .distribute_rewards(&event.wallet, event.new_level, event.payment_minor, now_ms)?;
        Ok(ActivationOutcome {
            placement,
            distribution,
        })
    }
}

/// Event constructor for tests.
pub fn activation(
    wallet: &Wallet,
    new_level: u8,
    referrer: Option<&Wallet>,
    payment_minor: u64,
) -> ActivationEvent {
    ActivationEvent {
        wallet: wallet.clone(),
        new_level,
        referrer: referrer.cloned(),
        payment_minor,
        transaction_reference: format!("tx-{wallet}-{new_level}"),
    }
}
