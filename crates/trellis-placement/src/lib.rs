//! Matrix placement engine.
//!
//! Every activated member is inserted into the placement tree of their
//! referrer *and* of every upline ancestor of that referrer, bounded by the
//! configured depth. Within one tree the free slot is found breadth-first:
//! shallower layers fill completely before any deeper slot is used, parents
//! are visited in the order they entered the tree, and each parent's slots
//! fill L, M, R.
//!
//! Placement never takes a tree-wide lock. The store's slot uniqueness
//! constraint resolves races: on [`Error::SlotContention`] the engine
//! re-reads occupancy and searches again, up to a budget, after which the
//! single affected root is parked on the resumption queue. Placements into
//! other roots proceed independently.

use std::sync::Arc;
use tracing::{debug, warn};
use trellis_model::{
    DeferredPlacement, Error, MatrixConfig, Member, Placement, PlacementType, Position, Result,
    TeamStats, Wallet,
};
use trellis_store::Store;

/// One slot assignment, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementResult {
    pub root: Wallet,
    pub layer: u32,
    pub position: Position,
    pub parent: Wallet,
    pub placement_type: PlacementType,
}

impl From<&Placement> for PlacementResult {
    fn from(p: &Placement) -> Self {
        Self {
            root: p.root.clone(),
            layer: p.layer,
            position: p.position,
            parent: p.parent.clone(),
            placement_type: p.placement_type,
        }
    }
}

/// Outcome of placing one member across all upline trees.
///
/// Never a silent partial state: every affected root appears in exactly one
/// of the three lists.
#[derive(Debug, Clone, Default)]
pub struct PlacementOutcome {
    /// Slots assigned by this call.
    pub placed: Vec<PlacementResult>,
    /// Roots where the member already held a slot (idempotent retry).
    pub already_placed: Vec<Wallet>,
    /// Roots whose placement exhausted its retries and was queued for
    /// asynchronous resumption.
    pub deferred: Vec<Wallet>,
}

/// Breadth-first placement across every upline tree.
pub struct PlacementEngine<S> {
    store: Arc<S>,
    config: MatrixConfig,
}

impl<S: Store> PlacementEngine<S> {
    pub fn new(store: Arc<S>, config: MatrixConfig) -> Self {
        Self { store, config }
    }

    /// Seed a tree root that has no referrer (the network origin).
    ///
    /// Bypasses referral validation; everything else goes through
    /// [`place_member`](Self::place_member).
    pub fn bootstrap_root(&self, wallet: &Wallet, level: u8, now_ms: u64) -> Result<Member> {
        self.store.create_member(wallet, None, level, now_ms)
    }

    /// Place a newly activated member into the tree of their referrer and of
    /// every upline ancestor, bounded by the configured depth.
    ///
    /// Fails with [`Error::InvalidReferral`] before touching anything if the
    /// referral is malformed; otherwise each root resolves independently and
    /// the outcome lists where the member landed, which roots were already
    /// occupied by them, and which were deferred.
    pub fn place_member(
        &self,
        member: &Wallet,
        referrer: &Wallet,
        now_ms: u64,
    ) -> Result<PlacementOutcome> {
        if member == referrer {
            return Err(Error::InvalidReferral("self-referral".into()));
        }
        let referrer_member = self
            .store
            .member(referrer)?
            .ok_or_else(|| Error::InvalidReferral(format!("unknown referrer {referrer}")))?;
        if referrer_member.current_level == 0 {
            return Err(Error::InvalidReferral(format!(
                "referrer {referrer} is not activated"
            )));
        }
        if let Some(existing) = self.store.member(member)? {
            if existing.referrer.as_ref() != Some(referrer) {
                return Err(Error::InvalidReferral(format!(
                    "referrer of {member} is immutable"
                )));
            }
        } else {
            self.store.create_member(member, Some(referrer), 0, now_ms)?;
        }

        let mut outcome = PlacementOutcome::default();
        for root in self.upline_roots(referrer)? {
            if self.store.placement(&root, member)?.is_some() {
                outcome.already_placed.push(root);
                continue;
            }
            match self.place_into_root(&root, member, referrer, now_ms)? {
                RootOutcome::Placed(placement) => {
                    debug!(
                        member = %member,
                        root = %root,
                        layer = placement.layer,
                        position = %placement.position,
                        kind = %placement.placement_type,
                        "placed member"
                    );
                    outcome.placed.push(PlacementResult::from(&placement));
                }
                RootOutcome::AlreadyPlaced => outcome.already_placed.push(root),
                RootOutcome::Deferred => {
                    self.store.push_deferred(&DeferredPlacement {
                        root: root.clone(),
                        member: member.clone(),
                        referrer: referrer.clone(),
                        queued_at_ms: now_ms,
                    })?;
                    warn!(member = %member, root = %root, "placement deferred after retry budget");
                    outcome.deferred.push(root);
                }
            }
        }
        Ok(outcome)
    }

    /// Retry every placement parked on the resumption queue.
    pub fn resume_deferred(&self, now_ms: u64) -> Result<Vec<PlacementResult>> {
        let mut resumed = Vec::new();
        for entry in self.store.deferred_placements()? {
            match self.place_into_root(&entry.root, &entry.member, &entry.referrer, now_ms)? {
                RootOutcome::Placed(placement) => {
                    self.store.remove_deferred(&entry.root, &entry.member)?;
                    debug!(member = %entry.member, root = %entry.root, "resumed deferred placement");
                    resumed.push(PlacementResult::from(&placement));
                }
                RootOutcome::AlreadyPlaced => {
                    self.store.remove_deferred(&entry.root, &entry.member)?;
                }
                RootOutcome::Deferred => {}
            }
        }
        Ok(resumed)
    }

    /// Team statistics for a root's tree.
    pub fn team_stats(&self, root: &Wallet) -> Result<TeamStats> {
        let placements = self.store.placements_of_root(root)?;
        let mut stats = TeamStats {
            total_team_size: placements.len() as u64,
            direct_referrals: u64::from(self.store.direct_referral_count(root)?),
            ..TeamStats::default()
        };
        for placement in &placements {
            *stats.layer_counts.entry(placement.layer).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// The referrer plus their upline ancestors, nearest first, bounded by
    /// the configured depth. Ancestors beyond the bound are not processed.
    fn upline_roots(&self, referrer: &Wallet) -> Result<Vec<Wallet>> {
        let mut roots = Vec::new();
        let mut cursor = Some(referrer.clone());
        while let Some(wallet) = cursor {
            if roots.len() as u32 >= self.config.upline_depth {
                break;
            }
            match self.store.member(&wallet)? {
                Some(member) => {
                    roots.push(wallet);
                    cursor = member.referrer;
                }
                None => {
                    warn!(wallet = %wallet, "upline chain has a missing member; stopping walk");
                    break;
                }
            }
        }
        Ok(roots)
    }

    /// Optimistic placement into one root: search, insert, and on contention
    /// re-read and search again, up to the budget.
    fn place_into_root(
        &self,
        root: &Wallet,
        member: &Wallet,
        referrer: &Wallet,
        now_ms: u64,
    ) -> Result<RootOutcome> {
        for attempt in 0..=self.config.placement_retry_budget {
            let placement = match self.find_free_slot(root, member, referrer, now_ms)? {
                Some(placement) => placement,
                None => {
                    warn!(root = %root, "no free slot within the layer bound; deferring");
                    return Ok(RootOutcome::Deferred);
                }
            };
            match self.store.insert_placement(&placement) {
                Ok(()) => return Ok(RootOutcome::Placed(placement)),
                Err(Error::SlotContention { .. }) => {
                    debug!(root = %root, attempt, "slot contention; re-reading occupancy");
                }
                Err(Error::AlreadyPlaced { .. }) => return Ok(RootOutcome::AlreadyPlaced),
                Err(e) => return Err(e),
            }
        }
        Ok(RootOutcome::Deferred)
    }

    /// Breadth-first search for the first unoccupied slot of a root's tree.
    ///
    /// Layer by layer; within a layer, parents in insertion order; within a
    /// parent, L then M then R. Returns `None` when every slot down to the
    /// maximum layer is taken.
    fn find_free_slot(
        &self,
        root: &Wallet,
        member: &Wallet,
        referrer: &Wallet,
        now_ms: u64,
    ) -> Result<Option<Placement>> {
        for layer in 1..=self.config.max_layers {
            let parents = if layer == 1 {
                vec![root.clone()]
            } else {
                self.store.nodes_at_layer(root, layer - 1)?
            };
            if parents.is_empty() {
                // The previous layer has no nodes, so this layer (and all
                // deeper ones) cannot have free parents either.
                return Ok(None);
            }
            for parent in parents {
                let occupied = self.store.occupied_positions(root, &parent)?;
                for position in Position::ALL {
                    if occupied.contains(&position) {
                        continue;
                    }
                    let placement_type = if &parent == referrer {
                        PlacementType::Direct
                    } else {
                        PlacementType::Spillover
                    };
                    return Ok(Some(Placement {
                        root: root.clone(),
                        member: member.clone(),
                        layer,
                        position,
                        parent,
                        placement_type,
                        created_at_ms: now_ms,
                    }));
                }
            }
        }
        Ok(None)
    }
}

enum RootOutcome {
    Placed(Placement),
    AlreadyPlaced,
    Deferred,
}
