//! Qualification evaluation against an external member directory.
//!
//! The level and direct-referral count of a wallet live outside this crate
//! (the store, or a remote service in larger deployments). Lookups that keep
//! failing make the qualification indeterminate; an indeterminate
//! qualification is never treated as a yes or a no.

use std::sync::Arc;
use tracing::debug;
use trellis_model::{Error, QualificationRule, QualificationSchedule, Result, Wallet};
use trellis_store::Store;

/// Outward queries the reward engines issue.
pub trait MemberDirectory: Send + Sync {
    /// Current paid level of a wallet. Zero for members that never activated.
    fn current_level(&self, wallet: &Wallet) -> Result<u8>;

    /// Number of members directly referred by a wallet.
    fn direct_referral_count(&self, wallet: &Wallet) -> Result<u32>;
}

/// Directory backed by the local store.
pub struct StoreDirectory<S> {
    store: Arc<S>,
}

impl<S> StoreDirectory<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: Store> MemberDirectory for StoreDirectory<S> {
    fn current_level(&self, wallet: &Wallet) -> Result<u8> {
        Ok(self
            .store
            .member(wallet)?
            .map(|m| m.current_level)
            .unwrap_or(0))
    }

    fn direct_referral_count(&self, wallet: &Wallet) -> Result<u32> {
        self.store.direct_referral_count(wallet)
    }
}

/// The answer for one (wallet, layer) qualification check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qualification {
    pub qualified: bool,
    /// The wallet's level at evaluation time.
    pub level: u8,
    /// The rule that was applied.
    pub rule: QualificationRule,
}

/// Evaluates the per-layer qualification rules with bounded lookup retries.
pub struct Qualifier<D> {
    directory: D,
    schedule: QualificationSchedule,
    retry_budget: u32,
}

impl<D: MemberDirectory> Qualifier<D> {
    pub fn new(directory: D, schedule: QualificationSchedule, retry_budget: u32) -> Self {
        Self {
            directory,
            schedule,
            retry_budget,
        }
    }

    /// Whether `wallet` currently satisfies the rule for `layer`.
    ///
    /// Fails with [`Error::QualificationIndeterminate`] when a lookup keeps
    /// failing past the retry budget. Callers defer and retry later; they
    /// never substitute a guessed answer.
    pub fn evaluate(&self, wallet: &Wallet, layer: u32) -> Result<Qualification> {
        let rule = self.schedule.rule_for(layer);
        let level = self.lookup(wallet, "level", || self.directory.current_level(wallet))?;
        let mut qualified = level >= rule.required_level;
        if let Some(min) = rule.min_direct_referrals {
            if qualified {
                let count = self.lookup(wallet, "direct referral count", || {
                    self.directory.direct_referral_count(wallet)
                })?;
                qualified = count >= min;
            }
        }
        Ok(Qualification {
            qualified,
            level,
            rule,
        })
    }

    fn lookup<T>(&self, wallet: &Wallet, what: &str, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut last = None;
        for attempt in 0..=self.retry_budget {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(wallet = %wallet, what, attempt, error = %e, "directory lookup failed");
                    last = Some(e);
                }
            }
        }
        Err(Error::QualificationIndeterminate {
            wallet: wallet.clone(),
            reason: match last {
                Some(e) => format!("{what} lookup failed after {} attempts: {e}", self.retry_budget + 1),
                None => format!("{what} lookup failed"),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedDirectory {
        level: u8,
        referrals: u32,
    }

    impl MemberDirectory for FixedDirectory {
        fn current_level(&self, _: &Wallet) -> Result<u8> {
            Ok(self.level)
        }
        fn direct_referral_count(&self, _: &Wallet) -> Result<u32> {
            Ok(self.referrals)
        }
    }

    /// Fails `failures` times, then answers.
    struct FlakyDirectory {
        failures: u32,
        calls: AtomicU32,
    }

    impl MemberDirectory for FlakyDirectory {
        fn current_level(&self, _: &Wallet) -> Result<u8> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(Error::Storage("directory offline".into()))
            } else {
                Ok(3)
            }
        }
        fn direct_referral_count(&self, _: &Wallet) -> Result<u32> {
            Ok(0)
        }
    }

    #[test]
    fn level_rule_compares_against_layer() {
        let qualifier = Qualifier::new(
            FixedDirectory {
                level: 2,
                referrals: 0,
            },
            QualificationSchedule::standard(),
            0,
        );
        let w = Wallet::new("a");
        assert!(qualifier.evaluate(&w, 1).unwrap().qualified);
        assert!(qualifier.evaluate(&w, 2).unwrap().qualified);
        assert!(!qualifier.evaluate(&w, 3).unwrap().qualified);
    }

    #[test]
    fn referral_override_gates_qualification() {
        let schedule = QualificationSchedule::standard().with_rule(QualificationRule {
            layer: 2,
            required_level: 2,
            min_direct_referrals: Some(5),
        });
        let qualifier = Qualifier::new(
            FixedDirectory {
                level: 9,
                referrals: 4,
            },
            schedule,
            0,
        );
        let result = qualifier.evaluate(&Wallet::new("a"), 2).unwrap();
        assert!(!result.qualified);
        assert_eq!(result.level, 9);
    }

    #[test]
    fn lookups_retry_within_budget() {
        let qualifier = Qualifier::new(
            FlakyDirectory {
                failures: 2,
                calls: AtomicU32::new(0),
            },
            QualificationSchedule::standard(),
            3,
        );
        let result = qualifier.evaluate(&Wallet::new("a"), 3).unwrap();
        assert!(result.qualified);
    }

    #[test]
    fn exhausted_retries_are_indeterminate() {
        let qualifier = Qualifier::new(
            FlakyDirectory {
                failures: 10,
                calls: AtomicU32::new(0),
            },
            QualificationSchedule::standard(),
            2,
        );
        let err = qualifier.evaluate(&Wallet::new("a"), 1).unwrap_err();
        assert!(matches!(err, Error::QualificationIndeterminate { .. }));
    }
}
