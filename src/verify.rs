//! Purchase-eligibility verification.
//!
//! Features:
//! - `VerificationStrategy` objects dispatched by tier selector through a
//!   `VerifierSet` registry, so new policies are registered rather than
//!   patched into the sale engine
//! - Built-ins: closed, open-to-everyone, address allow-list, stake snapshot
//! - `StakingLedger` collaborator for point-in-time stake queries

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tier::{StakeCondition, TierId, VerificationType};
use crate::{Address, Balance};

/// Historical point at which stake is sampled.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Checkpoint {
    Block(u64),
    Timestamp(u64),
}

/// Verification failures; surfaced as purchase aborts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("tier is closed to purchases")]
    Closed,
    #[error("address not verified for this tier")]
    NotVerified,
    #[error("stake {stake} outside [{min}, {max}] at {checkpoint:?}")]
    StakeOutOfRange {
        stake: Balance,
        min: Balance,
        /// Zero means unbounded.
        max: Balance,
        checkpoint: Checkpoint,
    },
    #[error("tier has no stake condition")]
    MissingStakeCondition,
    #[error("no strategy registered for {0:?}")]
    NoStrategy(VerificationType),
    #[error("stake query failed: {0}")]
    Oracle(String),
}

/// Point-in-time balance query against an external staking ledger.
pub trait StakingLedger: Send + Sync + 'static {
    fn stake_at(&self, who: Address, checkpoint: Checkpoint) -> Result<Balance, VerifyError>;
}

/// What a strategy may inspect about the purchase attempt.
pub struct VerifyContext<'a> {
    pub buyer: Address,
    pub tier_id: TierId,
    pub stake_condition: Option<&'a StakeCondition>,
    /// Whether the one-way verification flag is set for (buyer, tier).
    pub address_approved: bool,
}

/// One eligibility policy. Implementations must be side-effect free.
pub trait VerificationStrategy: Send + Sync + 'static {
    fn check(&self, ctx: &VerifyContext<'_>) -> Result<(), VerifyError>;
}

struct Closed;
impl VerificationStrategy for Closed {
    fn check(&self, _ctx: &VerifyContext<'_>) -> Result<(), VerifyError> {
        Err(VerifyError::Closed)
    }
}

struct Everyone;
impl VerificationStrategy for Everyone {
    fn check(&self, _ctx: &VerifyContext<'_>) -> Result<(), VerifyError> {
        Ok(())
    }
}

struct ByAddress;
impl VerificationStrategy for ByAddress {
    fn check(&self, ctx: &VerifyContext<'_>) -> Result<(), VerifyError> {
        if ctx.address_approved {
            Ok(())
        } else {
            Err(VerifyError::NotVerified)
        }
    }
}

/// Accepts iff every configured checkpoint sample lies within the tier's
/// stake bounds. Sampling several checkpoints defeats flash staking, so a
/// single out-of-range sample rejects.
struct ByStake {
    oracle: Arc<dyn StakingLedger>,
}

impl VerificationStrategy for ByStake {
    fn check(&self, ctx: &VerifyContext<'_>) -> Result<(), VerifyError> {
        let cond = ctx
            .stake_condition
            .ok_or(VerifyError::MissingStakeCondition)?;
        for cp in &cond.checkpoints {
            let stake = self.oracle.stake_at(ctx.buyer, *cp)?;
            let below = stake < cond.min_stake;
            let above = cond.max_stake != 0 && stake > cond.max_stake;
            if below || above {
                return Err(VerifyError::StakeOutOfRange {
                    stake,
                    min: cond.min_stake,
                    max: cond.max_stake,
                    checkpoint: *cp,
                });
            }
        }
        Ok(())
    }
}

/// Strategy registry keyed by tier selector.
#[derive(Clone, Default)]
pub struct VerifierSet {
    strategies: HashMap<VerificationType, Arc<dyn VerificationStrategy>>,
}

impl VerifierSet {
    /// Registry with the three stake-free built-ins. `VerificationType::None`
    /// maps to the always-reject strategy.
    pub fn standard() -> Self {
        let mut s = Self::default();
        s.register(VerificationType::None, Arc::new(Closed));
        s.register(VerificationType::Everyone, Arc::new(Everyone));
        s.register(VerificationType::ByAddress, Arc::new(ByAddress));
        s
    }

    /// Add the stake-snapshot strategy backed by `oracle`.
    pub fn with_stake(mut self, oracle: Arc<dyn StakingLedger>) -> Self {
        self.register(VerificationType::ByStake, Arc::new(ByStake { oracle }));
        self
    }

    /// Register or replace a strategy for `ty`. New policies use
    /// `VerificationType::Custom(tag)`.
    pub fn register(&mut self, ty: VerificationType, strategy: Arc<dyn VerificationStrategy>) {
        self.strategies.insert(ty, strategy);
    }

    pub fn check(&self, ty: VerificationType, ctx: &VerifyContext<'_>) -> Result<(), VerifyError> {
        self.strategies
            .get(&ty)
            .ok_or(VerifyError::NoStrategy(ty))?
            .check(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn addr(x: u8) -> Address {
        let mut a = [0u8; 20];
        a[0] = x;
        Address(a)
    }

    struct MapLedger(Map<(Address, Checkpoint), Balance>);
    impl StakingLedger for MapLedger {
        fn stake_at(&self, who: Address, cp: Checkpoint) -> Result<Balance, VerifyError> {
            Ok(*self.0.get(&(who, cp)).unwrap_or(&0))
        }
    }

    fn ctx<'a>(
        buyer: Address,
        cond: Option<&'a StakeCondition>,
        approved: bool,
    ) -> VerifyContext<'a> {
        VerifyContext { buyer, tier_id: TierId(1), stake_condition: cond, address_approved: approved }
    }

    #[test]
    fn closed_and_everyone() {
        let set = VerifierSet::standard();
        assert_eq!(
            set.check(VerificationType::None, &ctx(addr(1), None, false)),
            Err(VerifyError::Closed)
        );
        assert!(set.check(VerificationType::Everyone, &ctx(addr(1), None, false)).is_ok());
    }

    #[test]
    fn by_address_follows_flag() {
        let set = VerifierSet::standard();
        assert!(set.check(VerificationType::ByAddress, &ctx(addr(1), None, true)).is_ok());
        assert_eq!(
            set.check(VerificationType::ByAddress, &ctx(addr(2), None, false)),
            Err(VerifyError::NotVerified)
        );
    }

    #[test]
    fn by_stake_checks_every_checkpoint() {
        let cp1 = Checkpoint::Block(100);
        let cp2 = Checkpoint::Block(200);
        let mut m = Map::new();
        m.insert((addr(1), cp1), 50u128);
        m.insert((addr(1), cp2), 5u128); // dips below min at second checkpoint
        m.insert((addr(2), cp1), 50u128);
        m.insert((addr(2), cp2), 60u128);
        let set = VerifierSet::standard().with_stake(Arc::new(MapLedger(m)));

        let cond = StakeCondition { min_stake: 10, max_stake: 0, checkpoints: vec![cp1, cp2] };
        assert!(matches!(
            set.check(VerificationType::ByStake, &ctx(addr(1), Some(&cond), false)),
            Err(VerifyError::StakeOutOfRange { .. })
        ));
        assert!(set
            .check(VerificationType::ByStake, &ctx(addr(2), Some(&cond), false))
            .is_ok());

        // bounded above
        let cond = StakeCondition { min_stake: 10, max_stake: 55, checkpoints: vec![cp2] };
        assert!(matches!(
            set.check(VerificationType::ByStake, &ctx(addr(2), Some(&cond), false)),
            Err(VerifyError::StakeOutOfRange { .. })
        ));
    }

    #[test]
    fn custom_strategies_register_without_engine_changes() {
        struct EvenOnly;
        impl VerificationStrategy for EvenOnly {
            fn check(&self, ctx: &VerifyContext<'_>) -> Result<(), VerifyError> {
                if ctx.buyer.0[0] % 2 == 0 {
                    Ok(())
                } else {
                    Err(VerifyError::NotVerified)
                }
            }
        }
        let mut set = VerifierSet::standard();
        let tag = VerificationType::Custom(7);
        assert_eq!(
            set.check(tag, &ctx(addr(2), None, false)),
            Err(VerifyError::NoStrategy(tag))
        );
        set.register(tag, Arc::new(EvenOnly));
        assert!(set.check(tag, &ctx(addr(2), None, false)).is_ok());
        assert_eq!(set.check(tag, &ctx(addr(3), None, false)), Err(VerifyError::NotVerified));
    }
}
