//! Tier configuration: one sale round's pricing, timing and distribution rules.

use serde::{Deserialize, Serialize};

use crate::verify::Checkpoint;
use crate::{Address, AssetId, Balance, BPS_DENOM};

/// Tier identifier, assigned sequentially by the sale engine.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TierId(pub u64);

/// Deposit-to-token exchange rate: tokens = deposit * num / den (floored).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRate {
    pub num: Balance,
    pub den: Balance,
}

impl DepositRate {
    pub fn new(num: Balance, den: Balance) -> Result<Self, TierConfigError> {
        if num == 0 || den == 0 {
            return Err(TierConfigError("deposit rate num/den must be > 0"));
        }
        Ok(Self { num, den })
    }

    /// Tokens bought by `deposit`, truncating.
    pub fn tokens_for(&self, deposit: Balance) -> Option<Balance> {
        crate::mul_div(deposit, self.num, self.den)
    }

    /// Smallest deposit that pays for exactly `tokens`.
    pub fn deposit_for(&self, tokens: Balance) -> Option<Balance> {
        crate::mul_div_ceil(tokens, self.den, self.num)
    }
}

/// When a tier's sale ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleEnd {
    /// Not configured; the tier cannot sell.
    None,
    /// Open while the tier has remaining supply.
    UntilSupply,
    /// Fixed duration in seconds from `sale_start_ts`.
    Duration(u64),
    /// Fixed UNIX end timestamp (exclusive).
    Timestamp(u64),
}

/// How purchased tokens reach the buyer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    /// Not configured; the tier cannot sell.
    None,
    /// Delivered immediately.
    Unlocked,
    /// Into LockedFund; the tier's unlock bps is released now, the rest after
    /// the global waited timestamp.
    WaitedUnlock,
    /// Into LockedFund; unlock bps now, remainder linearly vested.
    Vested,
    /// Into LockedFund; fully vested, no immediate portion.
    Locked,
}

/// Purchase-eligibility policy selector; dispatched through a
/// [`crate::VerifierSet`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum VerificationType {
    /// Not configured; every purchase is rejected.
    None,
    Everyone,
    ByAddress,
    ByStake,
    /// Extension tag resolved against strategies registered at runtime.
    Custom(u16),
}

/// Settlement policy for accepted purchases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleType {
    /// Each purchase settles immediately.
    Fcfs,
    /// Deposits are escrowed; allocation and refunds are computed after close.
    Pooled,
}

/// Stake-eligibility snapshot for [`VerificationType::ByStake`] tiers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeCondition {
    pub min_stake: Balance,
    /// Zero means unbounded.
    pub max_stake: Balance,
    /// Block heights / timestamps at which stake is sampled.
    pub checkpoints: Vec<Checkpoint>,
}

impl StakeCondition {
    pub fn validate(&self) -> Result<(), TierConfigError> {
        if self.max_stake != 0 && self.min_stake > self.max_stake {
            return Err(TierConfigError("min_stake > max_stake"));
        }
        if self.checkpoints.is_empty() {
            return Err(TierConfigError("stake condition needs at least one checkpoint"));
        }
        Ok(())
    }
}

/// Creation-time tier parameters. Selectors left at `None` keep the tier
/// unsaleable until set by an edit operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierParams {
    /// Minimum deposit per purchase.
    pub min_amount: Balance,
    /// Maximum cumulative deposit per participant.
    pub max_amount: Balance,
    /// Tokens allocated to this tier.
    pub token_supply: Balance,
    pub sale_start_ts: u64,
    pub sale_end: SaleEnd,
    /// Portion released immediately under waited/vested transfer, in bps.
    pub unlock_bps: u16,
    pub vest_cliff_s: u64,
    pub vest_duration_s: u64,
    pub deposit_rate: DepositRate,
    pub deposit_asset: AssetId,
    /// Where accepted deposits are routed; engine escrow when unset.
    pub deposit_address: Option<Address>,
    pub verification: VerificationType,
    pub stake_condition: Option<StakeCondition>,
    pub transfer: TransferType,
    pub sale_type: SaleType,
}

impl TierParams {
    pub fn validate(&self) -> Result<(), TierConfigError> {
        if self.token_supply == 0 {
            return Err(TierConfigError("token_supply must be > 0"));
        }
        Tier::from_params(TierId(0), self.clone()).validate()
    }
}

/// A configured sale round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tier {
    pub id: TierId,
    pub min_amount: Balance,
    pub max_amount: Balance,
    /// Decreases as purchases are accepted; never negative.
    pub remaining_tokens: Balance,
    pub sale_start_ts: u64,
    pub sale_end: SaleEnd,
    pub unlock_bps: u16,
    pub vest_cliff_s: u64,
    pub vest_duration_s: u64,
    pub deposit_rate: DepositRate,
    pub deposit_asset: AssetId,
    pub deposit_address: Option<Address>,
    pub verification: VerificationType,
    pub stake_condition: Option<StakeCondition>,
    pub transfer: TransferType,
    pub sale_type: SaleType,
}

impl Tier {
    pub(crate) fn from_params(id: TierId, p: TierParams) -> Self {
        Self {
            id,
            min_amount: p.min_amount,
            max_amount: p.max_amount,
            remaining_tokens: p.token_supply,
            sale_start_ts: p.sale_start_ts,
            sale_end: p.sale_end,
            unlock_bps: p.unlock_bps,
            vest_cliff_s: p.vest_cliff_s,
            vest_duration_s: p.vest_duration_s,
            deposit_rate: p.deposit_rate,
            deposit_asset: p.deposit_asset,
            deposit_address: p.deposit_address,
            verification: p.verification,
            stake_condition: p.stake_condition,
            transfer: p.transfer,
            sale_type: p.sale_type,
        }
    }

    /// Configuration constraints; re-checked after every edit operation.
    /// `remaining_tokens` is deliberately not constrained here, it may have
    /// been sold down to zero.
    pub fn validate(&self) -> Result<(), TierConfigError> {
        if self.max_amount == 0 {
            return Err(TierConfigError("max_amount must be > 0"));
        }
        if self.min_amount > self.max_amount {
            return Err(TierConfigError("min_amount > max_amount"));
        }
        DepositRate::new(self.deposit_rate.num, self.deposit_rate.den)?;
        if u32::from(self.unlock_bps) >= BPS_DENOM {
            return Err(TierConfigError("unlock_bps must be < 10000"));
        }
        match self.sale_end {
            SaleEnd::Duration(0) => return Err(TierConfigError("sale duration must be > 0")),
            SaleEnd::Timestamp(ts) if ts <= self.sale_start_ts => {
                return Err(TierConfigError("sale end before start"))
            }
            _ => {}
        }
        if matches!(self.transfer, TransferType::Vested | TransferType::Locked)
            && self.vest_duration_s == 0
        {
            return Err(TierConfigError("vest duration must be > 0"));
        }
        if let Some(addr) = self.deposit_address {
            if addr.is_zero() {
                return Err(TierConfigError("deposit address must be nonzero"));
            }
        }
        if self.verification == VerificationType::ByStake {
            match &self.stake_condition {
                Some(sc) => sc.validate()?,
                None => return Err(TierConfigError("by-stake tier needs a stake condition")),
            }
        }
        Ok(())
    }

    /// All three selectors set; a tier cannot sell before this holds.
    pub fn is_configured(&self) -> bool {
        self.verification != VerificationType::None
            && self.transfer != TransferType::None
            && self.sale_end != SaleEnd::None
    }

    /// End timestamp under fixed-schedule end policies.
    pub fn end_ts(&self) -> Option<u64> {
        match self.sale_end {
            SaleEnd::Duration(d) => Some(self.sale_start_ts.saturating_add(d)),
            SaleEnd::Timestamp(ts) => Some(ts),
            SaleEnd::None | SaleEnd::UntilSupply => None,
        }
    }

    /// Whether the sale window is open at `now`, per the end-type policy.
    pub fn is_open(&self, now: u64) -> bool {
        if now < self.sale_start_ts {
            return false;
        }
        match self.sale_end {
            SaleEnd::None => false,
            SaleEnd::UntilSupply => self.remaining_tokens > 0,
            SaleEnd::Duration(_) | SaleEnd::Timestamp(_) => {
                // end_ts is Some for these variants
                now < self.end_ts().unwrap_or(0)
            }
        }
    }
}

/// Invalid tier configuration, with the offending constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid tier config: {0}")]
pub struct TierConfigError(pub &'static str);

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TierParams {
        TierParams {
            min_amount: 10,
            max_amount: 100,
            token_supply: 1_000,
            sale_start_ts: 1_000,
            sale_end: SaleEnd::Timestamp(2_000),
            unlock_bps: 1_000,
            vest_cliff_s: 0,
            vest_duration_s: 0,
            deposit_rate: DepositRate { num: 2, den: 1 },
            deposit_asset: AssetId::Native,
            deposit_address: None,
            verification: VerificationType::Everyone,
            stake_condition: None,
            transfer: TransferType::Unlocked,
            sale_type: SaleType::Fcfs,
        }
    }

    #[test]
    fn validate_accepts_default() {
        assert!(params().validate().is_ok());
    }

    #[test]
    fn unlock_bps_bounds() {
        let mut p = params();
        p.unlock_bps = 10_000;
        assert!(p.validate().is_err());
        p.unlock_bps = 9_999;
        assert!(p.validate().is_ok());
        p.unlock_bps = 0;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn vested_tier_needs_duration() {
        let mut p = params();
        p.transfer = TransferType::Vested;
        p.vest_duration_s = 0;
        assert!(p.validate().is_err());
        p.vest_duration_s = 86_400;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn stake_condition_invariants() {
        let sc = StakeCondition {
            min_stake: 10,
            max_stake: 5,
            checkpoints: vec![Checkpoint::Timestamp(1)],
        };
        assert!(sc.validate().is_err());
        let sc = StakeCondition { min_stake: 10, max_stake: 0, checkpoints: vec![] };
        assert!(sc.validate().is_err());
        let sc = StakeCondition {
            min_stake: 10,
            max_stake: 0,
            checkpoints: vec![Checkpoint::Block(7)],
        };
        assert!(sc.validate().is_ok());
    }

    #[test]
    fn window_policies() {
        let mut t = Tier::from_params(TierId(1), params());
        assert!(!t.is_open(999));
        assert!(t.is_open(1_000));
        assert!(t.is_open(1_999));
        assert!(!t.is_open(2_000));

        t.sale_end = SaleEnd::UntilSupply;
        assert!(t.is_open(5_000));
        t.remaining_tokens = 0;
        assert!(!t.is_open(5_000));

        t.sale_end = SaleEnd::None;
        assert!(!t.is_open(1_500));
    }
}
