//! Origins — off-chain settlement core for a tiered token sale.
//!
//! Features:
//! - Tiered sale engine: per-tier pricing, sale windows, supply counters,
//!   FCFS and pooled settlement with deterministic pro-rata
//! - Pluggable verification strategies (allow-list, stake snapshot, open, closed)
//! - LockedFund distribution engine: immediate, waited and linearly vested
//!   token custody with an external vesting-registry collaborator
//! - Safety: checked arithmetic, typed abort-with-reason errors, staged-state
//!   commit so a failed operation leaves no observable mutation
//! - Concurrency: parking_lot locks + per-engine execute mutex
//! - Events: tokio::broadcast streams per engine
//!
//! Monetary side-effects go through the [`Funds`] backend trait; integrate a
//! real ledger or use the in-memory mock from the test modules.

#![forbid(unsafe_code)]

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod lockedfund;
pub mod sale;
pub mod tier;
pub mod verify;
pub mod vesting;

pub use lockedfund::{
    LockedFund, LockedFundConfig, LockedFundError, LockedFundEvent, UnlockType, VestingRegistry,
};
pub use sale::{
    LedgerEntry, Origins, OriginsConfig, SaleError, SaleEvent, SaleSnapshot, TierStats,
};
pub use tier::{
    DepositRate, SaleEnd, SaleType, StakeCondition, Tier, TierConfigError, TierId, TierParams,
    TransferType, VerificationType,
};
pub use verify::{
    Checkpoint, StakingLedger, VerificationStrategy, VerifierSet, VerifyContext, VerifyError,
};
pub use vesting::{Schedule, ScheduleBook, ScheduleId, VestingError};

// ---------- Primitives ----------

/// 20-byte account address; align with your chain primitives.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The all-zero address; rejected wherever a real address is required.
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Asset moved by the [`Funds`] backend: native currency or a fungible token.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum AssetId {
    Native,
    Token(Address),
}

/// Balance in smallest units.
pub type Balance = u128;

/// Basis-point denominator (100% == 10_000 bps).
pub const BPS_DENOM: u32 = 10_000;

// ---------- Funds backend ----------

/// Abstract funds provider plugging a ledger into the engines.
///
/// Implementations must signal success explicitly; any ambiguous outcome is an
/// error (nonstandard token return values are treated as failure). `transfer`
/// moves funds out of the platform escrow account.
pub trait Funds: Send + Sync + 'static {
    /// Current UNIX time in seconds.
    fn now_unix(&self) -> u64;

    /// Platform custody account holding escrowed deposits and sale tokens.
    fn escrow_address(&self) -> Address;

    /// Move `amount` of `asset` from `from` to `to`.
    fn transfer_from(
        &self,
        from: Address,
        asset: AssetId,
        to: Address,
        amount: Balance,
    ) -> Result<(), BackendError>;

    /// Move `amount` of `asset` from the escrow account to `to`.
    fn transfer(&self, asset: AssetId, to: Address, amount: Balance) -> Result<(), BackendError>;
}

/// Backend errors surfaced through engine errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("insufficient balance")]
    Insufficient,
    #[error("asset not supported by backend")]
    UnsupportedAsset,
    #[error("backend failure: {0}")]
    Other(String),
}

// ---------- Math helpers ----------

/// floor((a * b) / d) with checked u128 arithmetic; None on overflow or d == 0.
pub(crate) fn mul_div(a: u128, b: u128, d: u128) -> Option<u128> {
    if d == 0 {
        return None;
    }
    a.checked_mul(b)?.checked_div(d)
}

/// ceil((a * b) / d) with checked u128 arithmetic; None on overflow or d == 0.
pub(crate) fn mul_div_ceil(a: u128, b: u128, d: u128) -> Option<u128> {
    if d == 0 {
        return None;
    }
    let p = a.checked_mul(b)?;
    Some(p / d + u128::from(p % d != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_debug_is_hex() {
        let mut a = [0u8; 20];
        a[0] = 0xab;
        a[19] = 0x01;
        assert_eq!(
            format!("{:?}", Address(a)),
            "0xab00000000000000000000000000000000000001"
        );
    }

    #[test]
    fn mul_div_rounding() {
        assert_eq!(mul_div(50, 2, 1), Some(100));
        assert_eq!(mul_div(50, 1, 3), Some(16));
        assert_eq!(mul_div_ceil(16, 3, 1), Some(48));
        assert_eq!(mul_div_ceil(10, 1, 3), Some(4));
        assert_eq!(mul_div(1, 1, 0), None);
        assert_eq!(mul_div(u128::MAX, 2, 1), None);
    }
}
