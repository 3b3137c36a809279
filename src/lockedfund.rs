//! LockedFund — post-purchase token custody.
//!
//! Features:
//! - Immediate, waited (released in full after a global timestamp) and
//!   linearly vested balances per beneficiary
//! - Basis-point split of every deposit into an unlocked portion and a
//!   waited/vested remainder; bps of 10000 and above are rejected
//! - Admin set gating deposits and configuration; the last admin can never
//!   be removed
//! - Vesting bookkeeping delegated to a swappable registry collaborator
//! - Withdrawal destroys fully consumed records
//!
//! Depositors need admin privilege; the sale engine is wired in as an admin
//! and calls with `pull_funds = false` because it already escrowed the
//! tokens.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::vesting::{ScheduleId, VestingError};
use crate::{mul_div, Address, AssetId, Balance, BackendError, Funds, BPS_DENOM};

/// External vesting-registry collaborator. Owns the vesting records; invoked,
/// never inspected, by LockedFund.
pub trait VestingRegistry: Send + Sync + 'static {
    fn create_schedule(
        &self,
        beneficiary: Address,
        principal: Balance,
        start_ts: u64,
        cliff_s: u64,
        duration_s: u64,
    ) -> Result<ScheduleId, VestingError>;

    /// Releasable across all of the beneficiary's schedules, without
    /// consuming anything.
    fn releasable(&self, beneficiary: Address, now: u64) -> Result<Balance, VestingError>;

    /// Consume and return everything releasable; fully drained records are
    /// destroyed by the registry.
    fn release(&self, beneficiary: Address, now: u64) -> Result<Balance, VestingError>;
}

/// Where the bps-unlocked portion of a vested deposit lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlockType {
    /// Withdrawable immediately.
    Immediate,
    /// Withdrawable after the global waited timestamp.
    Waited,
}

#[derive(Clone, Debug)]
pub struct LockedFundConfig {
    /// Token held in custody.
    pub token: AssetId,
    /// Global unlock timestamp for waited balances; must be nonzero.
    pub waited_ts: u64,
    /// Ceiling for `deposit_vested` durations.
    pub max_duration_s: u64,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for LockedFundConfig {
    fn default() -> Self {
        Self {
            token: AssetId::Native,
            waited_ts: 1,
            max_duration_s: 4 * 365 * 86_400,
            event_capacity: 1024,
        }
    }
}

/// Per-beneficiary custody balances outside the vesting registry.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct Account {
    unlocked: Balance,
    waited: Balance,
}

impl Account {
    fn is_empty(&self) -> bool {
        self.unlocked == 0 && self.waited == 0
    }
}

#[derive(Clone, Debug)]
pub enum LockedFundEvent {
    DepositedWaited { beneficiary: Address, amount: Balance, unlocked_now: Balance },
    DepositedVested { beneficiary: Address, amount: Balance, schedule: ScheduleId },
    Withdrawn { beneficiary: Address, receiver: Address, amount: Balance },
    AdminAdded(Address),
    AdminRemoved(Address),
    RegistryChanged(Address),
    WaitedTsChanged(u64),
}

#[derive(Error, Debug)]
pub enum LockedFundError {
    #[error("caller is not an admin")]
    NotAdmin,
    #[error("address is not an admin")]
    AdminNotFound,
    #[error("cannot remove the last remaining admin")]
    LastAdmin,
    #[error("zero address not allowed")]
    ZeroAddress,
    #[error("amount must be > 0")]
    ZeroAmount,
    #[error("basis point must be below 10000")]
    BasisPointTooHigh,
    #[error("duration cannot be zero")]
    ZeroDuration,
    #[error("duration is too long")]
    DurationTooLong,
    #[error("waited timestamp must be nonzero")]
    ZeroWaitedTs,
    #[error("nothing to withdraw")]
    NothingToWithdraw,
    #[error("arithmetic overflow")]
    MathOverflow,
    #[error(transparent)]
    Vesting(#[from] VestingError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
}

pub struct LockedFund<B: Funds> {
    funds: Arc<B>,
    token: AssetId,
    max_duration_s: u64,
    waited_ts: RwLock<u64>,
    admins: RwLock<BTreeSet<Address>>,
    registry: RwLock<(Address, Arc<dyn VestingRegistry>)>,
    accounts: RwLock<BTreeMap<Address, Account>>,
    events_tx: broadcast::Sender<LockedFundEvent>,
    // serializes mutating entry points
    exec: Mutex<()>,
}

impl<B: Funds> LockedFund<B> {
    pub fn new(
        funds: Arc<B>,
        cfg: LockedFundConfig,
        initial_admins: &[Address],
        registry_address: Address,
        registry: Arc<dyn VestingRegistry>,
    ) -> Result<Arc<Self>, LockedFundError> {
        if cfg.waited_ts == 0 {
            return Err(LockedFundError::ZeroWaitedTs);
        }
        if cfg.max_duration_s == 0 {
            return Err(LockedFundError::ZeroDuration);
        }
        if registry_address.is_zero() {
            return Err(LockedFundError::ZeroAddress);
        }
        let admins: BTreeSet<Address> =
            initial_admins.iter().copied().filter(|a| !a.is_zero()).collect();
        if admins.is_empty() {
            return Err(LockedFundError::LastAdmin);
        }
        let (tx, _) = broadcast::channel(cfg.event_capacity);
        Ok(Arc::new(Self {
            funds,
            token: cfg.token,
            max_duration_s: cfg.max_duration_s,
            waited_ts: RwLock::new(cfg.waited_ts),
            admins: RwLock::new(admins),
            registry: RwLock::new((registry_address, registry)),
            accounts: RwLock::new(BTreeMap::new()),
            events_tx: tx,
            exec: Mutex::new(()),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockedFundEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_admin(&self, who: Address) -> bool {
        self.admins.read().contains(&who)
    }

    pub fn waited_ts(&self) -> u64 {
        *self.waited_ts.read()
    }

    pub fn registry_address(&self) -> Address {
        self.registry.read().0
    }

    /// Immediately withdrawable + matured waited + releasable vested amount.
    pub fn withdrawable(&self, beneficiary: Address) -> Result<Balance, LockedFundError> {
        let now = self.funds.now_unix();
        let acct = self.accounts.read().get(&beneficiary).copied().unwrap_or_default();
        let registry = self.registry.read().1.clone();
        let vested = registry.releasable(beneficiary, now)?;
        let mut total = acct.unlocked;
        if now >= *self.waited_ts.read() {
            total = total.checked_add(acct.waited).ok_or(LockedFundError::MathOverflow)?;
        }
        total.checked_add(vested).ok_or(LockedFundError::MathOverflow)
    }

    fn require_admin(&self, caller: Address) -> Result<(), LockedFundError> {
        if self.is_admin(caller) {
            Ok(())
        } else {
            Err(LockedFundError::NotAdmin)
        }
    }

    // ---------- Administration ----------

    pub fn add_admin(&self, caller: Address, who: Address) -> Result<(), LockedFundError> {
        self.require_admin(caller)?;
        if who.is_zero() {
            return Err(LockedFundError::ZeroAddress);
        }
        let _ex = self.exec.lock();
        self.admins.write().insert(who);
        let _ = self.events_tx.send(LockedFundEvent::AdminAdded(who));
        Ok(())
    }

    /// Removing the last remaining admin is rejected, so the fund can never
    /// become unadministrable.
    pub fn remove_admin(&self, caller: Address, who: Address) -> Result<(), LockedFundError> {
        self.require_admin(caller)?;
        let _ex = self.exec.lock();
        let mut admins = self.admins.write();
        if !admins.contains(&who) {
            return Err(LockedFundError::AdminNotFound);
        }
        if admins.len() == 1 {
            return Err(LockedFundError::LastAdmin);
        }
        admins.remove(&who);
        let _ = self.events_tx.send(LockedFundEvent::AdminRemoved(who));
        Ok(())
    }

    pub fn change_waited_ts(&self, caller: Address, ts: u64) -> Result<(), LockedFundError> {
        self.require_admin(caller)?;
        if ts == 0 {
            return Err(LockedFundError::ZeroWaitedTs);
        }
        let _ex = self.exec.lock();
        *self.waited_ts.write() = ts;
        let _ = self.events_tx.send(LockedFundEvent::WaitedTsChanged(ts));
        Ok(())
    }

    /// Swap the vesting-registry collaborator. Outstanding schedules remain
    /// owned by the registry that created them.
    pub fn change_vesting_registry(
        &self,
        caller: Address,
        address: Address,
        registry: Arc<dyn VestingRegistry>,
    ) -> Result<(), LockedFundError> {
        self.require_admin(caller)?;
        if address.is_zero() {
            return Err(LockedFundError::ZeroAddress);
        }
        let _ex = self.exec.lock();
        *self.registry.write() = (address, registry);
        let _ = self.events_tx.send(LockedFundEvent::RegistryChanged(address));
        Ok(())
    }

    // ---------- Deposits ----------

    /// Deposit `amount` for `beneficiary`: the `unlock_bps` portion becomes
    /// withdrawable immediately, the remainder after the global waited
    /// timestamp. With `pull_funds` the principal is pulled from the caller;
    /// otherwise it must already sit in escrow.
    pub fn deposit_waited_unlocked(
        &self,
        caller: Address,
        beneficiary: Address,
        amount: Balance,
        unlock_bps: u16,
        pull_funds: bool,
    ) -> Result<(), LockedFundError> {
        self.require_admin(caller)?;
        let unlocked_now = self.split_checks(beneficiary, amount, unlock_bps)?;
        let _ex = self.exec.lock();

        if pull_funds {
            self.funds
                .transfer_from(caller, self.token, self.funds.escrow_address(), amount)?;
        }

        let mut accounts = self.accounts.write();
        let acct = accounts.entry(beneficiary).or_default();
        acct.unlocked = acct.unlocked.checked_add(unlocked_now).ok_or(LockedFundError::MathOverflow)?;
        acct.waited = acct
            .waited
            .checked_add(amount - unlocked_now)
            .ok_or(LockedFundError::MathOverflow)?;

        debug!(beneficiary = ?beneficiary, amount, unlocked_now, "waited-unlocked deposit");
        let _ = self
            .events_tx
            .send(LockedFundEvent::DepositedWaited { beneficiary, amount, unlocked_now });
        Ok(())
    }

    /// Deposit `amount` for `beneficiary`: the `unlock_bps` portion lands in
    /// the immediate or waited balance per `unlock_type`, the remainder vests
    /// linearly over `duration_s` after `cliff_s`.
    #[allow(clippy::too_many_arguments)]
    pub fn deposit_vested(
        &self,
        caller: Address,
        beneficiary: Address,
        amount: Balance,
        cliff_s: u64,
        duration_s: u64,
        unlock_bps: u16,
        unlock_type: UnlockType,
        pull_funds: bool,
    ) -> Result<ScheduleId, LockedFundError> {
        self.require_admin(caller)?;
        if duration_s == 0 {
            return Err(LockedFundError::ZeroDuration);
        }
        if duration_s > self.max_duration_s {
            return Err(LockedFundError::DurationTooLong);
        }
        let unlocked_now = self.split_checks(beneficiary, amount, unlock_bps)?;
        let _ex = self.exec.lock();

        if pull_funds {
            self.funds
                .transfer_from(caller, self.token, self.funds.escrow_address(), amount)?;
        }

        let principal = amount - unlocked_now;
        let registry = self.registry.read().1.clone();
        let schedule = registry.create_schedule(
            beneficiary,
            principal,
            self.funds.now_unix(),
            cliff_s,
            duration_s,
        )?;

        let mut accounts = self.accounts.write();
        let acct = accounts.entry(beneficiary).or_default();
        match unlock_type {
            UnlockType::Immediate => {
                acct.unlocked =
                    acct.unlocked.checked_add(unlocked_now).ok_or(LockedFundError::MathOverflow)?
            }
            UnlockType::Waited => {
                acct.waited =
                    acct.waited.checked_add(unlocked_now).ok_or(LockedFundError::MathOverflow)?
            }
        }
        let empty = acct.is_empty();
        if empty {
            accounts.remove(&beneficiary);
        }

        debug!(beneficiary = ?beneficiary, amount, principal, schedule, "vested deposit");
        let _ = self
            .events_tx
            .send(LockedFundEvent::DepositedVested { beneficiary, amount, schedule });
        Ok(schedule)
    }

    // ---------- Withdrawal ----------

    /// Pay out everything withdrawable to `receiver` (the beneficiary when
    /// unset). Monotonic in time; fully consumed records are destroyed.
    pub fn withdraw(
        &self,
        beneficiary: Address,
        receiver: Option<Address>,
    ) -> Result<Balance, LockedFundError> {
        let receiver = receiver.unwrap_or(beneficiary);
        if receiver.is_zero() {
            return Err(LockedFundError::ZeroAddress);
        }
        let _ex = self.exec.lock();
        let now = self.funds.now_unix();
        let waited_open = now >= *self.waited_ts.read();

        let acct = self.accounts.read().get(&beneficiary).copied().unwrap_or_default();
        let registry = self.registry.read().1.clone();
        let vested = registry.releasable(beneficiary, now)?;

        let mut total = acct.unlocked;
        if waited_open {
            total = total.checked_add(acct.waited).ok_or(LockedFundError::MathOverflow)?;
        }
        total = total.checked_add(vested).ok_or(LockedFundError::MathOverflow)?;
        if total == 0 {
            return Err(LockedFundError::NothingToWithdraw);
        }

        // transfer first, then consume; releasable(now) == release(now) under
        // the exec lock, so a backend failure leaves every record untouched
        self.funds.transfer(self.token, receiver, total)?;
        let released = registry.release(beneficiary, now)?;
        debug_assert_eq!(released, vested);

        let mut accounts = self.accounts.write();
        let drained = match accounts.get_mut(&beneficiary) {
            Some(a) => {
                a.unlocked = 0;
                if waited_open {
                    a.waited = 0;
                }
                a.is_empty()
            }
            None => false,
        };
        if drained {
            accounts.remove(&beneficiary);
        }

        info!(beneficiary = ?beneficiary, receiver = ?receiver, amount = total, "withdrawn");
        let _ = self.events_tx.send(LockedFundEvent::Withdrawn { beneficiary, receiver, amount: total });
        Ok(total)
    }

    // ---------- Internals ----------

    /// Shared deposit validation; returns the bps-unlocked portion.
    fn split_checks(
        &self,
        beneficiary: Address,
        amount: Balance,
        unlock_bps: u16,
    ) -> Result<Balance, LockedFundError> {
        if beneficiary.is_zero() {
            return Err(LockedFundError::ZeroAddress);
        }
        if amount == 0 {
            return Err(LockedFundError::ZeroAmount);
        }
        if u32::from(unlock_bps) >= BPS_DENOM {
            return Err(LockedFundError::BasisPointTooHigh);
        }
        mul_div(amount, u128::from(unlock_bps), u128::from(BPS_DENOM))
            .ok_or(LockedFundError::MathOverflow)
    }
}
