//! Origins sale engine: tier lifecycle, purchase settlement, fund routing.
//!
//! Features:
//! - Tier administration: create (single or batch), field edits, early close,
//!   one-shot proceeds withdrawal
//! - Purchases: window/limit/verification checks, truncating rate conversion
//!   that never pulls deposit it cannot convert, supply clamping
//! - FCFS tiers settle immediately; pooled tiers escrow commitments and
//!   settle deterministically after close (largest-remainder pro-rata)
//! - Token routing per transfer type: direct delivery or into LockedFund
//! - Roles: Owner administers, Verifiers grant one-way address approvals
//! - Staged-state commit: every mutating entry point clones state, mutates
//!   the copy and commits only on success, so failures leave no observable
//!   mutation
//!
//! The engine acts towards LockedFund as a depositor-admin under its escrow
//! address; wire that address into the fund's admin set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::lockedfund::{LockedFund, LockedFundError, UnlockType};
use crate::tier::{SaleEnd, SaleType, StakeCondition, Tier, TierConfigError, TierId, TierParams, TransferType, VerificationType};
use crate::verify::{VerifierSet, VerifyContext, VerifyError};
use crate::{mul_div, Address, AssetId, Balance, BackendError, DepositRate, Funds};

// ---------- Configuration ----------

#[derive(Clone, Debug)]
pub struct OriginsConfig {
    /// Token being sold across all tiers; delivered from engine escrow.
    pub sale_token: AssetId,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for OriginsConfig {
    fn default() -> Self {
        Self { sale_token: AssetId::Native, event_capacity: 1024 }
    }
}

// ---------- Ledger ----------

/// Per (participant, tier) purchase record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Accepted deposit (FCFS) or escrowed commitment, reduced to the used
    /// portion at pooled settlement.
    pub deposited: Balance,
    /// Tokens bought (FCFS) or allocated at settlement (pooled).
    pub tokens: Balance,
    /// Refundable escrow assigned at pooled settlement.
    pub refund: Balance,
    /// Pooled double-claim guard.
    pub claimed: bool,
}

#[derive(Clone, Debug, Default)]
struct TierBook {
    ledger: BTreeMap<Address, LedgerEntry>,
    tokens_sold: Balance,
    /// Deposit funds currently held in engine escrow for this tier.
    escrow: Balance,
    /// Withdrawable proceeds (escrowed part; directly routed deposits have
    /// already left).
    proceeds: Balance,
    /// Pooled: total committed escrow before settlement.
    committed: Balance,
    /// One-way verification flags.
    verified: BTreeSet<Address>,
    closed: bool,
    settled: bool,
    withdrawn: bool,
}

#[derive(Clone, Default)]
struct SaleState {
    next_tier: u64,
    tiers: BTreeMap<TierId, Tier>,
    books: BTreeMap<TierId, TierBook>,
    /// Global per-participant deposit totals; keys double as the distinct
    /// wallet counter.
    wallets: BTreeMap<Address, Balance>,
}

/// Read-only aggregate view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaleSnapshot {
    pub tier_count: usize,
    /// Distinct participating addresses across all tiers.
    pub participants: usize,
}

/// Read-only per-tier view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierStats {
    pub tokens_sold: Balance,
    pub remaining_tokens: Balance,
    /// Distinct participating addresses in this tier.
    pub participants: usize,
    pub escrow: Balance,
    pub closed: bool,
    pub settled: bool,
    pub withdrawn: bool,
}

// ---------- Events ----------

#[derive(Clone, Debug)]
pub enum SaleEvent {
    TierCreated(TierId),
    TierUpdated(TierId),
    TierClosed(TierId),
    Purchased {
        tier: TierId,
        buyer: Address,
        deposit_requested: Balance,
        deposit_accepted: Balance,
        tokens: Balance,
    },
    PoolCommitted { tier: TierId, buyer: Address, amount: Balance },
    PoolSettled { tier: TierId, tokens_allocated: Balance, proceeds: Balance, refunds: Balance },
    PoolClaimed { tier: TierId, buyer: Address, tokens: Balance, refund: Balance },
    ProceedsWithdrawn { tier: TierId, to: Address, amount: Balance },
    AddressVerified { tier: TierId, addr: Address },
    OwnershipTransferred { from: Address, to: Address },
    VerifierAdded(Address),
    VerifierRemoved(Address),
}

// ---------- Errors ----------

#[derive(Error, Debug)]
pub enum SaleError {
    #[error("caller is not the owner")]
    NotOwner,
    #[error("caller is not a verifier")]
    NotVerifier,
    #[error("tier not found")]
    TierNotFound,
    #[error(transparent)]
    InvalidTier(#[from] TierConfigError),
    #[error("tier is not fully configured")]
    TierNotConfigured,
    #[error("sale is not open")]
    SaleNotOpen,
    #[error("tier sale has not finished")]
    TierNotFinished,
    #[error("deposit below tier minimum")]
    BelowMinimum,
    #[error("cumulative deposit above tier maximum")]
    AboveMaximum,
    #[error("deposit converts to zero tokens")]
    DepositTooSmall,
    #[error("tier supply exhausted")]
    SoldOut,
    #[error(transparent)]
    Verification(#[from] VerifyError),
    #[error("operation only valid for pooled tiers")]
    NotPooled,
    #[error("pool already settled")]
    AlreadySettled,
    #[error("pool not settled")]
    NotSettled,
    #[error("allocation already claimed")]
    AlreadyClaimed,
    #[error("nothing to claim")]
    NothingToClaim,
    #[error("proceeds already withdrawn")]
    ProceedsAlreadyWithdrawn,
    #[error("zero address not allowed")]
    ZeroAddress,
    #[error("amount must be > 0")]
    ZeroAmount,
    #[error("arithmetic overflow")]
    MathOverflow,
    #[error(transparent)]
    LockedFund(#[from] LockedFundError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
}

// ---------- Engine ----------

pub struct Origins<B: Funds> {
    funds: Arc<B>,
    locked: Arc<LockedFund<B>>,
    strategies: VerifierSet,
    sale_token: AssetId,
    owner: RwLock<Address>,
    verifiers: RwLock<BTreeSet<Address>>,
    state: RwLock<SaleState>,
    events_tx: broadcast::Sender<SaleEvent>,
    // serializes mutating entry points; reads see pre- or post-commit state
    exec: Mutex<()>,
}

impl<B: Funds> Origins<B> {
    pub fn new(
        funds: Arc<B>,
        locked: Arc<LockedFund<B>>,
        strategies: VerifierSet,
        cfg: OriginsConfig,
        owner: Address,
    ) -> Result<Arc<Self>, SaleError> {
        if owner.is_zero() {
            return Err(SaleError::ZeroAddress);
        }
        let (tx, _) = broadcast::channel(cfg.event_capacity);
        Ok(Arc::new(Self {
            funds,
            locked,
            strategies,
            sale_token: cfg.sale_token,
            owner: RwLock::new(owner),
            verifiers: RwLock::new(BTreeSet::new()),
            state: RwLock::new(SaleState::default()),
            events_tx: tx,
            exec: Mutex::new(()),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaleEvent> {
        self.events_tx.subscribe()
    }

    // ---------- Roles ----------

    pub fn owner(&self) -> Address {
        *self.owner.read()
    }

    fn require_owner(&self, caller: Address) -> Result<(), SaleError> {
        if caller == *self.owner.read() {
            Ok(())
        } else {
            Err(SaleError::NotOwner)
        }
    }

    /// The owner passes verifier checks as well.
    fn require_verifier(&self, caller: Address) -> Result<(), SaleError> {
        if caller == *self.owner.read() || self.verifiers.read().contains(&caller) {
            Ok(())
        } else {
            Err(SaleError::NotVerifier)
        }
    }

    pub fn transfer_ownership(&self, caller: Address, new_owner: Address) -> Result<(), SaleError> {
        self.require_owner(caller)?;
        if new_owner.is_zero() {
            return Err(SaleError::ZeroAddress);
        }
        let _ex = self.exec.lock();
        let from = {
            let mut o = self.owner.write();
            let from = *o;
            *o = new_owner;
            from
        };
        let _ = self.events_tx.send(SaleEvent::OwnershipTransferred { from, to: new_owner });
        Ok(())
    }

    pub fn add_verifier(&self, caller: Address, who: Address) -> Result<(), SaleError> {
        self.require_owner(caller)?;
        if who.is_zero() {
            return Err(SaleError::ZeroAddress);
        }
        self.verifiers.write().insert(who);
        let _ = self.events_tx.send(SaleEvent::VerifierAdded(who));
        Ok(())
    }

    pub fn remove_verifier(&self, caller: Address, who: Address) -> Result<(), SaleError> {
        self.require_owner(caller)?;
        self.verifiers.write().remove(&who);
        let _ = self.events_tx.send(SaleEvent::VerifierRemoved(who));
        Ok(())
    }

    // ---------- Tier administration ----------

    pub fn create_tier(&self, caller: Address, params: TierParams) -> Result<TierId, SaleError> {
        Ok(self.create_tiers(caller, vec![params])?[0])
    }

    /// Batch creation; all-or-nothing.
    pub fn create_tiers(
        &self,
        caller: Address,
        params: Vec<TierParams>,
    ) -> Result<Vec<TierId>, SaleError> {
        self.require_owner(caller)?;
        let _ex = self.exec.lock();
        let mut staged = self.state.read().clone();
        let mut ids = Vec::with_capacity(params.len());
        for p in params {
            p.validate()?;
            staged.next_tier += 1;
            let id = TierId(staged.next_tier);
            staged.tiers.insert(id, Tier::from_params(id, p));
            staged.books.insert(id, TierBook::default());
            ids.push(id);
        }
        *self.state.write() = staged;
        for id in &ids {
            info!(tier = id.0, "tier created");
            let _ = self.events_tx.send(SaleEvent::TierCreated(*id));
        }
        Ok(ids)
    }

    /// Shared edit boundary: mutate a staged copy of the tier, revalidate,
    /// commit.
    fn edit_tier(
        &self,
        caller: Address,
        id: TierId,
        f: impl FnOnce(&mut Tier),
    ) -> Result<(), SaleError> {
        self.require_owner(caller)?;
        let _ex = self.exec.lock();
        let mut staged = self.state.read().clone();
        let tier = staged.tiers.get_mut(&id).ok_or(SaleError::TierNotFound)?;
        f(tier);
        tier.validate()?;
        *self.state.write() = staged;
        let _ = self.events_tx.send(SaleEvent::TierUpdated(id));
        Ok(())
    }

    pub fn set_tier_deposit_limits(
        &self,
        caller: Address,
        id: TierId,
        min_amount: Balance,
        max_amount: Balance,
    ) -> Result<(), SaleError> {
        self.edit_tier(caller, id, |t| {
            t.min_amount = min_amount;
            t.max_amount = max_amount;
        })
    }

    pub fn set_tier_supply(
        &self,
        caller: Address,
        id: TierId,
        remaining_tokens: Balance,
    ) -> Result<(), SaleError> {
        self.edit_tier(caller, id, |t| t.remaining_tokens = remaining_tokens)
    }

    pub fn set_tier_schedule(
        &self,
        caller: Address,
        id: TierId,
        sale_start_ts: u64,
        sale_end: SaleEnd,
    ) -> Result<(), SaleError> {
        self.edit_tier(caller, id, |t| {
            t.sale_start_ts = sale_start_ts;
            t.sale_end = sale_end;
        })
    }

    pub fn set_tier_vest_or_lock(
        &self,
        caller: Address,
        id: TierId,
        vest_cliff_s: u64,
        vest_duration_s: u64,
        unlock_bps: u16,
        transfer: TransferType,
    ) -> Result<(), SaleError> {
        self.edit_tier(caller, id, |t| {
            t.vest_cliff_s = vest_cliff_s;
            t.vest_duration_s = vest_duration_s;
            t.unlock_bps = unlock_bps;
            t.transfer = transfer;
        })
    }

    pub fn set_tier_deposit_parameters(
        &self,
        caller: Address,
        id: TierId,
        deposit_rate: DepositRate,
        deposit_asset: AssetId,
    ) -> Result<(), SaleError> {
        self.edit_tier(caller, id, |t| {
            t.deposit_rate = deposit_rate;
            t.deposit_asset = deposit_asset;
        })
    }

    pub fn set_tier_verification(
        &self,
        caller: Address,
        id: TierId,
        verification: VerificationType,
        stake_condition: Option<StakeCondition>,
    ) -> Result<(), SaleError> {
        self.edit_tier(caller, id, |t| {
            t.verification = verification;
            t.stake_condition = stake_condition;
        })
    }

    pub fn set_deposit_address(
        &self,
        caller: Address,
        id: TierId,
        deposit_address: Option<Address>,
    ) -> Result<(), SaleError> {
        self.edit_tier(caller, id, |t| t.deposit_address = deposit_address)
    }

    /// End a tier's sale early.
    pub fn close_tier(&self, caller: Address, id: TierId) -> Result<(), SaleError> {
        self.require_owner(caller)?;
        let _ex = self.exec.lock();
        let mut staged = self.state.read().clone();
        if !staged.tiers.contains_key(&id) {
            return Err(SaleError::TierNotFound);
        }
        staged.books.entry(id).or_default().closed = true;
        *self.state.write() = staged;
        info!(tier = id.0, "tier closed");
        let _ = self.events_tx.send(SaleEvent::TierClosed(id));
        Ok(())
    }

    // ---------- Verification flags ----------

    /// Grant the one-way approval flag for (addr, tier). There is no revoke.
    pub fn verify_address(&self, caller: Address, id: TierId, addr: Address) -> Result<(), SaleError> {
        self.verify_addresses(caller, id, &[addr])
    }

    pub fn verify_addresses(
        &self,
        caller: Address,
        id: TierId,
        addrs: &[Address],
    ) -> Result<(), SaleError> {
        self.require_verifier(caller)?;
        let _ex = self.exec.lock();
        let mut staged = self.state.read().clone();
        if !staged.tiers.contains_key(&id) {
            return Err(SaleError::TierNotFound);
        }
        let book = staged.books.entry(id).or_default();
        let mut granted = Vec::new();
        for addr in addrs {
            if addr.is_zero() {
                return Err(SaleError::ZeroAddress);
            }
            if book.verified.insert(*addr) {
                granted.push(*addr);
            }
        }
        *self.state.write() = staged;
        for addr in granted {
            let _ = self.events_tx.send(SaleEvent::AddressVerified { tier: id, addr });
        }
        Ok(())
    }

    // ---------- Purchases ----------

    /// Purchase in tier `id` with `deposit`. Returns (accepted deposit,
    /// tokens bought); pooled tiers return zero tokens until settlement.
    pub fn buy(
        &self,
        buyer: Address,
        id: TierId,
        deposit: Balance,
    ) -> Result<(Balance, Balance), SaleError> {
        if deposit == 0 {
            return Err(SaleError::ZeroAmount);
        }
        if buyer.is_zero() {
            return Err(SaleError::ZeroAddress);
        }
        let _ex = self.exec.lock();
        let mut staged = self.state.read().clone();
        let tier = staged.tiers.get(&id).ok_or(SaleError::TierNotFound)?.clone();
        if !tier.is_configured() {
            return Err(SaleError::TierNotConfigured);
        }
        let book = staged.books.entry(id).or_default();
        let now = self.funds.now_unix();
        if book.closed || book.settled || !tier.is_open(now) {
            return Err(SaleError::SaleNotOpen);
        }
        if deposit < tier.min_amount {
            return Err(SaleError::BelowMinimum);
        }

        let ctx = VerifyContext {
            buyer,
            tier_id: id,
            stake_condition: tier.stake_condition.as_ref(),
            address_approved: book.verified.contains(&buyer),
        };
        self.strategies.check(tier.verification, &ctx)?;

        let entry = book.ledger.get(&buyer).copied().unwrap_or_default();

        match tier.sale_type {
            SaleType::Fcfs => {
                let wanted =
                    tier.deposit_rate.tokens_for(deposit).ok_or(SaleError::MathOverflow)?;
                if wanted == 0 {
                    return Err(SaleError::DepositTooSmall);
                }
                // clamp to supply on the exact-price grid; only the deposit
                // that converts exactly is ever pulled from the buyer
                let (tokens, accepted) = if wanted > tier.remaining_tokens {
                    snap_allocation(tier.deposit_rate, tier.remaining_tokens)
                        .ok_or(SaleError::MathOverflow)?
                } else {
                    let used =
                        tier.deposit_rate.deposit_for(wanted).ok_or(SaleError::MathOverflow)?;
                    (wanted, used)
                };
                if tokens == 0 {
                    return Err(SaleError::SoldOut);
                }
                let cumulative =
                    entry.deposited.checked_add(accepted).ok_or(SaleError::MathOverflow)?;
                if cumulative > tier.max_amount {
                    return Err(SaleError::AboveMaximum);
                }

                // all validations passed; backend effects, then commit
                let dest = tier.deposit_address.unwrap_or_else(|| self.funds.escrow_address());
                self.funds.transfer_from(buyer, tier.deposit_asset, dest, accepted)?;
                self.route_tokens(&tier, buyer, tokens)?;

                let book = staged.books.entry(id).or_default();
                let e = book.ledger.entry(buyer).or_default();
                e.deposited = cumulative;
                e.tokens += tokens;
                book.tokens_sold += tokens;
                if tier.deposit_address.is_none() {
                    book.escrow += accepted;
                    book.proceeds += accepted;
                }
                let t = staged.tiers.get_mut(&id).ok_or(SaleError::TierNotFound)?;
                t.remaining_tokens -= tokens;
                *staged.wallets.entry(buyer).or_default() += accepted;
                *self.state.write() = staged;

                debug!(tier = id.0, buyer = ?buyer, accepted, tokens, "purchase settled");
                let _ = self.events_tx.send(SaleEvent::Purchased {
                    tier: id,
                    buyer,
                    deposit_requested: deposit,
                    deposit_accepted: accepted,
                    tokens,
                });
                Ok((accepted, tokens))
            }
            SaleType::Pooled => {
                let cumulative =
                    entry.deposited.checked_add(deposit).ok_or(SaleError::MathOverflow)?;
                if cumulative > tier.max_amount {
                    return Err(SaleError::AboveMaximum);
                }

                // escrow the full commitment; conversion happens at settlement
                self.funds.transfer_from(
                    buyer,
                    tier.deposit_asset,
                    self.funds.escrow_address(),
                    deposit,
                )?;

                let book = staged.books.entry(id).or_default();
                let e = book.ledger.entry(buyer).or_default();
                e.deposited = cumulative;
                book.escrow += deposit;
                book.committed += deposit;
                *staged.wallets.entry(buyer).or_default() += deposit;
                *self.state.write() = staged;

                debug!(tier = id.0, buyer = ?buyer, deposit, "pool commitment escrowed");
                let _ = self.events_tx.send(SaleEvent::PoolCommitted { tier: id, buyer, amount: deposit });
                Ok((deposit, 0))
            }
        }
    }

    /// Route purchased tokens per the tier's transfer type. The engine acts
    /// as a LockedFund depositor-admin under its escrow address.
    fn route_tokens(&self, tier: &Tier, buyer: Address, tokens: Balance) -> Result<(), SaleError> {
        let escrow = self.funds.escrow_address();
        match tier.transfer {
            TransferType::Unlocked => {
                self.funds.transfer(self.sale_token, buyer, tokens)?;
            }
            TransferType::WaitedUnlock => {
                self.locked
                    .deposit_waited_unlocked(escrow, buyer, tokens, tier.unlock_bps, false)?;
            }
            TransferType::Vested => {
                self.locked.deposit_vested(
                    escrow,
                    buyer,
                    tokens,
                    tier.vest_cliff_s,
                    tier.vest_duration_s,
                    tier.unlock_bps,
                    UnlockType::Immediate,
                    false,
                )?;
            }
            TransferType::Locked => {
                self.locked.deposit_vested(
                    escrow,
                    buyer,
                    tokens,
                    tier.vest_cliff_s,
                    tier.vest_duration_s,
                    0,
                    UnlockType::Immediate,
                    false,
                )?;
            }
            // unreachable: is_configured() is checked before settlement
            TransferType::None => return Err(SaleError::TierNotConfigured),
        }
        Ok(())
    }

    // ---------- Pooled settlement ----------

    /// Compute allocations and refunds for a closed pooled tier. Oversold
    /// pools are allocated pro rata by committed deposit with deterministic
    /// largest-remainder correction.
    pub fn settle_pool(&self, caller: Address, id: TierId) -> Result<(), SaleError> {
        self.require_owner(caller)?;
        let _ex = self.exec.lock();
        let mut staged = self.state.read().clone();
        let tier = staged.tiers.get(&id).ok_or(SaleError::TierNotFound)?.clone();
        if tier.sale_type != SaleType::Pooled {
            return Err(SaleError::NotPooled);
        }
        let book = staged.books.entry(id).or_default();
        if book.settled {
            return Err(SaleError::AlreadySettled);
        }
        let now = self.funds.now_unix();
        if !tier_finished(&tier, book, now) {
            return Err(SaleError::TierNotFinished);
        }

        let rate = tier.deposit_rate;
        let remaining = tier.remaining_tokens;
        let committed = book.committed;

        // demand at full conversion
        let mut demand: Balance = 0;
        for e in book.ledger.values() {
            demand = demand
                .checked_add(rate.tokens_for(e.deposited).ok_or(SaleError::MathOverflow)?)
                .ok_or(SaleError::MathOverflow)?;
        }

        let mut allocations: BTreeMap<Address, Balance> = BTreeMap::new();
        if demand <= remaining || committed == 0 {
            for (a, e) in book.ledger.iter() {
                allocations.insert(*a, rate.tokens_for(e.deposited).ok_or(SaleError::MathOverflow)?);
            }
        } else {
            // floor pass
            let mut floor_total: Balance = 0;
            let mut remainders: Vec<(Address, u128, Balance)> = Vec::with_capacity(book.ledger.len());
            for (a, e) in book.ledger.iter() {
                let alloc = mul_div(remaining, e.deposited, committed).ok_or(SaleError::MathOverflow)?;
                let rem = remaining
                    .checked_mul(e.deposited)
                    .ok_or(SaleError::MathOverflow)?
                    % committed;
                let cap = rate.tokens_for(e.deposited).ok_or(SaleError::MathOverflow)?;
                floor_total += alloc;
                allocations.insert(*a, alloc);
                remainders.push((*a, rem, cap));
            }
            // distribute the floor leftover by largest remainder, address
            // ascending for determinism; never exceed a wallet's demand
            let mut leftover = remaining - floor_total;
            remainders.sort_by(|x, y| y.1.cmp(&x.1).then_with(|| x.0.cmp(&y.0)));
            for (a, _rem, cap) in remainders {
                if leftover == 0 {
                    break;
                }
                let alloc = allocations.get_mut(&a).ok_or(SaleError::MathOverflow)?;
                if *alloc < cap {
                    *alloc += 1;
                    leftover -= 1;
                }
            }
        }

        // apply: snap each allocation to the exact-price grid so the used
        // deposit pays for exactly the allocated tokens, refund the rest
        let mut tokens_total: Balance = 0;
        let mut proceeds: Balance = 0;
        let mut refunds: Balance = 0;
        for (a, e) in book.ledger.iter_mut() {
            let alloc = allocations.get(a).copied().unwrap_or(0);
            let (alloc, used) = snap_allocation(rate, alloc).ok_or(SaleError::MathOverflow)?;
            e.tokens = alloc;
            e.refund = e.deposited - used;
            e.deposited = used;
            tokens_total += alloc;
            proceeds += used;
            refunds += e.refund;
        }

        book.tokens_sold += tokens_total;
        book.proceeds += proceeds;
        book.settled = true;
        book.closed = true;
        let t = staged.tiers.get_mut(&id).ok_or(SaleError::TierNotFound)?;
        t.remaining_tokens -= tokens_total;
        *self.state.write() = staged;

        info!(tier = id.0, tokens_total, proceeds, refunds, "pool settled");
        let _ = self.events_tx.send(SaleEvent::PoolSettled {
            tier: id,
            tokens_allocated: tokens_total,
            proceeds,
            refunds,
        });
        Ok(())
    }

    /// Claim a settled pooled allocation: routes tokens per the tier's
    /// transfer type and refunds unused escrow. One claim per address.
    pub fn claim_pooled(&self, buyer: Address, id: TierId) -> Result<(Balance, Balance), SaleError> {
        let _ex = self.exec.lock();
        let mut staged = self.state.read().clone();
        let tier = staged.tiers.get(&id).ok_or(SaleError::TierNotFound)?.clone();
        if tier.sale_type != SaleType::Pooled {
            return Err(SaleError::NotPooled);
        }
        let book = staged.books.entry(id).or_default();
        if !book.settled {
            return Err(SaleError::NotSettled);
        }
        let entry = book.ledger.get(&buyer).copied().ok_or(SaleError::NothingToClaim)?;
        if entry.claimed {
            return Err(SaleError::AlreadyClaimed);
        }

        if entry.tokens > 0 {
            self.route_tokens(&tier, buyer, entry.tokens)?;
        }
        if entry.refund > 0 {
            self.funds.transfer(tier.deposit_asset, buyer, entry.refund)?;
        }

        let book = staged.books.entry(id).or_default();
        let e = book.ledger.get_mut(&buyer).ok_or(SaleError::NothingToClaim)?;
        e.claimed = true;
        let refund = e.refund;
        e.refund = 0;
        book.escrow -= refund;
        *self.state.write() = staged;

        debug!(tier = id.0, buyer = ?buyer, tokens = entry.tokens, refund, "pool claim");
        let _ = self.events_tx.send(SaleEvent::PoolClaimed {
            tier: id,
            buyer,
            tokens: entry.tokens,
            refund,
        });
        Ok((entry.tokens, refund))
    }

    // ---------- Proceeds ----------

    /// Withdraw a finished tier's escrowed proceeds; succeeds exactly once.
    pub fn withdraw_proceeds(&self, caller: Address, id: TierId) -> Result<Balance, SaleError> {
        self.require_owner(caller)?;
        let _ex = self.exec.lock();
        let mut staged = self.state.read().clone();
        let tier = staged.tiers.get(&id).ok_or(SaleError::TierNotFound)?.clone();
        let book = staged.books.entry(id).or_default();
        if book.withdrawn {
            return Err(SaleError::ProceedsAlreadyWithdrawn);
        }
        let now = self.funds.now_unix();
        if !tier_finished(&tier, book, now) {
            return Err(SaleError::TierNotFinished);
        }
        if tier.sale_type == SaleType::Pooled && !book.settled {
            return Err(SaleError::NotSettled);
        }

        let amount = book.proceeds;
        let to = tier.deposit_address.unwrap_or_else(|| *self.owner.read());
        if amount > 0 {
            self.funds.transfer(tier.deposit_asset, to, amount)?;
        }
        book.withdrawn = true;
        book.proceeds = 0;
        book.escrow -= amount;
        book.closed = true;
        *self.state.write() = staged;

        info!(tier = id.0, to = ?to, amount, "proceeds withdrawn");
        let _ = self.events_tx.send(SaleEvent::ProceedsWithdrawn { tier: id, to, amount });
        Ok(amount)
    }

    // ---------- Reads ----------

    pub fn tier(&self, id: TierId) -> Option<Tier> {
        self.state.read().tiers.get(&id).cloned()
    }

    pub fn ledger(&self, id: TierId, who: Address) -> Option<LedgerEntry> {
        self.state.read().books.get(&id)?.ledger.get(&who).copied()
    }

    pub fn is_verified(&self, id: TierId, who: Address) -> bool {
        self.state
            .read()
            .books
            .get(&id)
            .map(|b| b.verified.contains(&who))
            .unwrap_or(false)
    }

    /// Total deposited by `who` across all tiers.
    pub fn deposited_total(&self, who: Address) -> Balance {
        self.state.read().wallets.get(&who).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> SaleSnapshot {
        let st = self.state.read();
        SaleSnapshot { tier_count: st.tiers.len(), participants: st.wallets.len() }
    }

    pub fn tier_stats(&self, id: TierId) -> Option<TierStats> {
        let st = self.state.read();
        let tier = st.tiers.get(&id)?;
        let book = st.books.get(&id)?;
        Some(TierStats {
            tokens_sold: book.tokens_sold,
            remaining_tokens: tier.remaining_tokens,
            participants: book.ledger.len(),
            escrow: book.escrow,
            closed: book.closed,
            settled: book.settled,
            withdrawn: book.withdrawn,
        })
    }
}

/// Largest allocation not above `alloc` that a whole-unit deposit buys
/// exactly under truncating conversion, with that deposit. Guarantees
/// `rate.tokens_for(used) == snapped`, so no deposit value is silently lost.
fn snap_allocation(rate: DepositRate, alloc: Balance) -> Option<(Balance, Balance)> {
    if alloc == 0 {
        return Some((0, 0));
    }
    let d_max = crate::mul_div_ceil(alloc.checked_add(1)?, rate.den, rate.num)?.checked_sub(1)?;
    let snapped = rate.tokens_for(d_max)?;
    let used = rate.deposit_for(snapped)?;
    Some((snapped, used))
}

/// Whether the tier can no longer accept purchases at `now`.
fn tier_finished(tier: &Tier, book: &TierBook, now: u64) -> bool {
    if book.closed {
        return true;
    }
    match tier.sale_end {
        SaleEnd::None => false,
        SaleEnd::UntilSupply => tier.remaining_tokens == 0,
        SaleEnd::Duration(_) | SaleEnd::Timestamp(_) => {
            tier.end_ts().map(|e| now >= e).unwrap_or(false)
        }
    }
}
