//! Linear vesting schedules and the default in-process registry.
//!
//! Features:
//! - Cliff followed by linear accrual over a fixed duration, optionally
//!   discretized to full intervals
//! - Checked u128 math with a 256-bit intermediate for `principal * elapsed`
//! - `ScheduleBook`: thread-safe registry; fully withdrawn records are
//!   destroyed
//!
//! Time model: seconds since Unix epoch (u64), supplied by the caller. All
//! computations are deterministic and monotonic in the time input.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lockedfund::VestingRegistry;
use crate::{Address, Balance};

/// Identifier of a schedule inside a registry.
pub type ScheduleId = u64;

/// Errors returned by vesting operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VestingError {
    #[error("invalid schedule: {0}")]
    Invalid(&'static str),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("schedule not found")]
    NotFound,
}

/// One linear vesting position. The unlock-bps split happens upstream in
/// LockedFund; `principal` here is only the vesting remainder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schedule {
    pub beneficiary: Address,
    pub principal: Balance,
    /// Schedule start; the cliff counts from here.
    pub start_ts: u64,
    pub cliff_s: u64,
    /// Linear accrual duration after the cliff.
    pub duration_s: u64,
    /// Accrual granularity in seconds (>= 1; 1 = continuous).
    pub interval_s: u64,
    /// Amount already released to the beneficiary.
    pub released: Balance,
}

impl Schedule {
    pub fn new(
        beneficiary: Address,
        principal: Balance,
        start_ts: u64,
        cliff_s: u64,
        duration_s: u64,
        interval_s: u64,
    ) -> Result<Self, VestingError> {
        if principal == 0 {
            return Err(VestingError::Invalid("principal must be > 0"));
        }
        if duration_s == 0 {
            return Err(VestingError::Invalid("duration cannot be zero"));
        }
        if interval_s == 0 {
            return Err(VestingError::Invalid("interval must be >= 1"));
        }
        start_ts
            .checked_add(cliff_s)
            .and_then(|c| c.checked_add(duration_s))
            .ok_or(VestingError::Overflow)?;
        Ok(Self { beneficiary, principal, start_ts, cliff_s, duration_s, interval_s, released: 0 })
    }

    /// End of the cliff; linear accrual begins here.
    #[inline]
    pub fn cliff_end(&self) -> u64 {
        self.start_ts + self.cliff_s
    }

    /// Accrual saturates at this timestamp.
    #[inline]
    pub fn end_ts(&self) -> u64 {
        self.cliff_end() + self.duration_s
    }

    /// Vested amount at `now`: zero until the cliff ends, then linear in full
    /// `interval_s` steps, saturating at the principal at `cliff + duration`.
    pub fn vested_at(&self, now: u64) -> Result<Balance, VestingError> {
        let cliff_end = self.cliff_end();
        if now < cliff_end {
            return Ok(0);
        }
        if now >= self.end_ts() {
            return Ok(self.principal);
        }
        let elapsed = now - cliff_end;
        let discrete = (elapsed / self.interval_s) * self.interval_s;
        mul_div_wide(self.principal, u128::from(discrete), u128::from(self.duration_s))
    }

    /// Vested but not yet released at `now`.
    pub fn releasable_at(&self, now: u64) -> Result<Balance, VestingError> {
        let v = self.vested_at(now)?;
        v.checked_sub(self.released).ok_or(VestingError::Overflow)
    }

    /// Release everything releasable at `now`; returns the delta.
    pub fn release(&mut self, now: u64) -> Result<Balance, VestingError> {
        let delta = self.releasable_at(now)?;
        self.released = self.released.checked_add(delta).ok_or(VestingError::Overflow)?;
        Ok(delta)
    }

    /// Whole principal released; the record can be destroyed.
    #[inline]
    pub fn consumed(&self) -> bool {
        self.released >= self.principal
    }
}

// ---------- Wide math ----------

/// floor((a * b) / d) with a 256-bit intermediate product.
fn mul_div_wide(a: u128, b: u128, d: u128) -> Result<u128, VestingError> {
    if d == 0 {
        return Err(VestingError::Invalid("division by zero"));
    }
    if let Some(p) = a.checked_mul(b) {
        return Ok(p / d);
    }
    let (hi, lo) = mul_wide(a, b);
    if hi >= d {
        // quotient would not fit into u128
        return Err(VestingError::Overflow);
    }
    Ok(div_wide(hi, lo, d))
}

/// 128x128 -> 256 multiplication in two limbs.
fn mul_wide(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = (1u128 << 64) - 1;
    let (a1, a0) = (a >> 64, a & MASK);
    let (b1, b0) = (b >> 64, b & MASK);

    let p00 = a0 * b0;
    let p01 = a0 * b1;
    let p10 = a1 * b0;
    let p11 = a1 * b1;

    let mid = (p00 >> 64) + (p01 & MASK) + (p10 & MASK);
    let lo = (p00 & MASK) | (mid << 64);
    let hi = p11 + (p01 >> 64) + (p10 >> 64) + (mid >> 64);
    (hi, lo)
}

/// Restoring division of the 256-bit value (hi:lo) by d; requires hi < d so
/// the quotient fits into u128.
fn div_wide(hi: u128, lo: u128, d: u128) -> u128 {
    let mut q = 0u128;
    let mut r = 0u128;
    for i in (0..256).rev() {
        let bit = if i >= 128 { (hi >> (i - 128)) & 1 } else { (lo >> i) & 1 };
        let carry = r >> 127;
        r = (r << 1) | bit;
        // carry == 1 means the true remainder overflowed 128 bits; it is
        // still < 2d, so one subtraction restores it.
        if carry == 1 || r >= d {
            r = r.wrapping_sub(d);
            if i < 128 {
                q |= 1u128 << i;
            }
        }
    }
    q
}

// ---------- Registry ----------

/// In-process [`VestingRegistry`]: the default collaborator wired into
/// LockedFund. Fully consumed schedules are removed on release.
pub struct ScheduleBook {
    interval_s: u64,
    inner: RwLock<Book>,
}

#[derive(Default)]
struct Book {
    next_id: ScheduleId,
    schedules: BTreeMap<ScheduleId, Schedule>,
    by_beneficiary: BTreeMap<Address, Vec<ScheduleId>>,
}

impl ScheduleBook {
    /// Continuous (per-second) accrual.
    pub fn new() -> Self {
        Self::with_interval(1)
    }

    /// Accrue in full `interval_s` steps.
    pub fn with_interval(interval_s: u64) -> Self {
        Self { interval_s: interval_s.max(1), inner: RwLock::new(Book::default()) }
    }

    pub fn get(&self, id: ScheduleId) -> Option<Schedule> {
        self.inner.read().schedules.get(&id).cloned()
    }

    pub fn schedules_of(&self, beneficiary: Address) -> Vec<Schedule> {
        let g = self.inner.read();
        g.by_beneficiary
            .get(&beneficiary)
            .map(|ids| ids.iter().filter_map(|id| g.schedules.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

impl Default for ScheduleBook {
    fn default() -> Self {
        Self::new()
    }
}

impl VestingRegistry for ScheduleBook {
    fn create_schedule(
        &self,
        beneficiary: Address,
        principal: Balance,
        start_ts: u64,
        cliff_s: u64,
        duration_s: u64,
    ) -> Result<ScheduleId, VestingError> {
        let sch = Schedule::new(beneficiary, principal, start_ts, cliff_s, duration_s, self.interval_s)?;
        let mut g = self.inner.write();
        let id = g.next_id;
        g.next_id = g.next_id.wrapping_add(1);
        g.schedules.insert(id, sch);
        g.by_beneficiary.entry(beneficiary).or_default().push(id);
        Ok(id)
    }

    fn releasable(&self, beneficiary: Address, now: u64) -> Result<Balance, VestingError> {
        let g = self.inner.read();
        let mut total: Balance = 0;
        if let Some(ids) = g.by_beneficiary.get(&beneficiary) {
            for id in ids {
                if let Some(sch) = g.schedules.get(id) {
                    total = total
                        .checked_add(sch.releasable_at(now)?)
                        .ok_or(VestingError::Overflow)?;
                }
            }
        }
        Ok(total)
    }

    fn release(&self, beneficiary: Address, now: u64) -> Result<Balance, VestingError> {
        let mut g = self.inner.write();
        let Book { schedules, by_beneficiary, .. } = &mut *g;
        let mut total: Balance = 0;
        let mut now_empty = false;
        if let Some(ids) = by_beneficiary.get_mut(&beneficiary) {
            let mut kept = Vec::with_capacity(ids.len());
            for id in ids.iter() {
                if let Some(sch) = schedules.get_mut(id) {
                    total = total.checked_add(sch.release(now)?).ok_or(VestingError::Overflow)?;
                    if sch.consumed() {
                        schedules.remove(id);
                    } else {
                        kept.push(*id);
                    }
                }
            }
            *ids = kept;
            now_empty = ids.is_empty();
        }
        if now_empty {
            by_beneficiary.remove(&beneficiary);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(x: u8) -> Address {
        let mut a = [0u8; 20];
        a[0] = x;
        Address(a)
    }

    const P: Balance = 1_000_000;

    #[test]
    fn rejects_zero_duration() {
        let err = Schedule::new(addr(1), P, 0, 0, 0, 1).unwrap_err();
        assert_eq!(err, VestingError::Invalid("duration cannot be zero"));
    }

    #[test]
    fn cliff_then_linear_then_saturation() {
        let s = Schedule::new(addr(1), P, 1_000, 500, 1_000, 1).unwrap();
        assert_eq!(s.vested_at(999).unwrap(), 0);
        assert_eq!(s.vested_at(1_499).unwrap(), 0); // inside cliff
        assert_eq!(s.vested_at(1_500).unwrap(), 0); // linear starts here
        assert_eq!(s.vested_at(2_000).unwrap(), P / 2);
        assert_eq!(s.vested_at(2_500).unwrap(), P); // exactly cliff + duration
        assert_eq!(s.vested_at(u64::MAX).unwrap(), P);
    }

    #[test]
    fn vesting_is_monotonic() {
        let s = Schedule::new(addr(1), P, 0, 100, 900, 7).unwrap();
        let mut prev = 0;
        for now in 0..1_200 {
            let v = s.vested_at(now).unwrap();
            assert!(v >= prev, "non-monotonic at {now}");
            prev = v;
        }
        assert_eq!(prev, P);
    }

    #[test]
    fn interval_discretization() {
        let s = Schedule::new(addr(1), P, 0, 0, 1_000, 100).unwrap();
        assert_eq!(s.vested_at(99).unwrap(), 0);
        assert_eq!(s.vested_at(100).unwrap(), P / 10);
        assert_eq!(s.vested_at(199).unwrap(), P / 10);
    }

    #[test]
    fn release_tracks_and_consumes() {
        let mut s = Schedule::new(addr(1), P, 0, 0, 100, 1).unwrap();
        assert_eq!(s.release(50).unwrap(), P / 2);
        assert_eq!(s.release(50).unwrap(), 0);
        assert_eq!(s.release(100).unwrap(), P / 2);
        assert!(s.consumed());
    }

    #[test]
    fn wide_math_survives_huge_principals() {
        // principal * elapsed overflows u128; the wide path must not.
        let principal = u128::MAX / 2;
        let s = Schedule::new(addr(1), principal, 0, 0, u64::MAX, 1).unwrap();
        let half = s.vested_at(u64::MAX / 2).unwrap();
        let expected = principal / 2;
        // within one quantum of the exact midpoint
        assert!(half <= expected && expected - half <= principal / u128::from(u64::MAX) + 1);
        assert_eq!(s.vested_at(u64::MAX).unwrap(), principal);
    }

    #[test]
    fn registry_releases_and_destroys() {
        let book = ScheduleBook::new();
        let b = addr(9);
        let id = book.create_schedule(b, 600, 0, 0, 600).unwrap();
        assert_eq!(book.releasable(b, 300).unwrap(), 300);
        assert_eq!(book.release(b, 300).unwrap(), 300);
        assert_eq!(book.release(b, 300).unwrap(), 0);
        assert!(book.get(id).is_some());
        assert_eq!(book.release(b, 600).unwrap(), 300);
        assert!(book.get(id).is_none(), "consumed record must be destroyed");
        assert!(book.schedules_of(b).is_empty());
    }
}
