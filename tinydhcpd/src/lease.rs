//! In-memory lease table: the authoritative record of which hardware
//! address currently holds which address, and until when.
//!
//! Keeps two indices, by hardware address and by IP, so a lookup in either
//! direction and a collision check on `upsert` are all O(1) rather than a
//! scan over every live binding; persistence to disk lives separately in
//! [`crate::store`].

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::wire::HardwareAddress;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("address {0} is already bound to a different client")]
    AddressInUse(Ipv4Addr),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// Reserved for a DISCOVER/OFFER handshake; expires quickly if the
    /// client never follows up with a REQUEST.
    Offered,
    /// Confirmed via REQUEST/ACK; expires after the configured lease time.
    Bound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub ip: Ipv4Addr,
    pub expires_at: u64,
    pub state: LeaseState,
}

impl Binding {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// The default offer hold time: long enough for a DISCOVER/OFFER/REQUEST/ACK
/// round trip, short enough that a client that never follows up doesn't
/// squat on an address.
pub const OFFER_TTL_SECS: u64 = 10;

/// The sentinel under which a declined address is recorded, so that no
/// other `HardwareAddress` may claim it until an operator intervenes.
pub fn declined_owner() -> HardwareAddress {
    HardwareAddress::ZERO
}

pub struct LeaseTable {
    by_hw: HashMap<HardwareAddress, Binding>,
    by_ip: HashMap<Ipv4Addr, HardwareAddress>,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self {
            by_hw: HashMap::new(),
            by_ip: HashMap::new(),
        }
    }

    /// Looks up the current binding for `hw`, eagerly dropping it first if
    /// it has expired: expired bindings never answer a lookup as if they
    /// were live.
    pub fn get(&mut self, hw: &HardwareAddress, now: u64) -> Option<Binding> {
        self.reclaim_one(hw, now);
        self.by_hw.get(hw).cloned()
    }

    /// Returns the owner of `ip`, if any, after reclaiming it when expired.
    pub fn owner_of(&mut self, ip: Ipv4Addr, now: u64) -> Option<HardwareAddress> {
        if let Some(hw) = self.by_ip.get(&ip).copied() {
            self.reclaim_one(&hw, now);
        }
        self.by_ip.get(&ip).copied()
    }

    pub fn is_in_use(&mut self, ip: Ipv4Addr, now: u64) -> bool {
        self.owner_of(ip, now).is_some()
    }

    /// Inserts or refreshes a binding. Fails with [`LeaseError::AddressInUse`]
    /// if `ip` is currently (non-expired) held by a different hardware
    /// address -- an IP can never be bound to two hardware addresses at
    /// once.
    pub fn upsert(
        &mut self,
        hw: HardwareAddress,
        ip: Ipv4Addr,
        ttl_secs: u64,
        state: LeaseState,
        now: u64,
    ) -> Result<(), LeaseError> {
        if let Some(owner) = self.owner_of(ip, now) {
            if owner != hw {
                return Err(LeaseError::AddressInUse(ip));
            }
        }

        // If this hw previously held a different ip, free that reverse
        // mapping so the table never maps one hw to two live ips.
        if let Some(prev) = self.by_hw.get(&hw) {
            if prev.ip != ip {
                self.by_ip.remove(&prev.ip);
            }
        }

        let expires_at = if ttl_secs == u64::MAX {
            u64::MAX
        } else {
            now.saturating_add(ttl_secs)
        };

        self.by_hw.insert(hw, Binding { ip, expires_at, state });
        self.by_ip.insert(ip, hw);

        Ok(())
    }

    /// Removes `hw`'s binding outright.
    pub fn release(&mut self, hw: &HardwareAddress) {
        if let Some(binding) = self.by_hw.remove(hw) {
            if self.by_ip.get(&binding.ip) == Some(hw) {
                self.by_ip.remove(&binding.ip);
            }
        }
    }

    /// Marks `ip` as permanently unavailable under the all-zero sentinel
    /// hardware address, evicting whatever previously held it.
    pub fn mark_declined(&mut self, ip: Ipv4Addr) {
        if let Some(prev_owner) = self.by_ip.get(&ip).copied() {
            if prev_owner != declined_owner() {
                self.by_hw.remove(&prev_owner);
            }
        }

        let sentinel = declined_owner();
        self.by_hw.insert(
            sentinel,
            Binding {
                ip,
                expires_at: u64::MAX,
                state: LeaseState::Bound,
            },
        );
        self.by_ip.insert(ip, sentinel);
    }

    /// Drops every binding (declines included, since `now` can never reach
    /// `u64::MAX`) whose `expires_at` is at or before `now`.
    pub fn reclaim(&mut self, now: u64) {
        let expired: Vec<HardwareAddress> = self
            .by_hw
            .iter()
            .filter(|(_, b)| b.is_expired(now))
            .map(|(hw, _)| *hw)
            .collect();

        for hw in expired {
            self.release(&hw);
        }
    }

    fn reclaim_one(&mut self, hw: &HardwareAddress, now: u64) {
        let expired = self.by_hw.get(hw).is_some_and(|b| b.is_expired(now));
        if expired {
            self.release(hw);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HardwareAddress, &Binding)> {
        self.by_hw.iter()
    }

    pub fn len(&self) -> usize {
        self.by_hw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hw.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw(b: u8) -> HardwareAddress {
        HardwareAddress::new(1, &[0, 0, 0, 0, 0, b])
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let mut table = LeaseTable::new();
        let a = hw(1);
        table
            .upsert(a, Ipv4Addr::new(192, 168, 0, 100), 3600, LeaseState::Bound, 0)
            .unwrap();

        let binding = table.get(&a, 10).unwrap();
        assert_eq!(binding.ip, Ipv4Addr::new(192, 168, 0, 100));
        assert_eq!(binding.expires_at, 3600);
    }

    #[test]
    fn rejects_collision_with_live_binding() {
        let mut table = LeaseTable::new();
        let ip = Ipv4Addr::new(192, 168, 0, 100);
        table.upsert(hw(1), ip, 3600, LeaseState::Bound, 0).unwrap();

        let err = table.upsert(hw(2), ip, 3600, LeaseState::Offered, 0).unwrap_err();
        assert!(matches!(err, LeaseError::AddressInUse(got) if got == ip));
    }

    #[test]
    fn allows_reuse_after_expiry() {
        let mut table = LeaseTable::new();
        let ip = Ipv4Addr::new(192, 168, 0, 100);
        table.upsert(hw(1), ip, 10, LeaseState::Offered, 0).unwrap();

        // Expired by t=11; a second client may now claim it.
        table.upsert(hw(2), ip, 3600, LeaseState::Bound, 11).unwrap();
        assert_eq!(table.owner_of(ip, 11), Some(hw(2)));
    }

    #[test]
    fn release_frees_both_indices() {
        let mut table = LeaseTable::new();
        let ip = Ipv4Addr::new(192, 168, 0, 100);
        table.upsert(hw(1), ip, 3600, LeaseState::Bound, 0).unwrap();
        table.release(&hw(1));

        assert!(table.get(&hw(1), 0).is_none());
        assert!(table.owner_of(ip, 0).is_none());
    }

    #[test]
    fn declined_address_blocks_every_client_forever() {
        let mut table = LeaseTable::new();
        let ip = Ipv4Addr::new(192, 168, 0, 100);
        table.mark_declined(ip);

        let err = table.upsert(hw(1), ip, 3600, LeaseState::Offered, 1_000_000).unwrap_err();
        assert!(matches!(err, LeaseError::AddressInUse(_)));
    }

    #[test]
    fn reclaim_sweeps_all_expired_bindings() {
        let mut table = LeaseTable::new();
        table
            .upsert(hw(1), Ipv4Addr::new(192, 168, 0, 100), 5, LeaseState::Offered, 0)
            .unwrap();
        table
            .upsert(hw(2), Ipv4Addr::new(192, 168, 0, 101), 3600, LeaseState::Bound, 0)
            .unwrap();

        table.reclaim(6);

        assert!(table.get(&hw(1), 6).is_none());
        assert!(table.get(&hw(2), 6).is_some());
    }
}
