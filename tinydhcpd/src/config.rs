//! Immutable subnet configuration consumed by [`crate::policy::Policy`] and
//! [`crate::engine::Engine`].
//!
//! This module only holds the already-validated data types; turning an
//! on-disk configuration file into a [`SubnetConfig`] is a collaborator
//! outside the core, left to the `tinydhcpd-server` binary's own `config`
//! module.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::wire::HardwareAddress;

pub const DEFAULT_LEASE_SECONDS: u32 = 3600;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("range_start/range_end/network do not share a network under netmask")]
    RangeNotInNetwork,
    #[error("range_start is greater than range_end")]
    EmptyRange,
    #[error("reservation for {hw} resolves to {ip}, which is outside network/netmask")]
    ReservationOutsideNetwork { hw: HardwareAddress, ip: Ipv4Addr },
}

#[derive(Clone, Debug)]
pub struct SubnetConfig {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub lease_seconds: u32,
    pub reservations: HashMap<HardwareAddress, Ipv4Addr>,
    pub defaults: HashMap<u8, Vec<u8>>,
}

impl SubnetConfig {
    pub fn new(
        network: Ipv4Addr,
        netmask: Ipv4Addr,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        lease_seconds: u32,
        reservations: HashMap<HardwareAddress, Ipv4Addr>,
        defaults: HashMap<u8, Vec<u8>>,
    ) -> Result<Self, ConfigError> {
        let masked = |ip: Ipv4Addr| u32::from(ip) & u32::from(netmask);

        if masked(range_start) != masked(network) || masked(range_end) != masked(network) {
            return Err(ConfigError::RangeNotInNetwork);
        }

        if u32::from(range_start) > u32::from(range_end) {
            return Err(ConfigError::EmptyRange);
        }

        for (&hw, &ip) in &reservations {
            if masked(ip) != masked(network) {
                return Err(ConfigError::ReservationOutsideNetwork { hw, ip });
            }
        }

        Ok(Self {
            network,
            netmask,
            range_start,
            range_end,
            lease_seconds,
            reservations,
            defaults,
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.netmask) == u32::from(self.network) & u32::from(self.netmask)
    }

    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        ip >= u32::from(self.range_start) && ip <= u32::from(self.range_end)
    }

    pub fn reservation_for(&self, hw: &HardwareAddress) -> Option<Ipv4Addr> {
        self.reservations.get(hw).copied()
    }

    /// Ascending iterator over every address in the pool, inclusive.
    pub fn pool(&self) -> impl Iterator<Item = Ipv4Addr> {
        let start = u32::from(self.range_start);
        let end = u32::from(self.range_end);
        (start..=end).map(Ipv4Addr::from)
    }
}
