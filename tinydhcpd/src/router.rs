//! Reply routing: decide whether a reply goes out broadcast, unicast, or to
//! a relay, and prime the host's neighbor cache when a unicast reply must
//! reach a client that does not yet own its address.

use std::net::Ipv4Addr;

use crate::wire::{Frame, HardwareAddress};

pub const CLIENT_PORT: u16 = 68;
pub const SERVER_PORT: u16 = 67;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("failed to install neighbor cache entry: {0}")]
    ArpInjectFailed(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Abstraction over installing a static neighbor-cache (ARP) entry on the
/// receiving interface, so the implementation backing it (rtnetlink today,
/// conceivably something else later) stays out of the routing decision
/// itself. `rtnetlink RTM_NEWNEIGH` is preferred here over the deprecated
/// `SIOCSARP` ioctl.
pub trait NeighborCache {
    fn set_entry(&self, iface: &str, ip: Ipv4Addr, hw: &HardwareAddress) -> Result<(), RouterError>;
}

pub struct Router;

impl Router {
    /// Applies the three destination rules in order -- relay, broadcast,
    /// unicast -- and performs neighbor-cache priming for the unicast case.
    /// Falls back to broadcast if priming fails rather than dropping the
    /// reply.
    pub fn route(
        req: &Frame,
        ip: Ipv4Addr,
        iface_name: &str,
        iface_bcast: Ipv4Addr,
        neighbor_cache: &dyn NeighborCache,
    ) -> Destination {
        // Rule 1: relayed request always goes back to the relay.
        if req.giaddr != Ipv4Addr::UNSPECIFIED {
            return Destination {
                addr: req.giaddr,
                port: SERVER_PORT,
            };
        }

        let wants_broadcast = req.broadcast_flag()
            || req.hlen == 0
            || req.chaddr_is_zero()
            || ip == Ipv4Addr::UNSPECIFIED;

        if wants_broadcast {
            return Destination {
                addr: iface_bcast,
                port: CLIENT_PORT,
            };
        }

        // Rule 3: the client does not yet own `ip`, so it cannot answer
        // ARP for it; install a static mapping before unicasting.
        let hw = req.hardware_address();
        match neighbor_cache.set_entry(iface_name, ip, &hw) {
            Ok(()) => Destination {
                addr: ip,
                port: CLIENT_PORT,
            },
            Err(e) => {
                log_warn(&e);
                Destination {
                    addr: iface_bcast,
                    port: CLIENT_PORT,
                }
            }
        }
    }
}

#[cfg(feature = "log")]
fn log_warn(e: &RouterError) {
    log::warn!("{e}; falling back to broadcast");
}

#[cfg(not(feature = "log"))]
fn log_warn(_e: &RouterError) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{DhcpMessageType, Options};

    struct AlwaysOk;
    impl NeighborCache for AlwaysOk {
        fn set_entry(&self, _iface: &str, _ip: Ipv4Addr, _hw: &HardwareAddress) -> Result<(), RouterError> {
            Ok(())
        }
    }

    struct AlwaysFails;
    impl NeighborCache for AlwaysFails {
        fn set_entry(&self, _iface: &str, _ip: Ipv4Addr, _hw: &HardwareAddress) -> Result<(), RouterError> {
            Err(RouterError::ArpInjectFailed("denied".into()))
        }
    }

    fn base_request() -> Frame {
        let mut options = Options::new();
        options.set_message_type(DhcpMessageType::Discover);
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);

        Frame {
            op: Frame::OP_REQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 1,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options,
        }
    }

    #[test]
    fn relayed_request_goes_back_to_the_relay() {
        let mut req = base_request();
        req.giaddr = Ipv4Addr::new(192, 168, 1, 1);

        let dest = Router::route(
            &req,
            Ipv4Addr::new(192, 168, 0, 100),
            "eth0",
            Ipv4Addr::new(192, 168, 0, 255),
            &AlwaysOk,
        );

        assert_eq!(dest, Destination { addr: req.giaddr, port: SERVER_PORT });
    }

    #[test]
    fn broadcast_flag_forces_broadcast_destination() {
        let mut req = base_request();
        req.flags = 0x8000;

        let dest = Router::route(
            &req,
            Ipv4Addr::new(192, 168, 0, 100),
            "eth0",
            Ipv4Addr::new(192, 168, 0, 255),
            &AlwaysOk,
        );

        assert_eq!(dest.addr, Ipv4Addr::new(192, 168, 0, 255));
        assert_eq!(dest.port, CLIENT_PORT);
    }

    #[test]
    fn default_case_unicasts_after_priming_neighbor_cache() {
        let req = base_request();

        let dest = Router::route(
            &req,
            Ipv4Addr::new(192, 168, 0, 100),
            "eth0",
            Ipv4Addr::new(192, 168, 0, 255),
            &AlwaysOk,
        );

        assert_eq!(dest.addr, Ipv4Addr::new(192, 168, 0, 100));
        assert_eq!(dest.port, CLIENT_PORT);
    }

    #[test]
    fn neighbor_cache_failure_falls_back_to_broadcast() {
        let req = base_request();

        let dest = Router::route(
            &req,
            Ipv4Addr::new(192, 168, 0, 100),
            "eth0",
            Ipv4Addr::new(192, 168, 0, 255),
            &AlwaysFails,
        );

        assert_eq!(dest.addr, Ipv4Addr::new(192, 168, 0, 255));
    }

    #[test]
    fn zero_chaddr_forces_broadcast() {
        let mut req = base_request();
        req.chaddr = [0u8; 16];

        let dest = Router::route(
            &req,
            Ipv4Addr::new(192, 168, 0, 100),
            "eth0",
            Ipv4Addr::new(192, 168, 0, 255),
            &AlwaysOk,
        );

        assert_eq!(dest.addr, Ipv4Addr::new(192, 168, 0, 255));
    }
}
