//! DHCP message-type state machine. Composes decoded frames, the lease
//! table, Policy and Router into replies, without touching a socket itself
//! -- [`crate::transport::Transport`] is the only component that knows
//! about sockets.

use std::net::Ipv4Addr;

use crate::config::SubnetConfig;
use crate::lease::LeaseTable;
use crate::policy::{Policy, RequestOutcome};
use crate::router::{Destination, NeighborCache, Router};
use crate::wire::{DhcpMessageType, Frame, HardwareAddress, OptionTag};

/// The receiving interface's address and name, attached to every inbound
/// datagram by Transport so `ServerIdentifier` and Router's interface
/// lookup stay consistent.
#[derive(Clone, Copy, Debug)]
pub struct Interface<'a> {
    pub address: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub name: &'a str,
}

/// What the Engine wants the Transport to do with a reply, if anything.
pub struct Outbound {
    pub frame: Frame,
    pub destination: Destination,
}

pub struct Engine {
    config: SubnetConfig,
    leases: LeaseTable,
}

impl Engine {
    pub fn new(config: SubnetConfig, leases: LeaseTable) -> Self {
        Self { config, leases }
    }

    pub fn config(&self) -> &SubnetConfig {
        &self.config
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn leases_mut(&mut self) -> &mut LeaseTable {
        &mut self.leases
    }

    /// Handles one decoded request frame, returning the reply frame and its
    /// destination, if the message type warrants a reply. `op != 1` (not a
    /// BOOTREQUEST) is silently ignored.
    pub fn handle(
        &mut self,
        request: &Frame,
        iface: Interface<'_>,
        now: u64,
        neighbor_cache: &dyn NeighborCache,
    ) -> Option<Outbound> {
        if request.op != Frame::OP_REQUEST {
            return None;
        }

        let hw = request.hardware_address();
        let hint = request.options.requested_ip();

        match request.options.message_type() {
            Some(DhcpMessageType::Discover) => {
                self.handle_discover(request, hw, hint, iface, now, neighbor_cache)
            }
            Some(DhcpMessageType::Request) => {
                self.handle_request(request, hw, hint, iface, now, neighbor_cache)
            }
            Some(DhcpMessageType::Release) => {
                Policy::new(&self.config).release(&mut self.leases, &hw);
                None
            }
            Some(DhcpMessageType::Decline) => {
                if let Some(ip) = hint {
                    Policy::new(&self.config).decline(&mut self.leases, &hw, ip);
                }
                None
            }
            Some(DhcpMessageType::Inform) => {
                Some(self.handle_inform(request, iface, neighbor_cache))
            }
            Some(other) => {
                log_warn_unhandled(other);
                None
            }
            None => None,
        }
    }

    fn handle_discover(
        &mut self,
        request: &Frame,
        hw: HardwareAddress,
        hint: Option<Ipv4Addr>,
        iface: Interface<'_>,
        now: u64,
        neighbor_cache: &dyn NeighborCache,
    ) -> Option<Outbound> {
        let policy = Policy::new(&self.config);
        let allocation = match policy.select_discover(&mut self.leases, hw, request.ciaddr, hint, now) {
            Ok(a) => a,
            Err(e) => {
                log_error_pool_exhausted(&e, request.xid, &hw);
                return None;
            }
        };

        let mut reply = request.new_reply_skeleton();
        reply.yiaddr = allocation.ip;
        reply.options.set_message_type(DhcpMessageType::Offer);
        reply.options.set_server_identifier(iface.address);
        reply.options.set_lease_time(allocation.ttl_secs.min(u32::MAX as u64) as u32);
        reply.options.set_subnet_mask(self.config.netmask);
        apply_requested_defaults(&self.config, request, &mut reply);

        let destination = Router::route(request, allocation.ip, iface.name, iface.broadcast, neighbor_cache);

        Some(Outbound { frame: reply, destination })
    }

    fn handle_request(
        &mut self,
        request: &Frame,
        hw: HardwareAddress,
        hint: Option<Ipv4Addr>,
        iface: Interface<'_>,
        now: u64,
        neighbor_cache: &dyn NeighborCache,
    ) -> Option<Outbound> {
        let policy = Policy::new(&self.config);
        let outcome = policy.validate_request(&mut self.leases, hw, hint, request.ciaddr, now);

        let mut reply = request.new_reply_skeleton();

        match outcome {
            RequestOutcome::Ack(allocation) => {
                reply.yiaddr = allocation.ip;
                reply.options.set_message_type(DhcpMessageType::Ack);
                reply.options.set_server_identifier(iface.address);
                reply
                    .options
                    .set_lease_time(allocation.ttl_secs.min(u32::MAX as u64) as u32);
                reply.options.set_subnet_mask(self.config.netmask);
                apply_requested_defaults(&self.config, request, &mut reply);

                let destination =
                    Router::route(request, allocation.ip, iface.name, iface.broadcast, neighbor_cache);
                Some(Outbound { frame: reply, destination })
            }
            RequestOutcome::Nak => {
                reply.yiaddr = Ipv4Addr::UNSPECIFIED;
                reply.ciaddr = Ipv4Addr::UNSPECIFIED;
                reply.options.set_message_type(DhcpMessageType::Nak);
                reply.options.set_server_identifier(iface.address);

                let destination =
                    Router::route(request, Ipv4Addr::UNSPECIFIED, iface.name, iface.broadcast, neighbor_cache);
                Some(Outbound { frame: reply, destination })
            }
        }
    }

    fn handle_inform(&self, request: &Frame, iface: Interface<'_>, neighbor_cache: &dyn NeighborCache) -> Outbound {
        let mut reply = request.new_reply_skeleton();
        reply.yiaddr = Ipv4Addr::UNSPECIFIED;
        reply.options.set_message_type(DhcpMessageType::Ack);
        reply.options.set_server_identifier(iface.address);
        apply_requested_defaults(&self.config, request, &mut reply);

        let destination = Router::route(request, request.ciaddr, iface.name, iface.broadcast, neighbor_cache);
        Outbound { frame: reply, destination }
    }
}

/// `ParameterRequestList` handling: walk the list in order, appending any
/// tag with a configured default that isn't already present.
fn apply_requested_defaults(config: &SubnetConfig, request: &Frame, reply: &mut Frame) {
    let Some(requested_tags) = request.options.parameter_request_list() else {
        return;
    };

    for &tag in requested_tags {
        if tag == OptionTag::SubnetMask.code() {
            continue; // already always populated
        }

        if reply.options.contains(tag) {
            continue;
        }

        if let Some(value) = config.defaults.get(&tag) {
            reply.options.set(tag, value.clone());
        }
    }
}

#[cfg(feature = "log")]
fn log_error_pool_exhausted(e: &crate::policy::PolicyError, xid: u32, hw: &HardwareAddress) {
    log::error!("{e} (xid={xid:#010x}, hw={hw})");
}

#[cfg(not(feature = "log"))]
fn log_error_pool_exhausted(_e: &crate::policy::PolicyError, _xid: u32, _hw: &HardwareAddress) {}

#[cfg(feature = "log")]
fn log_warn_unhandled(mt: DhcpMessageType) {
    log::warn!("dropping unhandled message type {mt}");
}

#[cfg(not(feature = "log"))]
fn log_warn_unhandled(_mt: DhcpMessageType) {}
