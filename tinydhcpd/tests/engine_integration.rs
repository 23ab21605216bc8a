//! Drives the Engine through real encoded/decoded wire bytes rather than
//! hand-built `Frame` values, covering the DISCOVER/OFFER/REQUEST/ACK,
//! NAK, DECLINE and RELEASE scenarios end to end across the codec
//! boundary.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tinydhcpd::{
    DhcpMessageType, Engine, Frame, HardwareAddress, Interface, LeaseState, LeaseTable,
    NeighborCache, Options, RouterError, SubnetConfig,
};

struct AlwaysOk;

impl NeighborCache for AlwaysOk {
    fn set_entry(&self, _iface: &str, _ip: Ipv4Addr, _hw: &HardwareAddress) -> Result<(), RouterError> {
        Ok(())
    }
}

fn subnet() -> SubnetConfig {
    SubnetConfig::new(
        Ipv4Addr::new(192, 168, 1, 0),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::new(192, 168, 1, 50),
        Ipv4Addr::new(192, 168, 1, 60),
        7200,
        HashMap::new(),
        HashMap::new(),
    )
    .unwrap()
}

fn server_iface() -> Interface<'static> {
    Interface {
        address: Ipv4Addr::new(192, 168, 1, 1),
        broadcast: Ipv4Addr::new(192, 168, 1, 255),
        name: "eth0",
    }
}

fn client_discover(xid: u32, mac: [u8; 6]) -> Frame {
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&mac);

    let mut options = Options::new();
    options.set_message_type(DhcpMessageType::Discover);

    Frame {
        op: Frame::OP_REQUEST,
        htype: 1,
        hlen: 6,
        hops: 0,
        xid,
        secs: 0,
        flags: 0x8000,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: Ipv4Addr::UNSPECIFIED,
        chaddr,
        options,
    }
}

/// Round-trips `frame` through `encode`/`decode`, the way a real datagram
/// would cross the wire between client and server.
fn roundtrip(frame: &Frame) -> Frame {
    Frame::decode(&frame.encode()).expect("re-decoding our own encoded frame must succeed")
}

#[test]
fn discover_request_ack_over_the_wire() {
    let mut engine = Engine::new(subnet(), LeaseTable::new());
    let mac = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

    let discover = roundtrip(&client_discover(1, mac));
    let offer = engine
        .handle(&discover, server_iface(), 1_000, &AlwaysOk)
        .expect("discover should produce an offer");

    assert_eq!(offer.frame.options.message_type(), Some(DhcpMessageType::Offer));
    let offered_ip = offer.frame.yiaddr;
    assert!(subnet().in_range(offered_ip));

    let offer_on_wire = roundtrip(&offer.frame);
    assert_eq!(offer_on_wire.yiaddr, offered_ip);

    let mut request = client_discover(2, mac);
    request.options.set_message_type(DhcpMessageType::Request);
    request.options.set_requested_ip(offered_ip);
    let request = roundtrip(&request);

    let ack = engine
        .handle(&request, server_iface(), 1_001, &AlwaysOk)
        .expect("matching request should be acked");

    assert_eq!(ack.frame.options.message_type(), Some(DhcpMessageType::Ack));
    assert_eq!(ack.frame.yiaddr, offered_ip);
    assert_eq!(ack.frame.options.lease_time(), Some(7200));
    assert_eq!(ack.frame.options.subnet_mask(), Some(Ipv4Addr::new(255, 255, 255, 0)));

    let hw = HardwareAddress::new(1, &mac);
    let binding = engine.leases_mut().get(&hw, 1_001).unwrap();
    assert_eq!(binding.state, LeaseState::Bound);
}

#[test]
fn request_for_someone_elses_active_lease_is_nak_over_the_wire() {
    let mut engine = Engine::new(subnet(), LeaseTable::new());
    let mac_a = [0xaa; 6];
    let mac_b = [0xbb; 6];

    let offer_a = engine
        .handle(&roundtrip(&client_discover(1, mac_a)), server_iface(), 0, &AlwaysOk)
        .unwrap();
    let mut accept_a = client_discover(2, mac_a);
    accept_a.options.set_message_type(DhcpMessageType::Request);
    accept_a.options.set_requested_ip(offer_a.frame.yiaddr);
    engine.handle(&roundtrip(&accept_a), server_iface(), 1, &AlwaysOk).unwrap();

    let mut steal = client_discover(3, mac_b);
    steal.options.set_message_type(DhcpMessageType::Request);
    steal.options.set_requested_ip(offer_a.frame.yiaddr);

    let nak = engine
        .handle(&roundtrip(&steal), server_iface(), 2, &AlwaysOk)
        .expect("mismatched request should nak");

    assert_eq!(nak.frame.options.message_type(), Some(DhcpMessageType::Nak));
    assert_eq!(nak.frame.yiaddr, Ipv4Addr::UNSPECIFIED);
}

#[test]
fn decline_then_release_cycle_over_the_wire() {
    let mut engine = Engine::new(subnet(), LeaseTable::new());
    let mac = [0x10; 6];

    let offer = engine
        .handle(&roundtrip(&client_discover(1, mac)), server_iface(), 0, &AlwaysOk)
        .unwrap();
    let offered_ip = offer.frame.yiaddr;

    let mut decline = client_discover(2, mac);
    decline.options.set_message_type(DhcpMessageType::Decline);
    decline.options.set_requested_ip(offered_ip);
    assert!(engine.handle(&roundtrip(&decline), server_iface(), 1, &AlwaysOk).is_none());

    let other_mac = [0x20; 6];
    let second_offer = engine
        .handle(&roundtrip(&client_discover(3, other_mac)), server_iface(), 2, &AlwaysOk)
        .unwrap();
    assert_ne!(second_offer.frame.yiaddr, offered_ip);
}

#[test]
fn inform_replies_with_ack_and_no_lease() {
    let mut engine = Engine::new(subnet(), LeaseTable::new());
    let mut inform = client_discover(1, [0x33; 6]);
    inform.options.set_message_type(DhcpMessageType::Inform);
    inform.ciaddr = Ipv4Addr::new(192, 168, 1, 42);

    let reply = engine
        .handle(&roundtrip(&inform), server_iface(), 0, &AlwaysOk)
        .expect("inform should be acked");

    assert_eq!(reply.frame.options.message_type(), Some(DhcpMessageType::Ack));
    assert_eq!(reply.frame.options.lease_time(), None);
    assert_eq!(reply.frame.yiaddr, Ipv4Addr::UNSPECIFIED);
}

#[test]
fn pool_exhaustion_yields_no_reply() {
    let narrow = SubnetConfig::new(
        Ipv4Addr::new(192, 168, 2, 0),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::new(192, 168, 2, 10),
        Ipv4Addr::new(192, 168, 2, 10),
        3600,
        HashMap::new(),
        HashMap::new(),
    )
    .unwrap();
    let mut engine = Engine::new(narrow, LeaseTable::new());

    let first = engine
        .handle(&roundtrip(&client_discover(1, [0x01; 6])), server_iface(), 0, &AlwaysOk)
        .expect("the sole address should be offered once");
    assert_eq!(first.frame.yiaddr, Ipv4Addr::new(192, 168, 2, 10));

    let second = engine.handle(&roundtrip(&client_discover(2, [0x02; 6])), server_iface(), 0, &AlwaysOk);
    assert!(second.is_none(), "an exhausted pool must not produce an offer");
}
