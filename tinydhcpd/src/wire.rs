//! Wire codec: bit-exact encoding and decoding of the DHCP header and its
//! options list (RFC 2131 / RFC 2132).
//!
//! This module has no I/O, no clock and no allocation beyond the buffers and
//! maps it returns, mirroring the `Packet`/`Options`/`DhcpOption` split in
//! the upstream `edge_dhcp` crate this module is descended from, but with
//! owned, heap-backed storage instead of buffer-borrowed slices: the server
//! keeps decoded frames around across the Engine/Policy/Router boundary, so
//! borrowing from the recv buffer the way the embedded client/server pair
//! does is not an option here.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Fixed-header offsets, per RFC 2131 figure 1.
const OP: usize = 0;
const HTYPE: usize = 1;
const HLEN: usize = 2;
const HOPS: usize = 3;
const XID: usize = 4;
const SECS: usize = 8;
const FLAGS: usize = 10;
const CIADDR: usize = 12;
const YIADDR: usize = 16;
const SIADDR: usize = 20;
const GIADDR: usize = 24;
const CHADDR: usize = 28;
const SNAME: usize = 44;
const FILE: usize = 108;
const MAGIC: usize = 236;
const OPTIONS: usize = 240;

const FIXED_HEADER_LEN: usize = 240;
const MIN_REPLY_LEN: usize = 300;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const BOOT_REQUEST: u8 = 1;
const BOOT_REPLY: u8 = 2;

const BROADCAST_FLAG: u16 = 0x8000;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("buffer shorter than the minimum DHCP frame size")]
    Truncated,
    #[error("magic cookie missing or incorrect")]
    NotDhcp,
    #[error("option {tag} has an invalid length {len}")]
    InvalidOption { tag: u8, len: usize },
}

/// IANA hardware type; 1 is Ethernet, the only type this server expects to
/// see in practice, but the field is carried opaquely either way.
pub type HardwareType = u8;
pub const HTYPE_ETHERNET: HardwareType = 1;

/// An opaque hardware (link-layer) address: up to 16 bytes, with an explicit
/// length and hardware-type tag.
///
/// Equality, hashing and ordering all operate on the `length`-prefixed
/// bytes, i.e. trailing bytes beyond `len` never participate. Ordering
/// compares byte by byte and returns at the first inequality -- the
/// original C++ `ether_addr::operator<` used for the lease map's key
/// comparison did not do this (it returned `true` on the very first
/// less-than comparison of the first byte pair, regardless of whether the
/// bytes were actually unequal), which silently broke the map's ordering
/// invariant. This is a known defect in the source and is not reproduced
/// here.
#[derive(Clone, Copy)]
pub struct HardwareAddress {
    htype: HardwareType,
    len: u8,
    bytes: [u8; 16],
}

impl HardwareAddress {
    pub const ZERO: HardwareAddress = HardwareAddress {
        htype: HTYPE_ETHERNET,
        len: 6,
        bytes: [0; 16],
    };

    pub fn new(htype: HardwareType, addr: &[u8]) -> Self {
        let len = addr.len().min(16) as u8;
        let mut bytes = [0u8; 16];
        bytes[..len as usize].copy_from_slice(&addr[..len as usize]);

        Self { htype, len, bytes }
    }

    pub fn from_chaddr(htype: HardwareType, hlen: u8, chaddr: &[u8; 16]) -> Self {
        let len = hlen.min(16);
        Self {
            htype,
            len,
            bytes: *chaddr,
        }
    }

    pub fn htype(&self) -> HardwareType {
        self.htype
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// A 16-byte `chaddr` field suitable for writing into a wire frame.
    pub fn to_chaddr(&self) -> [u8; 16] {
        self.bytes
    }

    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }
}

impl PartialEq for HardwareAddress {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for HardwareAddress {}

impl std::hash::Hash for HardwareAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl PartialOrd for HardwareAddress {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HardwareAddress {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl fmt::Debug for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HardwareAddress({self})")
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.as_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid hardware address {0:?}")]
pub struct ParseHardwareAddressError(String);

impl FromStr for HardwareAddress {
    type Err = ParseHardwareAddressError;

    /// Accepts colon-separated hex octets, tolerating a trailing separator
    /// the way the original lease-file writer produced (see spec §9).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches(':');
        let mut bytes = [0u8; 16];
        let mut len = 0usize;

        for part in trimmed.split(':') {
            if len >= 16 {
                return Err(ParseHardwareAddressError(s.to_string()));
            }
            bytes[len] =
                u8::from_str_radix(part, 16).map_err(|_| ParseHardwareAddressError(s.to_string()))?;
            len += 1;
        }

        if len == 0 {
            return Err(ParseHardwareAddressError(s.to_string()));
        }

        Ok(Self {
            htype: HTYPE_ETHERNET,
            len: len as u8,
            bytes,
        })
    }
}

/// The RFC 2132 option code space, as a first-class enum for the tags this
/// server understands. Unknown tags are preserved as opaque `u8` values in
/// [`Options`] rather than being forced through this enum.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OptionTag {
    Pad = 0,
    SubnetMask = 1,
    TimeOffset = 2,
    Routers = 3,
    TimeServer = 4,
    NameServer = 5,
    DnsServer = 6,
    LogServer = 7,
    HostName = 12,
    DomainName = 15,
    IfaceMtu = 26,
    BroadcastAddr = 28,
    StaticRoutes = 33,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    Overload = 52,
    DhcpMessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    Message = 56,
    RenewTime = 58,
    RebindingTime = 59,
    End = 255,
}

impl OptionTag {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Known tags whose value length is fixed (or a multiple of a fixed
    /// unit, for address lists); used by the decoder to reject malformed
    /// options per spec §4.1.
    fn expected_len(self) -> Option<ExpectedLen> {
        use ExpectedLen::*;
        use OptionTag::*;

        match self {
            SubnetMask | BroadcastAddr | ServerIdentifier | RequestedIpAddress => Some(Exact(4)),
            LeaseTime | RenewTime | RebindingTime => Some(Exact(4)),
            TimeOffset => Some(Exact(4)),
            IfaceMtu => Some(Exact(2)),
            DhcpMessageType | Overload => Some(Exact(1)),
            Routers | DnsServer | TimeServer | NameServer | LogServer | StaticRoutes => {
                Some(MultipleOf(4))
            }
            Pad | End | HostName | DomainName | ParameterRequestList | Message => None,
        }
    }
}

#[derive(Copy, Clone)]
enum ExpectedLen {
    Exact(usize),
    MultipleOf(usize),
}

impl ExpectedLen {
    fn matches(self, len: usize) -> bool {
        match self {
            ExpectedLen::Exact(n) => len == n,
            ExpectedLen::MultipleOf(n) => len > 0 && len % n == 0,
        }
    }
}

/// The value of option 53.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl fmt::Display for DhcpMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An ordered, tag-unique map from option code to value bytes.
///
/// Order of first insertion is preserved across `set`, which matters for
/// the encoder: it walks the options in insertion order, so callers that
/// want `DhcpMessageType` first and rely on natural iteration order for
/// everything else get that behavior for free as long as they set the
/// message type option first (the Engine always does).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options(Vec<(u8, Vec<u8>)>);

impl Options {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.0.iter().any(|(t, _)| *t == tag)
    }

    /// Inserts or replaces the value for `tag`, preserving the tag's
    /// existing position on replace.
    pub fn set(&mut self, tag: u8, value: Vec<u8>) {
        if let Some(entry) = self.0.iter_mut().find(|(t, _)| *t == tag) {
            entry.1 = value;
        } else {
            self.0.push((tag, value));
        }
    }

    pub fn remove(&mut self, tag: u8) {
        self.0.retain(|(t, _)| *t != tag);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.0.iter().map(|(t, v)| (*t, v.as_slice()))
    }

    fn append_concat(&mut self, tag: u8, mut value: Vec<u8>) {
        if let Some(entry) = self.0.iter_mut().find(|(t, _)| *t == tag) {
            entry.1.append(&mut value);
        } else {
            self.0.push((tag, value));
        }
    }

    // --- typed convenience accessors -------------------------------------

    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.get(OptionTag::DhcpMessageType.code())
            .and_then(|v| v.first().copied())
            .and_then(|b| DhcpMessageType::try_from_primitive(b).ok())
    }

    pub fn set_message_type(&mut self, mt: DhcpMessageType) {
        self.set(OptionTag::DhcpMessageType.code(), vec![mt as u8]);
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        get_ipv4(self, OptionTag::RequestedIpAddress.code())
    }

    pub fn set_requested_ip(&mut self, ip: Ipv4Addr) {
        self.set(OptionTag::RequestedIpAddress.code(), ip.octets().to_vec());
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        get_ipv4(self, OptionTag::ServerIdentifier.code())
    }

    pub fn set_server_identifier(&mut self, ip: Ipv4Addr) {
        self.set(OptionTag::ServerIdentifier.code(), ip.octets().to_vec());
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.get(OptionTag::LeaseTime.code())
            .filter(|v| v.len() == 4)
            .map(|v| u32::from_be_bytes(v.try_into().unwrap()))
    }

    pub fn set_lease_time(&mut self, secs: u32) {
        self.set(OptionTag::LeaseTime.code(), secs.to_be_bytes().to_vec());
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        get_ipv4(self, OptionTag::SubnetMask.code())
    }

    pub fn set_subnet_mask(&mut self, mask: Ipv4Addr) {
        self.set(OptionTag::SubnetMask.code(), mask.octets().to_vec());
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.get(OptionTag::ParameterRequestList.code())
    }

    pub fn has_overload(&self) -> bool {
        self.contains(OptionTag::Overload.code())
    }
}

fn get_ipv4(options: &Options, tag: u8) -> Option<Ipv4Addr> {
    options
        .get(tag)
        .filter(|v| v.len() == 4)
        .map(|v| Ipv4Addr::new(v[0], v[1], v[2], v[3]))
}

/// A parsed (or about-to-be-encoded) DHCP message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Options,
}

impl Frame {
    pub const OP_REQUEST: u8 = BOOT_REQUEST;
    pub const OP_REPLY: u8 = BOOT_REPLY;

    pub fn broadcast_flag(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    pub fn hardware_address(&self) -> HardwareAddress {
        HardwareAddress::from_chaddr(self.htype, self.hlen, &self.chaddr)
    }

    pub fn chaddr_is_zero(&self) -> bool {
        self.chaddr.iter().all(|&b| b == 0)
    }

    /// Builds the common reply skeleton described in spec §4.6: `op=2`,
    /// `htype/hlen/xid/flags/chaddr` copied, `secs=0`, `siaddr`/`giaddr`
    /// zeroed unless the request was relayed (in which case `giaddr` is
    /// echoed back so the relay can match the reply to the request).
    pub fn new_reply_skeleton(&self) -> Frame {
        Frame {
            op: Self::OP_REPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            options: Options::new(),
        }
    }

    /// Decodes a frame from a raw UDP payload per spec §4.1.
    pub fn decode(data: &[u8]) -> Result<Frame, CodecError> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(CodecError::Truncated);
        }

        if data[MAGIC..MAGIC + 4] != MAGIC_COOKIE {
            return Err(CodecError::NotDhcp);
        }

        let op = data[OP];
        let htype = data[HTYPE];
        let hlen = data[HLEN];
        let hops = data[HOPS];
        let xid = u32::from_be_bytes(data[XID..XID + 4].try_into().unwrap());
        let secs = u16::from_be_bytes(data[SECS..SECS + 2].try_into().unwrap());
        let flags = u16::from_be_bytes(data[FLAGS..FLAGS + 2].try_into().unwrap());
        let ciaddr = ipv4_at(data, CIADDR);
        let yiaddr = ipv4_at(data, YIADDR);
        let siaddr = ipv4_at(data, SIADDR);
        let giaddr = ipv4_at(data, GIADDR);

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[CHADDR..CHADDR + 16]);

        let _sname = &data[SNAME..FILE];
        let _file = &data[FILE..OPTIONS];

        let options = decode_options(&data[OPTIONS..])?;

        if options.has_overload() {
            log_debug(format_args!(
                "ignoring option 52 (overload); sname/file regions are not parsed by this core"
            ));
        }

        Ok(Frame {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            options,
        })
    }

    /// Encodes the frame per spec §4.1: 240-byte fixed header, `sname`/
    /// `file` zeroed, `DhcpMessageType` first, `End` last, padded with
    /// `Pad` bytes before `End` so the total is never smaller than 300
    /// bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_REPLY_LEN);

        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&[0u8; 64]); // sname
        buf.extend_from_slice(&[0u8; 128]); // file
        buf.extend_from_slice(&MAGIC_COOKIE);

        debug_assert_eq!(buf.len(), FIXED_HEADER_LEN);

        let mut opt_bytes = Vec::new();
        encode_options_ordered(&self.options, &mut opt_bytes);

        let unpadded_len = FIXED_HEADER_LEN + opt_bytes.len() + 1; // +1 for End
        let pad_needed = MIN_REPLY_LEN.saturating_sub(unpadded_len);

        buf.extend_from_slice(&opt_bytes);
        buf.extend(std::iter::repeat(OptionTag::Pad.code()).take(pad_needed));
        buf.push(OptionTag::End.code());

        buf
    }
}

fn ipv4_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

fn decode_options(mut data: &[u8]) -> Result<Options, CodecError> {
    let mut options = Options::new();

    while !data.is_empty() {
        let tag = data[0];

        if tag == OptionTag::Pad.code() {
            data = &data[1..];
            continue;
        }

        if tag == OptionTag::End.code() {
            break;
        }

        if data.len() < 2 {
            return Err(CodecError::Truncated);
        }

        let len = data[1] as usize;
        if data.len() < 2 + len {
            return Err(CodecError::Truncated);
        }

        let value = &data[2..2 + len];

        if let Ok(known) = OptionTag::try_from_primitive(tag) {
            if let Some(expected) = known.expected_len() {
                if !expected.matches(len) {
                    return Err(CodecError::InvalidOption { tag, len });
                }
            }
        }

        options.append_concat(tag, value.to_vec());

        data = &data[2 + len..];
    }

    Ok(options)
}

/// Encodes `options` with `DhcpMessageType` first (many clients inspect it
/// before anything else) and everything else in the map's existing order.
fn encode_options_ordered(options: &Options, out: &mut Vec<u8>) {
    let mt_code = OptionTag::DhcpMessageType.code();

    if let Some(v) = options.get(mt_code) {
        encode_one(mt_code, v, out);
    }

    for (tag, value) in options.iter() {
        if tag == mt_code || tag == OptionTag::Pad.code() || tag == OptionTag::End.code() {
            continue;
        }

        encode_one(tag, value, out);
    }
}

fn encode_one(tag: u8, value: &[u8], out: &mut Vec<u8>) {
    // RFC 3396 long options: split any value over 255 bytes into repeated
    // same-tag TLVs. Nothing this server emits is anywhere near that size
    // today, but the encoder stays correct if that changes.
    if value.is_empty() {
        out.push(tag);
        out.push(0);
        return;
    }

    for chunk in value.chunks(255) {
        out.push(tag);
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

#[cfg(feature = "log")]
fn log_debug(args: fmt::Arguments<'_>) {
    log::debug!("{args}");
}

#[cfg(not(feature = "log"))]
fn log_debug(_args: fmt::Arguments<'_>) {}
