//! `rtnetlink`-backed implementation of [`tinydhcpd::NeighborCache`].
//!
//! `rtnetlink`'s API is async, but the trait it backs is a synchronous call
//! made from the single-threaded request handling path that also drives
//! the server's own tokio runtime. Calling `Runtime::block_on` on a second
//! runtime from inside that path would trip tokio's reentrancy check (it's
//! a thread-local guard, not a per-runtime one), so the netlink connection
//! and its runtime instead live on a dedicated OS thread: `set_entry` hands
//! a request across a channel and blocks on the reply, which is an
//! ordinary `mpsc::Receiver::recv` and never touches tokio at all on the
//! caller's side.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::mpsc;

use futures_util::TryStreamExt as _;
use tinydhcpd::{HardwareAddress, NeighborCache, RouterError};

struct Request {
    iface: String,
    ip: Ipv4Addr,
    hw_bytes: Vec<u8>,
    reply: mpsc::Sender<Result<(), RouterError>>,
}

pub struct RtnetlinkNeighborCache {
    requests: mpsc::Sender<Request>,
}

impl RtnetlinkNeighborCache {
    pub fn new() -> Result<Self, RouterError> {
        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        std::thread::Builder::new()
            .name("tinydhcpd-rtnetlink".into())
            .spawn(move || worker(request_rx, ready_tx))
            .map_err(|e| RouterError::ArpInjectFailed(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| RouterError::ArpInjectFailed("rtnetlink worker thread exited before starting".into()))?
            .map_err(RouterError::ArpInjectFailed)?;

        Ok(Self { requests: request_tx })
    }
}

fn worker(requests: mpsc::Receiver<Request>, ready: mpsc::Sender<Result<(), String>>) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    let (connection, handle, _) = match rtnetlink::new_connection() {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    rt.spawn(connection);

    if ready.send(Ok(())).is_err() {
        return;
    }

    while let Ok(request) = requests.recv() {
        let result = rt.block_on(set_entry_async(&handle, &request.iface, request.ip, &request.hw_bytes));
        let _ = request.reply.send(result);
    }
}

async fn set_entry_async(
    handle: &rtnetlink::Handle,
    iface: &str,
    ip: Ipv4Addr,
    hw_bytes: &[u8],
) -> Result<(), RouterError> {
    let link = handle
        .link()
        .get()
        .match_name(iface.to_string())
        .execute()
        .try_next()
        .await
        .map_err(|e| RouterError::ArpInjectFailed(e.to_string()))?
        .ok_or_else(|| RouterError::ArpInjectFailed(format!("no such interface: {iface}")))?;

    handle
        .neighbours()
        .add(link.header.index, IpAddr::V4(ip))
        .link_local_address(hw_bytes)
        .execute()
        .await
        .map_err(|e| RouterError::ArpInjectFailed(e.to_string()))
}

impl NeighborCache for RtnetlinkNeighborCache {
    fn set_entry(&self, iface: &str, ip: Ipv4Addr, hw: &HardwareAddress) -> Result<(), RouterError> {
        let (reply_tx, reply_rx) = mpsc::channel();

        self.requests
            .send(Request {
                iface: iface.to_string(),
                ip,
                hw_bytes: hw.as_bytes().to_vec(),
                reply: reply_tx,
            })
            .map_err(|_| RouterError::ArpInjectFailed("rtnetlink worker thread is gone".into()))?;

        reply_rx
            .recv()
            .map_err(|_| RouterError::ArpInjectFailed("rtnetlink worker thread dropped the reply channel".into()))?
    }
}
