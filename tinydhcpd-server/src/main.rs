//! Daemon binary: wires CLI parsing, configuration loading, and
//! daemonization around the `tinydhcpd` core's single-threaded
//! receive/decode/handle/encode/send loop.

mod cli;
mod config;
mod daemonize;
mod neighbor;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};

use tinydhcpd::{Engine, Frame, Interface, LeaseStore, Transport};

use crate::cli::Cli;
use crate::neighbor::RtnetlinkNeighborCache;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    #[cfg(feature = "sysv")]
    if cli.sysv && !cli.foreground {
        if daemonize::daemonize_sysv(std::path::Path::new("/run/tinydhcpd.pid"))? {
            return Ok(());
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    runtime.block_on(run(cli))
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    #[cfg(feature = "syslog")]
    if cli.syslog {
        return init_syslog(cli.debug);
    }

    let default_filter = if cli.debug { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, default_filter));
    Ok(())
}

#[cfg(feature = "syslog")]
fn init_syslog(debug: bool) -> anyhow::Result<()> {
    use log::LevelFilter;
    use syslog::{BasicLogger, Facility, Formatter3164};

    let formatter = Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "tinydhcpd".into(),
        pid: std::process::id(),
    };

    let logger = syslog::unix(formatter).map_err(|e| anyhow::anyhow!("failed to open syslog socket: {e}"))?;
    log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
        .map_err(|e| anyhow::anyhow!("failed to install syslog logger: {e}"))?;
    log::set_max_level(if debug { LevelFilter::Debug } else { LevelFilter::Info });

    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = config::load(&cli.configfile)
        .with_context(|| format!("failed to load configuration from {}", cli.configfile.display()))?;

    let listen_address = cli.address.or(loaded.listen_address).unwrap_or(Ipv4Addr::UNSPECIFIED);
    let interface = cli.interface.or(loaded.interface).context("no interface configured")?;

    let now = unix_now();
    let leases = LeaseStore::load(&loaded.lease_file, now).context("failed to load lease file")?;

    info!(
        "starting on {listen_address} (interface {interface}), pool {}-{}",
        loaded.subnet.range_start, loaded.subnet.range_end
    );

    let mut engine = Engine::new(loaded.subnet, leases);

    let transport = Transport::bind(listen_address).context("failed to bind DHCP socket")?;
    let neighbor_cache = RtnetlinkNeighborCache::new().context("failed to open rtnetlink connection")?;

    let iface_addr = listen_address;
    let iface_broadcast = broadcast_of(iface_addr, engine.config().netmask);

    let shutdown = install_signal_flag()?;

    #[cfg(feature = "systemd")]
    if cli.systemd {
        daemonize::notify_systemd_ready().context("failed to notify systemd")?;
    }

    let result = serve(&mut engine, transport, &neighbor_cache, &interface, iface_addr, iface_broadcast, &shutdown).await;

    info!("flushing lease file and shutting down");
    LeaseStore::flush(&loaded.lease_file, engine.leases()).context("failed to flush lease file on shutdown")?;

    result
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    engine: &mut Engine,
    mut transport: Transport,
    neighbor_cache: &RtnetlinkNeighborCache,
    interface_name: &str,
    interface_addr: Ipv4Addr,
    interface_broadcast: Ipv4Addr,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    while !shutdown.load(Ordering::Relaxed) {
        let (socket, queue) = transport.split_mut();
        let has_pending_sends = !queue.is_empty();

        tokio::select! {
            recv = Transport::recv_on(socket) => {
                let datagram = recv.context("receive failed")?;

                let frame = match Frame::decode(&datagram.bytes) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!("dropping unparseable datagram from {}: {e}", datagram.peer);
                        continue;
                    }
                };

                let now = unix_now();
                let iface = Interface {
                    address: interface_addr,
                    broadcast: interface_broadcast,
                    name: interface_name,
                };

                if let Some(outbound) = engine.handle(&frame, iface, now, neighbor_cache) {
                    let dest = SocketAddrV4::new(outbound.destination.addr, outbound.destination.port);
                    Transport::enqueue_on(queue, outbound.frame.encode(), dest);
                }
            }
            _ = Transport::drain_send_queue_on(socket, queue), if has_pending_sends => {}
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                engine.leases_mut().reclaim(unix_now());
            }
        }
    }

    Ok(())
}

fn install_signal_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));

    #[cfg(unix)]
    {
        let flag_term = flag.clone();
        tokio::spawn(async move {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            term.recv().await;
            warn!("received SIGTERM, shutting down");
            flag_term.store(true, Ordering::Relaxed);
        });

        let flag_int = flag.clone();
        tokio::spawn(async move {
            let mut int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .expect("failed to install SIGINT handler");
            int.recv().await;
            warn!("received SIGINT, shutting down");
            flag_int.store(true, Ordering::Relaxed);
        });
    }

    Ok(flag)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn broadcast_of(addr: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let host_bits = !u32::from(netmask);
    Ipv4Addr::from(u32::from(addr) | host_bits)
}
