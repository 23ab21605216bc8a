//! Turns the on-disk TOML configuration file into a
//! [`tinydhcpd::SubnetConfig`] plus the handful of daemon-level settings
//! (listen address, interface, lease file path) the core doesn't need to
//! know about.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tinydhcpd::{HardwareAddress, OptionTag, SubnetConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid hardware address {0:?} in host reservation")]
    InvalidReservationHardwareAddress(String),
    #[error("neither listen-address nor interface was provided")]
    MissingBindTarget,
    #[error(transparent)]
    Subnet(#[from] tinydhcpd::ConfigError),
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "listen-address")]
    listen_address: Option<Ipv4Addr>,
    interface: Option<String>,
    #[serde(rename = "lease-file")]
    lease_file: PathBuf,
    #[serde(rename = "lease-time")]
    lease_time: Option<u32>,
    subnet: RawSubnet,
}

#[derive(Debug, Deserialize)]
struct RawSubnet {
    #[serde(rename = "net-address")]
    net_address: Ipv4Addr,
    netmask: Ipv4Addr,
    #[serde(rename = "range-start")]
    range_start: Ipv4Addr,
    #[serde(rename = "range-end")]
    range_end: Ipv4Addr,
    #[serde(default)]
    hosts: Vec<RawHost>,
    #[serde(default)]
    options: RawOptions,
}

#[derive(Debug, Deserialize)]
struct RawHost {
    ether: String,
    #[serde(rename = "fixed-address")]
    fixed_address: Ipv4Addr,
}

#[derive(Debug, Default, Deserialize)]
struct RawOptions {
    routers: Option<Vec<Ipv4Addr>>,
    #[serde(rename = "domain-name-servers")]
    domain_name_servers: Option<Vec<Ipv4Addr>>,
    #[serde(rename = "domain-name")]
    domain_name: Option<String>,
}

pub struct ServerConfig {
    pub listen_address: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub lease_file: PathBuf,
    pub subnet: SubnetConfig,
}

pub fn load(path: &Path) -> Result<ServerConfig, ConfigLoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let raw: RawFile = toml::from_str(&text).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if raw.listen_address.is_none() && raw.interface.is_none() {
        return Err(ConfigLoadError::MissingBindTarget);
    }

    let mut reservations = HashMap::new();
    for host in &raw.subnet.hosts {
        let hw: HardwareAddress = host
            .ether
            .parse()
            .map_err(|_| ConfigLoadError::InvalidReservationHardwareAddress(host.ether.clone()))?;
        reservations.insert(hw, host.fixed_address);
    }

    let defaults = build_defaults(&raw.subnet.options);

    let subnet = SubnetConfig::new(
        raw.subnet.net_address,
        raw.subnet.netmask,
        raw.subnet.range_start,
        raw.subnet.range_end,
        raw.lease_time.unwrap_or(tinydhcpd::config::DEFAULT_LEASE_SECONDS),
        reservations,
        defaults,
    )?;

    Ok(ServerConfig {
        listen_address: raw.listen_address,
        interface: raw.interface,
        lease_file: raw.lease_file,
        subnet,
    })
}

fn build_defaults(options: &RawOptions) -> HashMap<u8, Vec<u8>> {
    let mut defaults = HashMap::new();

    if let Some(routers) = &options.routers {
        defaults.insert(OptionTag::Routers.code(), ipv4_list_bytes(routers));
    }

    if let Some(dns) = &options.domain_name_servers {
        defaults.insert(OptionTag::DnsServer.code(), ipv4_list_bytes(dns));
    }

    if let Some(name) = &options.domain_name {
        defaults.insert(OptionTag::DomainName.code(), name.as_bytes().to_vec());
    }

    defaults
}

fn ipv4_list_bytes(addrs: &[Ipv4Addr]) -> Vec<u8> {
    addrs.iter().flat_map(|a| a.octets()).collect()
}
