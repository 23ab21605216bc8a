//! Command-line surface.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tinydhcpd/tinydhcpd.conf";

#[derive(Parser, Debug)]
#[command(name = "tinydhcpd", version, about = "A small DHCPv4 server daemon")]
pub struct Cli {
    /// Listen address (overrides the configuration file).
    #[arg(short = 'a', long = "address")]
    pub address: Option<Ipv4Addr>,

    /// Bind to this interface (overrides the configuration file).
    #[arg(short = 'i', long = "interface")]
    pub interface: Option<String>,

    /// Configuration file path.
    #[arg(short = 'c', long = "configfile", default_value = DEFAULT_CONFIG_PATH)]
    pub configfile: PathBuf,

    /// Do not detach from the controlling terminal.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Verbose logging.
    #[arg(short = 'v', long = "debug")]
    pub debug: bool,

    /// Daemonize using the traditional fork/setsid/pidfile style.
    #[cfg(feature = "sysv")]
    #[arg(long = "sysv")]
    pub sysv: bool,

    /// Daemonize by notifying systemd's service manager instead of forking.
    #[cfg(feature = "systemd")]
    #[arg(long = "systemd")]
    pub systemd: bool,

    /// Log to syslog instead of stderr.
    #[cfg(feature = "syslog")]
    #[arg(long = "syslog")]
    pub syslog: bool,
}
