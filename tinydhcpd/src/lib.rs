//! Core request/reply engine for a single-homed DHCPv4 server daemon.
//!
//! This crate has no socket and no clock of its own: [`transport::Transport`]
//! owns the one UDP socket a server process needs, and every time-dependent
//! operation in [`lease`] and [`policy`] takes `now` as an explicit
//! parameter so the state machine in [`engine::Engine`] stays exhaustively
//! testable. A binary crate wires a configuration file, a CLI, and a
//! runtime loop around this core; see the workspace's `tinydhcpd-server`.

pub mod config;
pub mod engine;
pub mod lease;
pub mod policy;
pub mod router;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::{ConfigError, SubnetConfig};
pub use engine::{Engine, Interface, Outbound};
pub use lease::{Binding, LeaseError, LeaseState, LeaseTable};
pub use policy::{Policy, PolicyError};
pub use router::{Destination, NeighborCache, Router, RouterError};
pub use store::{LeaseStore, StoreError};
pub use transport::{RecvDatagram, Transport, TransportError};
pub use wire::{CodecError, DhcpMessageType, Frame, HardwareAddress, OptionTag, Options};
