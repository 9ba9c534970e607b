//! A deterministic network simulator with virtual time.
//!
//! This crate lets unmodified callback-style network code run against an
//! emulated network of hosts, links and routers. Real I/O is replaced by a
//! simulated runtime: virtual time advances only when no work remains, and
//! packets traverse a user-defined topology of queues, NATs and modems with
//! configurable bandwidth, latency, MTU and loss.
//!
//! The simulation is single-threaded and fully deterministic: for a given
//! configuration and deterministic user code, two runs produce identical
//! sequences of (virtual-time, event) pairs. Timers with equal expiry fire
//! in insertion order, packets on a route stay in order, and completions are
//! always delivered through the dispatch queue rather than inline.
//!
//! # Example
//!
//! ```no_run
//! use simnet::{DefaultConfig, Host, Simulation, TcpAcceptor, TcpSocket};
//!
//! let sim = Simulation::new(DefaultConfig::default());
//! let server = Host::new(&sim, ["40.30.20.10".parse().unwrap()]);
//! let client = Host::new(&sim, ["10.20.30.40".parse().unwrap()]);
//!
//! let listener = TcpAcceptor::new(&server);
//! listener.open(simnet::Family::V4).unwrap();
//! listener.bind("0.0.0.0:1337".parse().unwrap()).unwrap();
//! listener.listen(10).unwrap();
//!
//! let accepted = TcpSocket::new(&server);
//! listener.async_accept(&accepted, |peer| {
//!     println!("incoming connection from {:?}", peer);
//! });
//!
//! let outgoing = TcpSocket::new(&client);
//! outgoing.async_connect("40.30.20.10:1337".parse().unwrap(), |result| {
//!     result.expect("connect");
//! });
//!
//! sim.run();
//! ```

mod config;
mod graph;
mod host;
mod packet;
mod queue;
mod resolver;
mod sim;
mod tcp;
mod udp;

pub use config::{Configuration, DefaultConfig};
pub use graph::dump_network_graph;
pub use host::Host;
pub use packet::{forward_packet, Packet, PacketKind, Route, Sink, SinkForwarder};
pub use queue::{Nat, Queue};
pub use resolver::{Query, ResolveEntry, Resolver};
pub use sim::{Simulation, Timer};
pub use tcp::{Channel, TcpAcceptor, TcpSocket};
pub use udp::UdpSocket;

use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced at the socket and resolver boundary.
///
/// Errors are values: synchronous calls return them directly, asynchronous
/// operations deliver them through their completion handler, and transport
/// conditions travel in-band as [`PacketKind::Error`] packets.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The socket is not open.
    #[error("bad descriptor")]
    BadDescriptor,
    /// The socket is not connected to a peer.
    #[error("not connected")]
    NotConnected,
    /// The address family does not match the socket's.
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    /// The address is not assigned to this host, or the endpoint is taken.
    #[error("address not available")]
    AddressNotAvailable,
    /// A synchronous non-blocking operation found no data ready.
    #[error("operation would block")]
    WouldBlock,
    /// The operation was cancelled by `cancel()` or `close()`.
    #[error("operation aborted")]
    OperationAborted,
    /// The peer closed the connection.
    #[error("end of file")]
    Eof,
    /// The hostname could not be resolved.
    #[error("host not found")]
    HostNotFound,
    /// The remote endpoint is not accepting connections.
    #[error("connection refused")]
    ConnectionRefused,
}

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// The family of the given endpoint.
    pub fn of(endpoint: &SocketAddr) -> Self {
        if endpoint.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        }
    }

    pub(crate) fn is_v4(self) -> bool {
        matches!(self, Family::V4)
    }
}
