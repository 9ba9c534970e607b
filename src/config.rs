//! User-supplied topology configuration.

use crate::packet::Route;
use crate::queue::Queue;
use crate::{Error, Simulation};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

/// Describes the network to simulate.
///
/// The configuration decides which hops connect any two addresses, which
/// hops sit in front of and behind each host (NATs, modems), the path MTU
/// between address pairs, and how hostnames resolve.
pub trait Configuration {
    /// Called once when the simulation is created; a chance to build
    /// shared infrastructure such as backbone queues.
    fn build(&mut self, sim: &Simulation) {
        let _ = sim;
    }

    /// The hops a packet from `src` to `dst` traverses on the network,
    /// excluding the hosts' own ingress and egress chains.
    fn channel_route(&mut self, sim: &Simulation, src: IpAddr, dst: IpAddr) -> Route;

    /// The hops an incoming packet traverses before reaching the host that
    /// owns `ip` (a NAT, for instance).
    fn incoming_route(&mut self, sim: &Simulation, ip: IpAddr) -> Route;

    /// The hops an outgoing packet traverses before reaching the network
    /// (a DSL modem, for instance).
    fn outgoing_route(&mut self, sim: &Simulation, ip: IpAddr) -> Route;

    /// The path MTU between two addresses, in payload bytes per packet.
    /// Stream sockets sample this once at connect time; datagram sockets
    /// use it for every send.
    fn path_mtu(&mut self, src: IpAddr, dst: IpAddr) -> usize;

    /// Resolve a hostname on behalf of `requestor`. Returns the lookup
    /// latency to apply before completing, and either the resolved
    /// addresses or an error.
    fn hostname_lookup(
        &mut self,
        requestor: IpAddr,
        hostname: &str,
    ) -> (Duration, Result<Vec<IpAddr>, Error>);
}

/// Default MTU reported for every address pair.
const DEFAULT_MTU: usize = 1475;

/// Latency of a failing hostname lookup.
const LOOKUP_LATENCY: Duration = Duration::from_millis(100);

/// A minimal topology: every pair of hosts is connected through one shared
/// backbone queue with 50 ms of propagation delay, and each address gets a
/// modem-like ingress and egress queue (1 MB/s, 1 ms, 200 kB of buffer) on
/// demand. Hostname lookups fail with [`Error::HostNotFound`] after 100 ms.
#[derive(Default)]
pub struct DefaultConfig {
    network: Option<Rc<Queue>>,
    incoming: BTreeMap<IpAddr, Rc<Queue>>,
    outgoing: BTreeMap<IpAddr, Rc<Queue>>,
}

impl DefaultConfig {
    fn modem(sim: &Simulation, ip: IpAddr, direction: &str) -> Rc<Queue> {
        Queue::new(
            sim,
            Some(1_000_000),
            Duration::from_millis(1),
            Some(200_000),
            format!("modem {direction}\n{ip}"),
        )
    }
}

impl Configuration for DefaultConfig {
    fn build(&mut self, sim: &Simulation) {
        self.network = Some(Queue::new(
            sim,
            None,
            Duration::from_millis(50),
            None,
            "network",
        ));
    }

    fn channel_route(&mut self, sim: &Simulation, _src: IpAddr, _dst: IpAddr) -> Route {
        let network = self
            .network
            .get_or_insert_with(|| {
                Queue::new(sim, None, Duration::from_millis(50), None, "network")
            })
            .clone();
        Route::single(network)
    }

    fn incoming_route(&mut self, sim: &Simulation, ip: IpAddr) -> Route {
        let queue = self
            .incoming
            .entry(ip)
            .or_insert_with(|| Self::modem(sim, ip, "in"))
            .clone();
        Route::single(queue)
    }

    fn outgoing_route(&mut self, sim: &Simulation, ip: IpAddr) -> Route {
        let queue = self
            .outgoing
            .entry(ip)
            .or_insert_with(|| Self::modem(sim, ip, "out"))
            .clone();
        Route::single(queue)
    }

    fn path_mtu(&mut self, _src: IpAddr, _dst: IpAddr) -> usize {
        DEFAULT_MTU
    }

    fn hostname_lookup(
        &mut self,
        _requestor: IpAddr,
        _hostname: &str,
    ) -> (Duration, Result<Vec<IpAddr>, Error>) {
        (LOOKUP_LATENCY, Err(Error::HostNotFound))
    }
}
