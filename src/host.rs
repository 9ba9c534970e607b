//! Host contexts: the identity and routing environment of a node.

use crate::packet::Route;
use crate::sim::Core;
use crate::{Error, Simulation};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

pub(crate) struct HostInner {
    pub(crate) core: Rc<Core>,
    pub(crate) ips: Vec<IpAddr>,
    incoming: BTreeMap<IpAddr, Route>,
    outgoing: BTreeMap<IpAddr, Route>,
}

impl HostInner {
    /// The configured hops a packet destined for `ip` traverses before
    /// reaching this host (the socket's forwarder is appended per use).
    pub(crate) fn incoming_route(&self, ip: IpAddr) -> Route {
        self.incoming.get(&ip).cloned().unwrap_or_default()
    }

    /// The configured hops a packet from `ip` traverses on its way out.
    pub(crate) fn outgoing_route(&self, ip: IpAddr) -> Route {
        self.outgoing.get(&ip).cloned().unwrap_or_default()
    }

    /// Resolve a bind request against the host's address set: the
    /// unspecified address picks the first owned address of the matching
    /// family, anything else must be owned by this host.
    pub(crate) fn resolve_bind_addr(&self, ep: SocketAddr) -> Result<SocketAddr, Error> {
        if ep.ip().is_unspecified() {
            let want_v4 = ep.is_ipv4();
            let ip = self
                .ips
                .iter()
                .copied()
                .find(|ip| ip.is_ipv4() == want_v4)
                .ok_or(Error::AddressNotAvailable)?;
            Ok(SocketAddr::new(ip, ep.port()))
        } else if self.ips.contains(&ep.ip()) {
            Ok(ep)
        } else {
            Err(Error::AddressNotAvailable)
        }
    }

    /// Path MTU between a local address and a destination.
    pub(crate) fn path_mtu(&self, src: IpAddr, dst: IpAddr) -> usize {
        debug_assert!(
            self.ips.contains(&src),
            "path MTU source must be local to this host"
        );
        self.core.config.borrow_mut().path_mtu(src, dst)
    }

    pub(crate) fn simulation(&self) -> Simulation {
        Simulation {
            core: self.core.clone(),
        }
    }
}

/// The identity of a node in the simulated network: a set of addresses and
/// the ingress/egress routes connecting them to the topology.
///
/// Hosts own nothing but identity; sockets borrow a host when created and
/// use its routes to reach the network. A host without addresses is a valid
/// internal context, usable for timers only.
#[derive(Clone)]
pub struct Host {
    pub(crate) inner: Rc<HostInner>,
}

impl Host {
    /// Register a node with the given addresses. Ingress and egress routes
    /// are obtained from the simulation's configuration once, up front.
    pub fn new(sim: &Simulation, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let ips: Vec<IpAddr> = ips.into_iter().collect();
        let mut incoming = BTreeMap::new();
        let mut outgoing = BTreeMap::new();
        for ip in &ips {
            let route = sim.core.config.borrow_mut().incoming_route(sim, *ip);
            incoming.insert(*ip, route);
            let route = sim.core.config.borrow_mut().outgoing_route(sim, *ip);
            outgoing.insert(*ip, route);
        }
        let inner = Rc::new(HostInner {
            core: sim.core.clone(),
            ips,
            incoming,
            outgoing,
        });
        sim.core.hosts.borrow_mut().push(Rc::downgrade(&inner));
        Self { inner }
    }

    /// The addresses assigned to this host.
    pub fn addrs(&self) -> &[IpAddr] {
        &self.inner.ips
    }

    /// A handle to the simulation this host belongs to.
    pub fn simulation(&self) -> Simulation {
        self.inner.simulation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultConfig;

    #[test]
    fn bind_resolution() {
        let sim = Simulation::new(DefaultConfig::default());
        let host = Host::new(&sim, ["10.0.0.1".parse().unwrap()]);

        // Unspecified v4 resolves to the host's address.
        let resolved = host
            .inner
            .resolve_bind_addr("0.0.0.0:80".parse().unwrap())
            .unwrap();
        assert_eq!(resolved, "10.0.0.1:80".parse().unwrap());

        // An owned address passes through.
        let resolved = host
            .inner
            .resolve_bind_addr("10.0.0.1:80".parse().unwrap())
            .unwrap();
        assert_eq!(resolved, "10.0.0.1:80".parse().unwrap());

        // Foreign addresses are rejected.
        assert_eq!(
            host.inner.resolve_bind_addr("10.0.0.2:80".parse().unwrap()),
            Err(Error::AddressNotAvailable)
        );

        // No v6 address is assigned.
        assert_eq!(
            host.inner.resolve_bind_addr("[::]:80".parse().unwrap()),
            Err(Error::AddressNotAvailable)
        );
    }

    #[test]
    fn routes_are_cached_per_address() {
        let sim = Simulation::new(DefaultConfig::default());
        let host = Host::new(&sim, ["10.0.0.1".parse().unwrap()]);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(host.inner.incoming_route(ip).len(), 1);
        assert_eq!(host.inner.outgoing_route(ip).len(), 1);
        // Unknown addresses yield the empty route.
        assert!(host.inner.incoming_route("9.9.9.9".parse().unwrap()).is_empty());
    }
}
