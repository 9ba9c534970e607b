//! Typed packets, routes and the sink abstraction.
//!
//! A [`Packet`] is a move-only record that carries its own remaining path:
//! an ordered sequence of [`Sink`]s. Each hop pops itself off the front and
//! forwards the remainder, so delivery needs no central routing table.

use crate::tcp::Channel;
use crate::Error;
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Add;
use std::rc::{Rc, Weak};
use tracing::trace;

/// The kind of a simulated packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// TCP connection attempt; carries the channel being established.
    Syn,
    /// TCP connection accepted.
    SynAck,
    /// Acknowledgment; the sequence number names the segment received.
    Ack,
    /// In-band error (connection refused, end of file).
    Error,
    /// Application payload.
    Payload,
}

/// A packet traversing the simulated network.
///
/// Packets are move-only: the drop handler is consumed when the packet is
/// dropped, and payload bytes are handed to exactly one receiver.
pub struct Packet {
    pub kind: PacketKind,

    /// Set iff `kind` is [`PacketKind::Error`].
    pub err: Option<Error>,

    /// Payload bytes; non-empty only for [`PacketKind::Payload`].
    pub payload: Bytes,

    /// Source endpoint, used for datagram sockets.
    pub from: SocketAddr,

    /// Wire overhead in bytes on top of the payload. The default is 20;
    /// connection setup and teardown packets use 40.
    pub overhead: usize,

    /// Remaining hops. Each hop pops itself off before forwarding.
    pub hops: Route,

    /// For SYN packets, the channel being established.
    pub channel: Option<Rc<RefCell<Channel>>>,

    /// Sequence number, unique per originating stream socket.
    pub seq: u64,

    /// Invoked exactly once if a downstream queue drops this packet.
    pub drop_handler: Option<Box<dyn FnOnce(Packet)>>,
}

impl Packet {
    /// A packet of the given kind with default fields.
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            err: None,
            payload: Bytes::new(),
            from: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            overhead: 20,
            hops: Route::new(),
            channel: None,
            seq: 0,
            drop_handler: None,
        }
    }

    /// Total size on the wire: payload plus overhead.
    pub fn wire_size(&self) -> usize {
        self.payload.len() + self.overhead
    }

    /// Whether a congested queue may drop this packet. To keep the
    /// transport dynamics simple, acknowledgments and errors never drop.
    pub fn ok_to_drop(&self) -> bool {
        !matches!(
            self.kind,
            PacketKind::SynAck | PacketKind::Ack | PacketKind::Error
        )
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("err", &self.err)
            .field("len", &self.payload.len())
            .field("from", &self.from)
            .field("seq", &self.seq)
            .field("hops", &self.hops.len())
            .finish()
    }
}

/// Anything that can accept an incoming packet: queues, NATs, sockets,
/// acceptors and forwarders.
pub trait Sink {
    /// Deliver a packet to this node.
    fn incoming_packet(&self, packet: Packet);

    /// Human-readable name, used when rendering the topology.
    fn label(&self) -> String;

    /// DOT attributes for topology rendering.
    fn attributes(&self) -> String {
        "shape=box".to_string()
    }

    /// Serialization rate in bytes per second, if this node constrains
    /// bandwidth. Queue nodes expose their configured rate here so sockets
    /// can derive transmit pacing from their egress route.
    fn transmit_rate(&self) -> Option<u64> {
        None
    }
}

/// An ordered sequence of sinks a packet passes through.
///
/// The empty route is valid and never forwards anywhere.
#[derive(Clone, Default)]
pub struct Route {
    hops: VecDeque<Rc<dyn Sink>>,
}

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    /// A route consisting of a single hop.
    pub fn single(hop: Rc<dyn Sink>) -> Self {
        let mut route = Route::new();
        route.push_back(hop);
        route
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// The next hop a packet on this route would visit.
    pub fn next_hop(&self) -> Option<Rc<dyn Sink>> {
        self.hops.front().cloned()
    }

    pub fn last(&self) -> Option<Rc<dyn Sink>> {
        self.hops.back().cloned()
    }

    /// Remove and return the first hop.
    pub fn pop_front(&mut self) -> Option<Rc<dyn Sink>> {
        self.hops.pop_front()
    }

    /// Replace the final hop. Used to patch a channel's route onto the
    /// accepted socket once it exists.
    pub fn replace_last(&mut self, hop: Rc<dyn Sink>) {
        if let Some(last) = self.hops.back_mut() {
            *last = hop;
        }
    }

    pub fn push_front(&mut self, hop: Rc<dyn Sink>) -> &mut Self {
        self.hops.push_front(hop);
        self
    }

    pub fn push_back(&mut self, hop: Rc<dyn Sink>) -> &mut Self {
        self.hops.push_back(hop);
        self
    }

    pub fn prepend(&mut self, route: &Route) -> &mut Self {
        for hop in route.hops.iter().rev() {
            self.hops.push_front(hop.clone());
        }
        self
    }

    pub fn append(&mut self, route: &Route) -> &mut Self {
        self.hops.extend(route.hops.iter().cloned());
        self
    }

    /// The bottleneck serialization rate along this route, if any hop
    /// constrains bandwidth.
    pub fn transmit_rate(&self) -> Option<u64> {
        self.hops.iter().filter_map(|hop| hop.transmit_rate()).min()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Rc<dyn Sink>> {
        self.hops.iter()
    }
}

impl Add for Route {
    type Output = Route;

    fn add(mut self, rhs: Route) -> Route {
        self.hops.extend(rhs.hops);
        self
    }
}

/// Pop the first hop off a packet's route and deliver the packet to it.
///
/// Forwarding is synchronous and never parallel; hops that model delay do
/// so by arming timers rather than by blocking. A packet whose route is
/// empty is discarded.
pub fn forward_packet(mut packet: Packet) {
    match packet.hops.pop_front() {
        Some(hop) => hop.incoming_packet(packet),
        None => trace!(?packet, "packet ran out of hops"),
    }
}

/// A shared-owned indirection in front of a user-owned socket.
///
/// Routes must share ownership of their sinks, but sockets are owned by
/// user code. The forwarder bridges the two: it is shared-owned, holds a
/// weak back-reference to the socket, and is cleared when the socket
/// closes, turning stale deliveries into silent drops instead of dangling
/// references.
pub struct SinkForwarder {
    target: RefCell<Option<Weak<dyn Sink>>>,
}

impl SinkForwarder {
    pub fn new(target: Weak<dyn Sink>) -> Rc<Self> {
        Rc::new(Self {
            target: RefCell::new(Some(target)),
        })
    }

    /// Detach the target; subsequent deliveries are dropped.
    pub fn clear(&self) {
        self.target.borrow_mut().take();
    }

    fn upgrade(&self) -> Option<Rc<dyn Sink>> {
        self.target.borrow().as_ref().and_then(Weak::upgrade)
    }
}

impl Sink for SinkForwarder {
    fn incoming_packet(&self, packet: Packet) {
        match self.upgrade() {
            Some(target) => target.incoming_packet(packet),
            None => trace!(?packet, reason = "socket closed", "dropping packet"),
        }
    }

    fn label(&self) -> String {
        self.upgrade().map(|t| t.label()).unwrap_or_default()
    }

    fn attributes(&self) -> String {
        self.upgrade()
            .map(|t| t.attributes())
            .unwrap_or_else(|| "shape=box".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Counter {
        delivered: Cell<usize>,
        name: &'static str,
    }

    impl Sink for Counter {
        fn incoming_packet(&self, _packet: Packet) {
            self.delivered.set(self.delivered.get() + 1);
        }

        fn label(&self) -> String {
            self.name.to_string()
        }
    }

    fn counter(name: &'static str) -> Rc<Counter> {
        Rc::new(Counter {
            delivered: Cell::new(0),
            name,
        })
    }

    #[test]
    fn route_algebra() {
        let a = counter("a");
        let b = counter("b");
        let c = counter("c");

        let mut route = Route::new();
        route.push_back(b.clone());
        route.push_front(a.clone());
        route.push_back(c.clone());
        assert_eq!(route.len(), 3);
        assert_eq!(route.next_hop().unwrap().label(), "a");
        assert_eq!(route.last().unwrap().label(), "c");

        let first = route.pop_front().unwrap();
        assert_eq!(first.label(), "a");
        assert_eq!(route.len(), 2);

        route.replace_last(a.clone());
        assert_eq!(route.last().unwrap().label(), "a");
    }

    #[test]
    fn route_concatenation() {
        let a = counter("a");
        let b = counter("b");
        let joined = Route::single(a) + Route::single(b);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.next_hop().unwrap().label(), "a");
        assert_eq!(joined.last().unwrap().label(), "b");
    }

    #[test]
    fn empty_route_never_forwards() {
        // Must not panic.
        forward_packet(Packet::new(PacketKind::Payload));
    }

    #[test]
    fn forwarding_visits_first_hop_only() {
        let a = counter("a");
        let b = counter("b");
        let mut packet = Packet::new(PacketKind::Payload);
        packet.hops = Route::single(a.clone()) + Route::single(b.clone());
        forward_packet(packet);
        assert_eq!(a.delivered.get(), 1);
        assert_eq!(b.delivered.get(), 0);
    }

    #[test]
    fn drop_eligibility() {
        assert!(Packet::new(PacketKind::Payload).ok_to_drop());
        assert!(Packet::new(PacketKind::Syn).ok_to_drop());
        assert!(!Packet::new(PacketKind::SynAck).ok_to_drop());
        assert!(!Packet::new(PacketKind::Ack).ok_to_drop());
        assert!(!Packet::new(PacketKind::Error).ok_to_drop());
    }

    #[test]
    fn cleared_forwarder_drops_silently() {
        let target = counter("target");
        let weak: Weak<Counter> = Rc::downgrade(&target);
        let forwarder = SinkForwarder::new(weak);

        let mut packet = Packet::new(PacketKind::Payload);
        packet.hops = Route::single(forwarder.clone());
        forward_packet(packet);
        assert_eq!(target.delivered.get(), 1);

        forwarder.clear();
        let mut packet = Packet::new(PacketKind::Payload);
        packet.hops = Route::single(forwarder.clone());
        forward_packet(packet);
        assert_eq!(target.delivered.get(), 1);
        assert_eq!(forwarder.label(), "");
    }

    #[test]
    fn dead_target_drops_silently() {
        let target = counter("target");
        let forwarder = SinkForwarder::new(Rc::downgrade(&target) as Weak<dyn Sink>);
        drop(target);

        let mut packet = Packet::new(PacketKind::Payload);
        packet.hops = Route::single(forwarder);
        forward_packet(packet);
    }
}
