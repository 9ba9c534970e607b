//! The simulation core: virtual clock, timer queue and dispatch FIFO.
//!
//! Virtual time is a [`SystemTime`] starting at the Unix epoch. It never
//! moves on its own: when the dispatch queue is drained and work remains
//! only in the future, the run loop fast-forwards the clock to the earliest
//! pending alarm and fires it. Alarms with equal expiry fire in insertion
//! order, which makes every run of a deterministic workload reproducible.

use crate::config::Configuration;
use crate::host::HostInner;
use crate::tcp::{AcceptorInner, TcpInner};
use crate::udp::UdpInner;
use crate::Error;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Range of ports handed out when binding to port zero.
const EPHEMERAL_PORT_RANGE: std::ops::Range<u16> = 32768..61000;

/// How long a connection attempt to an endpoint with no listener takes to
/// fail, approximating a round trip.
pub(crate) const REFUSE_LATENCY: Duration = Duration::from_millis(50);

type Callback = Box<dyn FnOnce()>;
type WaitHandler = Box<dyn FnOnce(Result<(), Error>)>;

/// A TCP endpoint registered in the simulation's bind table. Stream
/// sockets and acceptors share the table; connecting to a bound stream
/// socket is refused, connecting to a listening acceptor proceeds.
#[derive(Clone)]
pub(crate) enum TcpBinding {
    Stream(Weak<TcpInner>),
    Listener(Weak<AcceptorInner>),
}

impl TcpBinding {
    fn as_ptr(&self) -> *const () {
        match self {
            TcpBinding::Stream(w) => w.as_ptr() as *const (),
            TcpBinding::Listener(w) => w.as_ptr() as *const (),
        }
    }
}

enum AlarmTask {
    /// Internal work (packet departures, scheduled closures). Not
    /// cancellable; fired as posted callbacks.
    Callback(Callback),
    /// A user-facing [`Timer`] wait. Cancellation is lazy: the entry is
    /// skipped if the timer's generation moved on or its handler was taken.
    Wait {
        timer: Weak<RefCell<TimerState>>,
        generation: u64,
    },
}

struct Alarm {
    at: SystemTime,
    seq: u64,
    task: AlarmTask,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for a min-heap; the insertion sequence breaks expiry
        // ties so equal deadlines fire in insertion order.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct Core {
    pub(crate) config: RefCell<Box<dyn Configuration>>,
    now: Cell<SystemTime>,
    alarms: RefCell<BinaryHeap<Alarm>>,
    alarm_seq: Cell<u64>,
    ready: RefCell<VecDeque<Callback>>,
    stopped: Cell<bool>,
    pub(crate) tcp_binds: RefCell<BTreeMap<SocketAddr, TcpBinding>>,
    pub(crate) udp_binds: RefCell<BTreeMap<SocketAddr, Weak<UdpInner>>>,
    pub(crate) hosts: RefCell<Vec<Weak<HostInner>>>,
    next_ephemeral: Cell<u16>,
}

impl Core {
    pub(crate) fn now(&self) -> SystemTime {
        self.now.get()
    }

    /// Enqueue a callback on the dispatch FIFO.
    pub(crate) fn post<F: FnOnce() + 'static>(&self, f: F) {
        self.ready.borrow_mut().push_back(Box::new(f));
    }

    fn post_boxed(&self, f: Callback) {
        self.ready.borrow_mut().push_back(f);
    }

    /// Arm an internal alarm that runs `f` (via the dispatch FIFO) once
    /// virtual time reaches `at`.
    pub(crate) fn schedule(&self, at: SystemTime, f: Callback) {
        self.push_alarm(at, AlarmTask::Callback(f));
    }

    fn arm_wait(&self, at: SystemTime, timer: Weak<RefCell<TimerState>>, generation: u64) {
        self.push_alarm(at, AlarmTask::Wait { timer, generation });
    }

    fn push_alarm(&self, at: SystemTime, task: AlarmTask) {
        let seq = self.alarm_seq.get();
        self.alarm_seq.set(seq + 1);
        self.alarms.borrow_mut().push(Alarm { at, seq, task });
    }

    /// Run every ready callback, in FIFO order, including ones posted by
    /// the callbacks themselves.
    fn execute_ready(&self) -> usize {
        let mut executed = 0;
        loop {
            let next = self.ready.borrow_mut().pop_front();
            match next {
                Some(f) => {
                    f();
                    executed += 1;
                }
                None => break,
            }
        }
        executed
    }

    /// Pop the earliest live alarm. With `due_only`, leave alarms in the
    /// future untouched. Cancelled timer waits are discarded lazily here.
    fn pop_alarm(&self, due_only: bool) -> Option<Alarm> {
        loop {
            let due = {
                let alarms = self.alarms.borrow();
                match alarms.peek() {
                    Some(next) => !due_only || next.at <= self.now.get(),
                    None => false,
                }
            };
            if !due {
                return None;
            }
            let alarm = self.alarms.borrow_mut().pop().unwrap();
            match &alarm.task {
                AlarmTask::Callback(_) => return Some(alarm),
                AlarmTask::Wait { timer, generation } => {
                    let live = timer
                        .upgrade()
                        .map(|t| {
                            let state = t.borrow();
                            state.generation == *generation && state.handler.is_some()
                        })
                        .unwrap_or(false);
                    if live {
                        return Some(alarm);
                    }
                }
            }
        }
    }

    fn advance_to(&self, at: SystemTime) {
        if at > self.now.get() {
            self.now.set(at);
            debug!(
                now_ms = self
                    .now
                    .get()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
                "time advanced",
            );
        }
    }

    fn fire(&self, alarm: Alarm) {
        match alarm.task {
            AlarmTask::Callback(f) => self.post_boxed(f),
            AlarmTask::Wait { timer, generation } => {
                let Some(timer) = timer.upgrade() else { return };
                let handler = {
                    let mut state = timer.borrow_mut();
                    if state.generation == generation {
                        state.handler.take()
                    } else {
                        None
                    }
                };
                if let Some(handler) = handler {
                    self.post(move || handler(Ok(())));
                }
            }
        }
    }

    fn run(&self) -> usize {
        let mut executed = 0;
        loop {
            executed += self.execute_ready();
            if self.stopped.get() {
                break;
            }
            let Some(alarm) = self.pop_alarm(false) else { break };
            self.advance_to(alarm.at);
            self.fire(alarm);
        }
        executed
    }

    fn run_one(&self) -> usize {
        loop {
            let next = self.ready.borrow_mut().pop_front();
            if let Some(f) = next {
                f();
                return 1;
            }
            if self.stopped.get() {
                return 0;
            }
            let Some(alarm) = self.pop_alarm(false) else { return 0 };
            self.advance_to(alarm.at);
            self.fire(alarm);
        }
    }

    fn poll(&self) -> usize {
        let mut executed = 0;
        loop {
            executed += self.execute_ready();
            if self.stopped.get() {
                break;
            }
            let Some(alarm) = self.pop_alarm(true) else { break };
            self.fire(alarm);
        }
        executed
    }

    fn poll_one(&self) -> usize {
        loop {
            let next = self.ready.borrow_mut().pop_front();
            if let Some(f) = next {
                f();
                return 1;
            }
            if self.stopped.get() {
                return 0;
            }
            let Some(alarm) = self.pop_alarm(true) else { return 0 };
            self.fire(alarm);
        }
    }

    /// Reserve a fresh port for `ip` across both bind tables.
    fn ephemeral_port(&self, ip: std::net::IpAddr) -> u16 {
        loop {
            let port = self.next_ephemeral.get();
            if !EPHEMERAL_PORT_RANGE.contains(&port) {
                panic!("ephemeral port range exhausted");
            }
            self.next_ephemeral.set(port + 1);
            let candidate = SocketAddr::new(ip, port);
            if !self.tcp_binds.borrow().contains_key(&candidate)
                && !self.udp_binds.borrow().contains_key(&candidate)
            {
                return port;
            }
        }
    }

    pub(crate) fn bind_tcp(
        &self,
        mut ep: SocketAddr,
        binding: TcpBinding,
    ) -> Result<SocketAddr, Error> {
        if ep.port() == 0 {
            ep.set_port(self.ephemeral_port(ep.ip()));
        } else if self.tcp_binds.borrow().contains_key(&ep) {
            return Err(Error::AddressNotAvailable);
        }
        self.tcp_binds.borrow_mut().insert(ep, binding);
        Ok(ep)
    }

    /// Remove a TCP binding, but only if it still belongs to the caller.
    /// Accepted sockets share the acceptor's endpoint without owning the
    /// table entry; their close must not evict the listener.
    pub(crate) fn unbind_tcp(&self, ep: SocketAddr, owner: *const ()) {
        let mut binds = self.tcp_binds.borrow_mut();
        if binds.get(&ep).map(|b| b.as_ptr() == owner).unwrap_or(false) {
            binds.remove(&ep);
        }
    }

    pub(crate) fn bind_udp(
        &self,
        mut ep: SocketAddr,
        socket: Weak<UdpInner>,
    ) -> Result<SocketAddr, Error> {
        if ep.port() == 0 {
            ep.set_port(self.ephemeral_port(ep.ip()));
        } else if self.udp_binds.borrow().contains_key(&ep) {
            return Err(Error::AddressNotAvailable);
        }
        self.udp_binds.borrow_mut().insert(ep, socket);
        Ok(ep)
    }

    pub(crate) fn unbind_udp(&self, ep: SocketAddr, owner: *const ()) {
        let mut binds = self.udp_binds.borrow_mut();
        if binds
            .get(&ep)
            .map(|w| w.as_ptr() as *const () == owner)
            .unwrap_or(false)
        {
            binds.remove(&ep);
        }
    }

    pub(crate) fn find_udp(&self, ep: SocketAddr) -> Option<Rc<UdpInner>> {
        self.udp_binds.borrow().get(&ep).and_then(Weak::upgrade)
    }
}

/// Handle to a running simulation.
///
/// The simulation owns the virtual clock, the timer queue, the dispatch
/// FIFO, the TCP listener and UDP bind tables and the topology
/// configuration. Handles are cheap to clone and all refer to the same
/// underlying state. All use is single-threaded: callbacks, packet
/// deliveries and timer fires are serialized on the calling thread.
#[derive(Clone)]
pub struct Simulation {
    pub(crate) core: Rc<Core>,
}

impl Simulation {
    /// Create a simulation over the given topology configuration.
    pub fn new(config: impl Configuration + 'static) -> Self {
        let sim = Self {
            core: Rc::new(Core {
                config: RefCell::new(Box::new(config)),
                now: Cell::new(UNIX_EPOCH),
                alarms: RefCell::new(BinaryHeap::new()),
                alarm_seq: Cell::new(0),
                ready: RefCell::new(VecDeque::new()),
                stopped: Cell::new(false),
                tcp_binds: RefCell::new(BTreeMap::new()),
                udp_binds: RefCell::new(BTreeMap::new()),
                hosts: RefCell::new(Vec::new()),
                next_ephemeral: Cell::new(EPHEMERAL_PORT_RANGE.start),
            }),
        };
        sim.core.config.borrow_mut().build(&sim);
        sim
    }

    /// The current virtual time.
    pub fn now(&self) -> SystemTime {
        self.core.now()
    }

    /// Run until no work remains or the simulation is stopped. Returns the
    /// number of handlers executed.
    ///
    /// Each iteration drains the dispatch FIFO, then pops the earliest
    /// pending alarm, fast-forwards the clock to its expiry and fires it.
    pub fn run(&self) -> usize {
        self.core.run()
    }

    /// Run at most one handler, advancing virtual time if required.
    pub fn run_one(&self) -> usize {
        self.core.run_one()
    }

    /// Run all handlers that are ready without advancing virtual time.
    pub fn poll(&self) -> usize {
        self.core.poll()
    }

    /// Run at most one ready handler without advancing virtual time.
    pub fn poll_one(&self) -> usize {
        self.core.poll_one()
    }

    /// Stop the run loop at the next iteration. Pending work is retained.
    pub fn stop(&self) {
        self.core.stopped.set(true);
    }

    pub fn stopped(&self) -> bool {
        self.core.stopped.get()
    }

    /// Clear the stopped flag so the simulation can run again.
    pub fn reset(&self) {
        self.core.stopped.set(false);
    }

    /// Enqueue a callback on the dispatch FIFO.
    pub fn post<F: FnOnce() + 'static>(&self, f: F) {
        self.core.post(f);
    }

    /// Enqueue a callback on the dispatch FIFO. Callbacks are never run
    /// inline from the registering call, so `dispatch` is equivalent to
    /// [`Simulation::post`].
    pub fn dispatch<F: FnOnce() + 'static>(&self, f: F) {
        self.core.post(f);
    }
}

pub(crate) struct TimerState {
    expiry: SystemTime,
    generation: u64,
    handler: Option<WaitHandler>,
}

/// A one-shot timer driven by virtual time.
///
/// Arming a timer inserts it into the simulation's timer queue; firing
/// posts its handler with `Ok(())`, cancellation posts it with
/// [`Error::OperationAborted`]. Cancelling an already-fired timer is a
/// no-op. A pending timer must be kept alive (the queue holds only a weak
/// reference); dropping it silently abandons the wait.
#[derive(Clone)]
pub struct Timer {
    core: Rc<Core>,
    state: Rc<RefCell<TimerState>>,
}

impl Timer {
    pub fn new(host: &crate::Host) -> Self {
        Self::with_core(host.inner.core.clone())
    }

    pub(crate) fn with_core(core: Rc<Core>) -> Self {
        let expiry = core.now();
        Self {
            core,
            state: Rc::new(RefCell::new(TimerState {
                expiry,
                generation: 0,
                handler: None,
            })),
        }
    }

    /// The current expiry time.
    pub fn expiry(&self) -> SystemTime {
        self.state.borrow().expiry
    }

    /// Set an absolute expiry, aborting any outstanding wait. Returns the
    /// number of waits aborted.
    pub fn expires_at(&self, at: SystemTime) -> usize {
        let aborted = self.cancel();
        self.state.borrow_mut().expiry = at;
        aborted
    }

    /// Set the expiry relative to the current virtual time.
    pub fn expires_after(&self, delay: Duration) -> usize {
        self.expires_at(self.core.now() + delay)
    }

    /// Wait for the timer to expire. Registering a new wait aborts a
    /// pending one.
    pub fn async_wait<F>(&self, handler: F)
    where
        F: FnOnce(Result<(), Error>) + 'static,
    {
        let (at, generation) = {
            let mut state = self.state.borrow_mut();
            if let Some(previous) = state.handler.take() {
                state.generation += 1;
                self.core
                    .post(move || previous(Err(Error::OperationAborted)));
            }
            state.handler = Some(Box::new(handler));
            (state.expiry, state.generation)
        };
        self.core.arm_wait(at, Rc::downgrade(&self.state), generation);
    }

    /// Abort an outstanding wait, posting its handler with
    /// [`Error::OperationAborted`]. Returns the number of waits aborted.
    pub fn cancel(&self) -> usize {
        let mut state = self.state.borrow_mut();
        state.generation += 1;
        match state.handler.take() {
            Some(handler) => {
                self.core
                    .post(move || handler(Err(Error::OperationAborted)));
                1
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultConfig, Host};
    use std::cell::Cell;
    use std::time::Duration;

    fn fixture() -> (Simulation, Host) {
        let sim = Simulation::new(DefaultConfig::default());
        // A host without addresses: an internal context for timers.
        let host = Host::new(&sim, []);
        (sim, host)
    }

    #[test]
    fn run_with_no_work_returns() {
        let (sim, _host) = fixture();
        assert_eq!(sim.run(), 0);
        assert_eq!(sim.now(), UNIX_EPOCH);
    }

    #[test]
    fn post_order_is_fifo() {
        let (sim, _host) = fixture();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            sim.post(move || order.borrow_mut().push(i));
        }
        assert_eq!(sim.run(), 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn timer_advances_virtual_time() {
        let (sim, host) = fixture();
        let fired = Rc::new(Cell::new(false));
        let timer = Timer::new(&host);
        timer.expires_after(Duration::from_millis(10));
        let observed = fired.clone();
        timer.async_wait(move |result| {
            assert_eq!(result, Ok(()));
            observed.set(true);
        });
        sim.run();
        assert!(fired.get());
        assert_eq!(sim.now(), UNIX_EPOCH + Duration::from_millis(10));
    }

    #[test]
    fn equal_expiries_fire_in_insertion_order() {
        let (sim, host) = fixture();
        let order = Rc::new(RefCell::new(Vec::new()));
        let timers: Vec<Timer> = (0..4).map(|_| Timer::new(&host)).collect();
        for (i, timer) in timers.iter().enumerate() {
            timer.expires_at(UNIX_EPOCH + Duration::from_millis(5));
            let order = order.clone();
            timer.async_wait(move |_| order.borrow_mut().push(i));
        }
        sim.run();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancel_posts_operation_aborted() {
        let (sim, host) = fixture();
        let result = Rc::new(RefCell::new(None));
        let timer = Timer::new(&host);
        timer.expires_after(Duration::from_secs(10));
        let observed = result.clone();
        timer.async_wait(move |r| *observed.borrow_mut() = Some(r));
        assert_eq!(timer.cancel(), 1);
        assert_eq!(timer.cancel(), 0);
        sim.run();
        assert_eq!(*result.borrow(), Some(Err(Error::OperationAborted)));
        // The cancelled expiry was never waited for.
        assert_eq!(sim.now(), UNIX_EPOCH);
    }

    #[test]
    fn rearm_aborts_pending_wait() {
        let (sim, host) = fixture();
        let results = Rc::new(RefCell::new(Vec::new()));
        let timer = Timer::new(&host);
        timer.expires_after(Duration::from_secs(5));
        let observed = results.clone();
        timer.async_wait(move |r| observed.borrow_mut().push(r));
        assert_eq!(timer.expires_after(Duration::from_millis(1)), 1);
        let observed = results.clone();
        timer.async_wait(move |r| observed.borrow_mut().push(r));
        sim.run();
        assert_eq!(
            *results.borrow(),
            vec![Err(Error::OperationAborted), Ok(())]
        );
        assert_eq!(sim.now(), UNIX_EPOCH + Duration::from_millis(1));
    }

    #[test]
    fn stop_halts_before_timers() {
        let (sim, host) = fixture();
        let fired = Rc::new(Cell::new(false));
        let timer = Timer::new(&host);
        timer.expires_after(Duration::from_millis(1));
        let observed = fired.clone();
        timer.async_wait(move |_| observed.set(true));
        sim.stop();
        sim.run();
        assert!(!fired.get());
        sim.reset();
        sim.run();
        assert!(fired.get());
    }

    #[test]
    fn run_one_executes_a_single_handler() {
        let (sim, _host) = fixture();
        let count = Rc::new(Cell::new(0));
        for _ in 0..2 {
            let count = count.clone();
            sim.post(move || count.set(count.get() + 1));
        }
        assert_eq!(sim.run_one(), 1);
        assert_eq!(count.get(), 1);
        assert_eq!(sim.run(), 1);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn poll_does_not_advance_time() {
        let (sim, host) = fixture();
        let fired = Rc::new(Cell::new(false));
        let timer = Timer::new(&host);
        timer.expires_after(Duration::from_millis(10));
        let observed = fired.clone();
        timer.async_wait(move |_| observed.set(true));
        assert_eq!(sim.poll(), 0);
        assert!(!fired.get());
        assert_eq!(sim.now(), UNIX_EPOCH);
    }
}
