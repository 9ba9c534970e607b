//! Serial hostname resolution with configurable latency.
//!
//! A resolver processes lookups strictly in order: a lookup's completion
//! time is the later of "now" and the previous lookup's completion, plus
//! the latency the configuration assigns to the name. One internal timer
//! walks the queue. IP literals resolve locally with zero latency.

use crate::host::{Host, HostInner};
use crate::sim::Timer;
use crate::Error;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::SystemTime;

/// A resolution request: a hostname (or IP literal) and a numeric service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub host: String,
    pub service: String,
}

impl Query {
    pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
        }
    }
}

/// One resolved endpoint, echoing the queried name and service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveEntry {
    pub endpoint: SocketAddr,
    pub host_name: String,
    pub service: String,
}

type ResolveHandler = Box<dyn FnOnce(Result<Vec<ResolveEntry>, Error>)>;

struct Lookup {
    complete_at: SystemTime,
    result: Result<Vec<ResolveEntry>, Error>,
    handler: ResolveHandler,
}

pub(crate) struct ResolverInner {
    host: Rc<HostInner>,
    me: RefCell<Weak<ResolverInner>>,
    timer: Timer,
    queue: RefCell<VecDeque<Lookup>>,
}

impl ResolverInner {
    /// Complete the head lookup and re-arm the timer for the next one.
    fn fire_head(&self) {
        let (handler, result, next) = {
            let mut queue = self.queue.borrow_mut();
            let Some(lookup) = queue.pop_front() else { return };
            let next = queue.front().map(|l| l.complete_at);
            (lookup.handler, lookup.result, next)
        };
        handler(result);
        if let Some(at) = next {
            self.arm(at);
        }
    }

    fn arm(&self, at: SystemTime) {
        self.timer.expires_at(at);
        let me = self.me.borrow().clone();
        self.timer.async_wait(move |result| {
            if result.is_err() {
                return;
            }
            if let Some(inner) = me.upgrade() {
                inner.fire_head();
            }
        });
    }
}

/// Resolves hostnames against the simulation's configuration.
///
/// Lookups on one resolver are serial: two back-to-back 50 ms lookups
/// complete at 50 ms and 100 ms.
#[derive(Clone)]
pub struct Resolver {
    inner: Rc<ResolverInner>,
}

impl Resolver {
    pub fn new(host: &Host) -> Self {
        let inner = Rc::new(ResolverInner {
            host: host.inner.clone(),
            me: RefCell::new(Weak::new()),
            timer: Timer::with_core(host.inner.core.clone()),
            queue: RefCell::new(VecDeque::new()),
        });
        *inner.me.borrow_mut() = Rc::downgrade(&inner);
        Self { inner }
    }

    /// Resolve `query`, delivering entries in configuration order. The
    /// handler fires after the configured lookup latency; queued lookups
    /// accumulate their latencies.
    pub fn async_resolve<F>(&self, query: Query, handler: F)
    where
        F: FnOnce(Result<Vec<ResolveEntry>, Error>) + 'static,
    {
        let core = &self.inner.host.core;

        let port: Option<u16> = query.service.parse().ok();
        let (latency, result) = match port {
            None => (std::time::Duration::ZERO, Err(Error::HostNotFound)),
            Some(port) => match query.host.parse::<IpAddr>() {
                // Literals need no lookup.
                Ok(ip) => (
                    std::time::Duration::ZERO,
                    Ok(vec![ResolveEntry {
                        endpoint: SocketAddr::new(ip, port),
                        host_name: query.host.clone(),
                        service: query.service.clone(),
                    }]),
                ),
                Err(_) => {
                    let requestor = self
                        .inner
                        .host
                        .ips
                        .first()
                        .copied()
                        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                    let (latency, addrs) = core
                        .config
                        .borrow_mut()
                        .hostname_lookup(requestor, &query.host);
                    let entries = addrs.map(|addrs| {
                        addrs
                            .into_iter()
                            .map(|ip| ResolveEntry {
                                endpoint: SocketAddr::new(ip, port),
                                host_name: query.host.clone(),
                                service: query.service.clone(),
                            })
                            .collect()
                    });
                    (latency, entries)
                }
            },
        };

        let now = core.now();
        let first = {
            let mut queue = self.inner.queue.borrow_mut();
            let start = queue
                .back()
                .map(|l| l.complete_at.max(now))
                .unwrap_or(now);
            let complete_at = start + latency;
            queue.push_back(Lookup {
                complete_at,
                result,
                handler: Box::new(handler),
            });
            if queue.len() == 1 {
                Some(complete_at)
            } else {
                None
            }
        };
        if let Some(at) = first {
            self.inner.arm(at);
        }
    }

    /// Abort every queued lookup with [`Error::OperationAborted`].
    pub fn cancel(&self) {
        self.inner.timer.cancel();
        let drained: Vec<Lookup> = self.inner.queue.borrow_mut().drain(..).collect();
        let core = &self.inner.host.core;
        for lookup in drained {
            let handler = lookup.handler;
            core.post(move || handler(Err(Error::OperationAborted)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultConfig, Simulation};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn literal_resolves_without_time_passing() {
        let sim = Simulation::new(DefaultConfig::default());
        let host = Host::new(&sim, ["40.30.20.10".parse().unwrap()]);
        let resolver = Resolver::new(&host);

        let got = Rc::new(RefCell::new(None));
        let observed = got.clone();
        resolver.async_resolve(Query::new("10.10.10.10", "8080"), move |r| {
            *observed.borrow_mut() = Some(r);
        });
        sim.run();

        assert_eq!(sim.now(), UNIX_EPOCH);
        let got = got.borrow();
        let entries = got.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].endpoint, "10.10.10.10:8080".parse().unwrap());
        assert_eq!(entries[0].host_name, "10.10.10.10");
        assert_eq!(entries[0].service, "8080");
    }

    #[test]
    fn unknown_host_fails_after_latency() {
        let sim = Simulation::new(DefaultConfig::default());
        let host = Host::new(&sim, ["40.30.20.10".parse().unwrap()]);
        let resolver = Resolver::new(&host);

        let got = Rc::new(RefCell::new(None));
        let observed = got.clone();
        resolver.async_resolve(Query::new("nope.example", "80"), move |r| {
            *observed.borrow_mut() = Some(r);
        });
        sim.run();

        assert_eq!(sim.now(), UNIX_EPOCH + Duration::from_millis(100));
        assert_eq!(*got.borrow(), Some(Err(Error::HostNotFound)));
    }

    #[test]
    fn cancel_aborts_queued_lookups() {
        let sim = Simulation::new(DefaultConfig::default());
        let host = Host::new(&sim, ["40.30.20.10".parse().unwrap()]);
        let resolver = Resolver::new(&host);

        let results = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let observed = results.clone();
            resolver.async_resolve(Query::new("nope.example", "80"), move |r| {
                observed.borrow_mut().push(r);
            });
        }
        resolver.cancel();
        sim.run();

        assert_eq!(sim.now(), UNIX_EPOCH);
        assert_eq!(
            *results.borrow(),
            vec![Err(Error::OperationAborted), Err(Error::OperationAborted)]
        );
    }
}
