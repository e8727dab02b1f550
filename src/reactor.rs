//! Thin adapter over a `mio` poll instance: the Reactor Binding component.
//!
//! A [`ReactorGroup`] wraps one OS-level `mio::Poll` plus a dispatch table
//! from `mio::Token` to the TCP endpoint that owns it. Multiple endpoints
//! can share a single group (and therefore a single poll loop on one
//! thread) by registering into the same dispatch table -- this is what the
//! original calls "sharing a group base" rather than creating a dedicated
//! event loop per endpoint.
//!
//! There is no locking anywhere in here: a group is single-threaded by
//! construction (`Rc`, not `Arc`), matching the cooperative, non-reentrant
//! callback model described for endpoints.

use crate::tcp::TcpEndpoint;
use mio::{Events, Interest, Poll, Token};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace};

/// How often the reactor checks every registered endpoint's write queue
/// and timer callback even if no readiness event fired. The endpoint's
/// own idle/active oscillation (1ms busy, 500ms idle) is layered on top of
/// this by `TcpEndpoint::on_timer`.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

struct Inner {
    poll: Poll,
    events: Events,
    dispatch: HashMap<Token, Rc<RefCell<TcpEndpoint>>>,
    /// Readiness callbacks for endpoints that don't participate in the TCP
    /// dispatch table -- UDP, multicast, and raw-packet endpoints, which
    /// share the reactor but none of the TCP core's pools or queues.
    extra_dispatch: HashMap<Token, Rc<dyn Fn()>>,
    next_token: usize,
}

/// A shared, single-threaded event loop. Clone to hand the same group to
/// multiple endpoints; all clones point at the same underlying `Poll`.
#[derive(Clone)]
pub struct ReactorGroup(Rc<RefCell<Inner>>);

impl ReactorGroup {
    /// Create a new group with its own `mio::Poll` instance.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(ReactorGroup(Rc::new(RefCell::new(Inner {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(16)),
            dispatch: HashMap::new(),
            extra_dispatch: HashMap::new(),
            next_token: 0,
        }))))
    }

    /// Reserve the next `Token` for a new registration without touching
    /// the OS registry yet; the caller finishes the registration with
    /// [`ReactorGroup::register`] once the socket exists.
    pub fn next_token(&self) -> Token {
        let mut inner = self.0.borrow_mut();
        let t = Token(inner.next_token);
        inner.next_token += 1;
        t
    }

    /// Register `source` for `interest` under `token`, and remember that
    /// `endpoint` owns events for it.
    pub fn register<S>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
        endpoint: Rc<RefCell<TcpEndpoint>>,
    ) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        let mut inner = self.0.borrow_mut();
        inner.poll.registry().register(source, token, interest)?;
        inner.dispatch.insert(token, endpoint);
        Ok(())
    }

    /// Register a non-TCP endpoint's readiness callback. `on_ready` is
    /// invoked with no arguments on every readable/writable event for
    /// `token`; the caller closes over whatever `Weak` handle it needs.
    pub fn register_fn<S>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
        on_ready: impl Fn() + 'static,
    ) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        let mut inner = self.0.borrow_mut();
        inner.poll.registry().register(source, token, interest)?;
        inner.extra_dispatch.insert(token, Rc::new(on_ready));
        Ok(())
    }

    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        self.0
            .borrow()
            .poll
            .registry()
            .reregister(source, token, interest)
    }

    /// Deregister `source` and drop the dispatch entry for `token`.
    pub fn deregister<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        let mut inner = self.0.borrow_mut();
        let res = inner.poll.registry().deregister(source);
        inner.dispatch.remove(&token);
        inner.extra_dispatch.remove(&token);
        res
    }

    /// Run one iteration: poll for readiness, dispatch to owning endpoints,
    /// then give every registered endpoint a timer tick regardless of
    /// whether it had a readiness event this round.
    pub fn poll_once(&self) -> io::Result<()> {
        // `events` must be taken out of the RefCell to call mio::Poll::poll
        // (it needs &mut Events while `dispatch` may be borrowed again by
        // a callback), so swap it out and back.
        let mut events = std::mem::replace(&mut self.0.borrow_mut().events, Events::with_capacity(0));
        let poll_result = {
            let mut inner = self.0.borrow_mut();
            inner.poll.poll(&mut events, Some(POLL_TIMEOUT))
        };
        if let Err(e) = poll_result {
            self.0.borrow_mut().events = events;
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        let mut fired = Vec::new();
        for event in events.iter() {
            fired.push((event.token(), event.is_readable(), event.is_writable()));
        }
        self.0.borrow_mut().events = events;

        for (token, readable, writable) in fired {
            if let Some(endpoint) = self.0.borrow().dispatch.get(&token).cloned() {
                if readable {
                    TcpEndpoint::on_readable(&endpoint, token);
                }
                if writable {
                    TcpEndpoint::on_writable(&endpoint, token);
                }
                continue;
            }
            let callback = self.0.borrow().extra_dispatch.get(&token).cloned();
            match callback {
                Some(cb) => cb(),
                None => trace!(?token, "event for unknown or already-removed token"),
            }
        }

        let endpoints: Vec<Rc<RefCell<TcpEndpoint>>> =
            self.0.borrow().dispatch.values().cloned().collect();
        let mut seen = std::collections::HashSet::new();
        for endpoint in endpoints {
            let ptr = Rc::as_ptr(&endpoint) as usize;
            if !seen.insert(ptr) {
                continue;
            }
            TcpEndpoint::on_timer(&endpoint);
        }

        Ok(())
    }

    /// Drive [`Self::poll_once`] until `should_stop` returns `true`.
    pub fn run_until(&self, mut should_stop: impl FnMut() -> bool) -> io::Result<()> {
        while !should_stop() {
            self.poll_once()?;
        }
        debug!("reactor group stopping");
        Ok(())
    }

    pub fn registered_count(&self) -> usize {
        self.0.borrow().dispatch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_allocation_is_sequential_and_unique() {
        let group = ReactorGroup::new(16).unwrap();
        let a = group.next_token();
        let b = group.next_token();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_group_poll_once_does_not_block_forever() {
        let group = ReactorGroup::new(16).unwrap();
        // No registrations; should return promptly after the poll timeout.
        group.poll_once().unwrap();
        assert_eq!(group.registered_count(), 0);
    }
}
