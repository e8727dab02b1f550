//! UDP endpoint: a single datagram socket with one recv callback and no
//! queueing. Independent of the TCP core -- it reuses the reactor but
//! shares no pools, write queue, or connection state with it.

use crate::error::Result;
use crate::reactor::ReactorGroup;
use mio::net::UdpSocket;
use mio::{Interest, Token};
use std::cell::RefCell;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::{Rc, Weak};
use tracing::warn;

pub type UdpRecvCb = dyn FnMut(&mut UdpEndpoint, SocketAddr, &[u8]);

/// A bound UDP socket. `send`/`send_by_address` are fire-and-forget: there
/// is no write queue, matching the source's "no queueing" contract for
/// this endpoint kind.
pub struct UdpEndpoint {
    socket: UdpSocket,
    recv_cb: Option<Box<UdpRecvCb>>,
}

impl UdpEndpoint {
    pub fn init(address: Ipv4Addr, port: u16, group: &ReactorGroup) -> Result<Rc<RefCell<UdpEndpoint>>> {
        let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(address, port)))?;
        let endpoint = Rc::new(RefCell::new(UdpEndpoint {
            socket,
            recv_cb: None,
        }));
        let token = group.next_token();
        register_for_dispatch(group, &endpoint, token)?;
        Ok(endpoint)
    }

    pub fn set_recv_callback(&mut self, cb: impl FnMut(&mut UdpEndpoint, SocketAddr, &[u8]) + 'static) {
        self.recv_cb = Some(Box::new(cb));
    }

    pub fn send(&self, dst: SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, dst)
    }

    pub fn send_by_address(&self, address: Ipv4Addr, port: u16, data: &[u8]) -> io::Result<usize> {
        self.send(SocketAddr::V4(SocketAddrV4::new(address, port)), data)
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Some(mut cb) = self.recv_cb.take() {
                        cb(self, from, &buf[..n]);
                        self.recv_cb = Some(cb);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "udp recv failed");
                    break;
                }
            }
        }
    }
}

// Kept a plain function rather than a `ReactorGroup` method since UDP
// dispatch is a parallel, simpler mechanism (no token->endpoint HashMap
// shared with TCP endpoints) -- it owns a private weak table entry keyed
// by the socket's own registration instead.
fn register_for_dispatch(
    group: &ReactorGroup,
    endpoint: &Rc<RefCell<UdpEndpoint>>,
    token: Token,
) -> Result<()> {
    let weak: Weak<RefCell<UdpEndpoint>> = Rc::downgrade(endpoint);
    let mut ep = endpoint.borrow_mut();
    group.register_fn(&mut ep.socket, token, Interest::READABLE, move || {
        if let Some(ep) = weak.upgrade() {
            ep.borrow_mut().drain();
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_to_ephemeral_port_succeeds() {
        let group = ReactorGroup::new(4).unwrap();
        let endpoint = UdpEndpoint::init(Ipv4Addr::LOCALHOST, 0, &group).unwrap();
        assert!(endpoint.borrow().socket.local_addr().is_ok());
    }
}
