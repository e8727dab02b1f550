//! Multicast endpoint: joins an IPv4 multicast group and delivers
//! datagrams to a single recv callback. Like [`crate::udp`], independent
//! of the TCP core.

use crate::error::Result;
use crate::reactor::ReactorGroup;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Token};
use std::cell::RefCell;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::rc::{Rc, Weak};
use tracing::warn;

pub type MulticastRecvCb = dyn FnMut(&mut MulticastEndpoint, &[u8]);

pub struct MulticastEndpoint {
    socket: MioUdpSocket,
    recv_cb: Option<Box<MulticastRecvCb>>,
}

impl MulticastEndpoint {
    /// Join the multicast group at `address:port` on the default
    /// interface.
    pub fn init(address: Ipv4Addr, port: u16, group: &ReactorGroup) -> Result<Rc<RefCell<MulticastEndpoint>>> {
        let std_socket = StdUdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            port,
        )))?;
        std_socket.join_multicast_v4(&address, &Ipv4Addr::UNSPECIFIED)?;
        std_socket.set_nonblocking(true)?;
        let socket = MioUdpSocket::from_std(std_socket);

        let endpoint = Rc::new(RefCell::new(MulticastEndpoint {
            socket,
            recv_cb: None,
        }));
        let token = group.next_token();
        let weak: Weak<RefCell<MulticastEndpoint>> = Rc::downgrade(&endpoint);
        {
            let mut ep = endpoint.borrow_mut();
            group.register_fn(&mut ep.socket, token, Interest::READABLE, move || {
                if let Some(ep) = weak.upgrade() {
                    ep.borrow_mut().drain();
                }
            })?;
        }
        Ok(endpoint)
    }

    pub fn set_recv_callback(&mut self, cb: impl FnMut(&mut MulticastEndpoint, &[u8]) + 'static) {
        self.recv_cb = Some(Box::new(cb));
    }

    pub fn send(&self, data: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, dst)
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, _from)) => {
                    if let Some(mut cb) = self.recv_cb.take() {
                        cb(self, &buf[..n]);
                        self.recv_cb = Some(cb);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "multicast recv failed");
                    break;
                }
            }
        }
    }
}
