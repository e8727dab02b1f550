//! Raw packet-layer endpoint (`AF_PACKET`). A single recv callback over a
//! raw socket bound to a protocol/port pair; no `mio`/`socket2` support
//! for this socket family, so registration and I/O go through `libc`
//! directly, same as the original.

use crate::error::{NioError, Result};
use crate::reactor::ReactorGroup;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use std::cell::RefCell;
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use tracing::warn;

pub type PacketRecvCb = dyn FnMut(&mut PacketEndpoint, &[u8]);

pub struct PacketEndpoint {
    fd: RawFd,
    recv_cb: Option<Box<PacketRecvCb>>,
}

impl PacketEndpoint {
    /// Open a raw socket and bind it to `port` (interpreted as an
    /// ethertype/protocol selector, matching `netio_raw_init`).
    pub fn init(port: u16, group: &ReactorGroup) -> Result<Rc<RefCell<PacketEndpoint>>> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (port as i32).to_be() as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(NioError::SocketError(io::Error::last_os_error().raw_os_error().unwrap_or(-1)));
        }
        set_nonblocking(fd)?;

        let endpoint = Rc::new(RefCell::new(PacketEndpoint { fd, recv_cb: None }));
        let token = group.next_token();
        let weak: Weak<RefCell<PacketEndpoint>> = Rc::downgrade(&endpoint);
        {
            let ep = endpoint.borrow();
            let mut source = SourceFd(&ep.fd);
            group.register_fn(&mut source, token, Interest::READABLE, move || {
                if let Some(ep) = weak.upgrade() {
                    ep.borrow_mut().drain();
                }
            })?;
        }
        Ok(endpoint)
    }

    pub fn set_recv_callback(&mut self, cb: impl FnMut(&mut PacketEndpoint, &[u8]) + 'static) {
        self.recv_cb = Some(Box::new(cb));
    }

    /// Raw send to an explicit destination. Unused fields of `sockaddr_in`
    /// beyond address/port are zeroed, matching the address format used
    /// throughout (`a.b.c.d:port`).
    pub fn sendto(&self, dst: SocketAddrV4, data: &[u8]) -> io::Result<usize> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = dst.port().to_be();
        addr.sin_addr.s_addr = u32::from(*dst.ip()).to_be();
        let n = unsafe {
            libc::sendto(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::WouldBlock && e.kind() != io::ErrorKind::Interrupted {
                    warn!(error = %e, "raw packet recv failed");
                }
                break;
            }
            if let Some(mut cb) = self.recv_cb.take() {
                cb(self, &buf[..n as usize]);
                self.recv_cb = Some(cb);
            }
        }
    }
}

impl Drop for PacketEndpoint {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

