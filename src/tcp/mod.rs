//! The TCP endpoint core: servers and clients multiplexing many
//! non-blocking connections on a shared [`crate::reactor::ReactorGroup`].

mod connection;
mod endpoint;

pub use connection::{Chunk, Connection, RECV_CHUNK_SIZE};
pub use endpoint::{Role, TcpEndpoint};

use crate::pool::PoolKey;

/// A stable reference to a connection, valid until the connection is torn
/// down. Carries no lifetime because the connection it names lives inside
/// the owning endpoint's pool, not behind a borrow the caller holds.
pub type ConnHandle = PoolKey;

/// The reason a connection's close callback fired, per the wire contract
/// in the external-interfaces section: peer close, an OS errno, or one of
/// the three internally generated codes.
pub mod close_code {
    pub const PEER_CLOSE: i32 = 0;
    pub const ENDPOINT_RELEASE: i32 = -1;
    pub const CLOSE_ALL: i32 = -2;
    pub const EXPLICIT_CLOSE: i32 = -3;
}

/// Outcome of one call into a user-supplied parse callback. This replaces
/// the sentinel-integer ABI (`consumed_bytes` doubling as an error/need-
/// more-data signal, with an in/out `out_capacity` parameter) with a
/// proper sum type; `Consumed.message_len` and `Error`/`ProtocolCapacity`
/// map back onto the wire contract when talking to the bundled framers in
/// `[crate::framers]`.
pub enum ParseOutcome {
    /// Not enough bytes buffered yet; try again after the next receive.
    NeedMore,
    /// The callback reported a protocol violation. The connection is not
    /// closed; the rest of this event's bytes are discarded.
    Error,
    /// The callback's output buffer was too small for the framed message.
    ProtocolCapacity,
    /// `consumed` bytes were removed from the head of the input; the
    /// framed message is the first `message_len` bytes of the output
    /// buffer passed to the callback.
    Consumed { consumed: usize, message_len: usize },
}

// Every callback that can act on the endpoint (to `send`, inspect other
// connections, etc.) receives `&mut TcpEndpoint` as its first argument
// rather than closing over an `Rc<RefCell<TcpEndpoint>>` itself -- the
// endpoint always has exclusive access to itself while dispatching a
// callback (see the take/restore helpers in `endpoint.rs`), so there is
// never a need for the callback to re-borrow a shared handle.
pub type AcceptCb = dyn FnMut(&mut TcpEndpoint, ConnHandle) -> i32;
pub type CloseCb = dyn FnMut(&mut TcpEndpoint, ConnHandle, i32);
pub type ReceiveCb = dyn FnMut(&mut TcpEndpoint, ConnHandle, &[u8]);
pub type ParseCb = dyn FnMut(&[u8], &mut [u8]) -> ParseOutcome;
pub type AcceptAdmissionCb = dyn FnMut(&mut TcpEndpoint) -> i32;
pub type ReceiveAdmissionCb = dyn FnMut(&mut TcpEndpoint, ConnHandle) -> i32;
