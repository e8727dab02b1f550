//! A single accepted or connected TCP socket and its receive-reassembly
//! chain.

use super::{CloseCb, ParseCb, ReceiveAdmissionCb, ReceiveCb};
use crate::pool::PoolKey;
use mio::net::TcpStream;
use mio::Token;

/// Fixed chunk size for both the embedded head and every pool-allocated
/// overflow chunk in a connection's receive chain.
pub const RECV_CHUNK_SIZE: usize = 65536;

/// One node of a connection's receive-reassembly chain. Only the head is
/// embedded in the `Connection`; every other chunk lives in the owning
/// endpoint's chunk pool and is linked by `next`.
pub struct Chunk {
    pub data: Box<[u8; RECV_CHUNK_SIZE]>,
    pub len: usize,
    pub next: Option<PoolKey>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk {
            data: Box::new([0u8; RECV_CHUNK_SIZE]),
            len: 0,
            next: None,
        }
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

/// A live TCP session, accepted by a server endpoint or created by
/// `connect`. Lives inside the owning endpoint's connection pool; the
/// endpoint is reached by the caller, not stored here, since every
/// operation on a connection already happens through an endpoint method.
pub struct Connection {
    pub stream: TcpStream,
    pub token: Token,
    /// Embedded head of the receive-reassembly chain (§3 "Receive-chunk
    /// chain"). Overflow chunks are allocated from the endpoint's chunk
    /// pool and linked via `head.next`.
    pub head: Chunk,
    /// Non-owning reference to a relay target: every byte received here
    /// is forwarded to it, bypassing parse/receive callbacks.
    pub relay_peer: Option<PoolKey>,
    /// Per-connection overrides; `None` falls back to the endpoint's
    /// default of the same name.
    pub receive_cb: Option<Box<ReceiveCb>>,
    pub close_cb: Option<Box<CloseCb>>,
    pub parse_cb: Option<Box<ParseCb>>,
    pub receive_admission_cb: Option<Box<ReceiveAdmissionCb>>,
    /// Set once teardown has started, so a second trigger within the same
    /// event (e.g. a read error followed by a queued explicit close) is a
    /// no-op rather than a double-free.
    pub closing: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, token: Token) -> Self {
        Connection {
            stream,
            token,
            head: Chunk::new(),
            relay_peer: None,
            receive_cb: None,
            close_cb: None,
            parse_cb: None,
            receive_admission_cb: None,
            closing: false,
        }
    }

    /// Total bytes currently buffered across the whole receive chain
    /// (head plus overflow), not counting bytes already delivered.
    pub fn residual_len(&self, chunks: &crate::pool::Pool<Chunk>) -> usize {
        let mut total = self.head.len;
        let mut cur = self.head.next;
        while let Some(k) = cur {
            let chunk = chunks.get(k).expect("chain link must be live");
            total += chunk.len;
            cur = chunk.next;
        }
        total
    }
}
