//! A callback-driven, reactor-based network I/O core: many non-blocking
//! TCP connections multiplexed on a shared event reactor, plus
//! independent UDP, multicast, and raw-packet endpoints.
//!
//! The TCP endpoint ([`tcp::TcpEndpoint`]) is the hard part: a
//! reactor-integrated connection table, a per-connection receive
//! reassembly buffer, a bounded outbound write queue with fair draining,
//! user-supplied frame parser dispatch, and a pool-backed connection
//! lifecycle that survives accept/close churn without per-event
//! allocation.

pub mod config;
pub mod error;
pub mod framers;
pub mod multicast;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod reactor;
pub mod tcp;
pub mod udp;

pub use error::{NioError, Result};
pub use reactor::ReactorGroup;
pub use tcp::{ConnHandle, ParseOutcome, Role, TcpEndpoint};
