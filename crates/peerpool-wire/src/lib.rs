// SPDX-License-Identifier: MIT

//! peerpool-wire talks to the Bitcoin p2p network on behalf of a client.
//!
//! The main entry point is [`Pool`]: it discovers peers, keeps between `min_size` and
//! `max_size` of them connected, and exposes a request/response API on top of the gossip
//! protocol. Each peer is driven by a [`Connection`](connection) task, which frames messages
//! with [`FrameCodec`] and matches responses to pending requests in submission order. Supervisors
//! retry dead connections a bounded number of times before the pool blacklists their address.
//!
//! When a single peer can't be trusted with an answer, [`Pool::call_with_consensus`] asks several
//! of them at once and only returns a value they all agree on.

mod p2p_wire;

pub use p2p_wire::address;
pub use p2p_wire::codec;
pub use p2p_wire::connection;
pub use p2p_wire::consensus;
pub use p2p_wire::discovery;
pub use p2p_wire::error;
pub use p2p_wire::pending;
pub use p2p_wire::pool;
pub use p2p_wire::random;
pub use p2p_wire::supervisor;
pub use p2p_wire::transport;
pub use p2p_wire::ConnectionConfig;
pub use p2p_wire::PoolConfig;

pub use crate::address::PeerAddress;
pub use crate::codec::FrameCodec;
pub use crate::connection::ConnectionHandle;
pub use crate::error::WireError;
pub use crate::pool::Pool;
