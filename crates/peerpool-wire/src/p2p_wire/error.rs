use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::{self};
use std::io;

use bitcoin::p2p::message::NetworkMessage;
use peerpool_common::impl_error_from;

use super::address::AddrParseError;
use super::address::PeerAddress;
use super::codec::CodecError;

#[derive(Debug)]
pub enum WireError {
    /// The peer sent bytes we couldn't frame or decode
    Codec(CodecError),

    /// Generic io error
    Io(io::Error),

    /// A request's deadline elapsed before a matching response arrived
    RequestTimeout,

    /// The connection went away while a request was in flight
    ConnectionLost,

    /// Requests are only accepted after the handshake is done
    ConnectionNotReady,

    /// The peer answered our request with a `reject`
    PeerRejected { command: String, reason: String },

    /// The peer sent something that isn't allowed at this point of the handshake
    UnexpectedMessage(String),

    /// The version/verack exchange didn't finish in time
    HandshakeTimeout,

    /// We had requests in flight and the peer went silent
    IdleTimeout,

    /// We don't have peers to connect to, and not enough live ones to ask for more
    NoPeersAvailable,

    /// A consensus query needs more live connections than we have
    InsufficientPeersForConsensus { required: usize, available: usize },

    /// Peers gave different answers to the same consensus query. Holds every distinct answer,
    /// in the order they were first seen.
    ConsensusMismatch(Vec<NetworkMessage>),

    /// A supervisor ran out of retries before its connection ever became ready
    SupervisorGaveUp(PeerAddress),

    /// Poisoned lock
    PoisonedLock,

    /// We couldn't parse the provided address
    InvalidAddress(AddrParseError),
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Codec(err) => write!(f, "Codec error: {err}"),
            WireError::Io(err) => write!(f, "Generic IO error: {err:?}"),
            WireError::RequestTimeout => write!(f, "Request timed out"),
            WireError::ConnectionLost => write!(f, "Connection lost"),
            WireError::ConnectionNotReady => {
                write!(f, "Connection isn't ready to take requests yet")
            }
            WireError::PeerRejected { command, reason } => {
                write!(f, "Peer rejected our {command}: {reason}")
            }
            WireError::UnexpectedMessage(command) => {
                write!(f, "Peer sent an unexpected {command} message")
            }
            WireError::HandshakeTimeout => write!(f, "Handshake timed out"),
            WireError::IdleTimeout => write!(f, "Peer went silent with requests in flight"),
            WireError::NoPeersAvailable => write!(f, "No peers available to connect to"),
            WireError::InsufficientPeersForConsensus {
                required,
                available,
            } => write!(
                f,
                "Consensus needs {required} peers, but only {available} are connected"
            ),
            WireError::ConsensusMismatch(values) => {
                write!(f, "Peers disagree, got {} different responses:", values.len())?;
                for value in values {
                    write!(f, " {value:?};")?;
                }
                Ok(())
            }
            WireError::SupervisorGaveUp(address) => {
                write!(f, "Gave up connecting to {address}")
            }
            WireError::PoisonedLock => write!(f, "Poisoned lock"),
            WireError::InvalidAddress(err) => {
                write!(f, "We couldn't parse the provided address due to: {err}")
            }
        }
    }
}

impl std::error::Error for WireError {}

impl_error_from!(WireError, CodecError, Codec);
impl_error_from!(WireError, io::Error, Io);
impl_error_from!(WireError, AddrParseError, InvalidAddress);

impl<T> From<std::sync::PoisonError<T>> for WireError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        WireError::PoisonedLock
    }
}
