//! Bookkeeping for requests waiting on a response from one peer.
//!
//! The p2p protocol has no request ids, so the only way to tell which request a message answers
//! is to look at the message itself. Every request carries a predicate, and an incoming message
//! is handed to the oldest pending request whose predicate accepts it. Each message resolves at
//! most one request.

use std::collections::VecDeque;

use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::Reject;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error::WireError;

/// Decides whether a message is the response to a given request
pub type ResponseMatcher = Box<dyn Fn(&NetworkMessage) -> bool + Send + Sync>;

/// What a caller waiting on a request eventually gets
pub type Response = Result<NetworkMessage, WireError>;

pub struct PendingRequest {
    /// The command we sent, used to route `reject` messages
    pub command: String,
    matcher: ResponseMatcher,
    deadline: Instant,
    resolve: oneshot::Sender<Response>,
}

impl PendingRequest {
    /// Creates a new request, and the receiver its caller should wait on
    pub fn new(
        command: impl Into<String>,
        matcher: ResponseMatcher,
        deadline: Instant,
    ) -> (Self, oneshot::Receiver<Response>) {
        let (resolve, receiver) = oneshot::channel();
        let request = PendingRequest {
            command: command.into(),
            matcher,
            deadline,
            resolve,
        };

        (request, receiver)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the caller stopped waiting for this request
    pub fn is_cancelled(&self) -> bool {
        self.resolve.is_closed()
    }

    /// Fails this request with `error`
    pub fn fail(self, error: WireError) {
        let _ = self.resolve.send(Err(error));
    }
}

#[derive(Default)]
/// All in-flight requests of a connection, oldest first
pub struct PendingRequests {
    requests: VecDeque<PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        PendingRequests::default()
    }

    pub fn push(&mut self, request: PendingRequest) {
        self.requests.push_back(request);
    }

    /// Number of requests someone is still waiting on
    pub fn len(&self) -> usize {
        self.requests.iter().filter(|r| !r.is_cancelled()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops requests whose caller went away
    pub fn prune(&mut self) {
        self.requests.retain(|request| !request.is_cancelled());
    }

    /// Hands `message` to the oldest request that accepts it. Returns whether some request took
    /// it.
    pub fn resolve(&mut self, message: &NetworkMessage) -> bool {
        self.prune();

        let Some(position) = self
            .requests
            .iter()
            .position(|request| (request.matcher)(message))
        else {
            return false;
        };

        if let Some(request) = self.requests.remove(position) {
            let _ = request.resolve.send(Ok(message.clone()));
        }

        true
    }

    /// Fails the oldest request for the command named in a `reject`
    pub fn reject(&mut self, reject: &Reject) -> bool {
        self.prune();

        let rejected: &str = reject.message.as_ref();
        let Some(position) = self
            .requests
            .iter()
            .position(|request| request.command == rejected)
        else {
            return false;
        };

        if let Some(request) = self.requests.remove(position) {
            let command = request.command.clone();
            request.fail(WireError::PeerRejected {
                command,
                reason: reject.reason.to_string(),
            });
        }

        true
    }

    /// Fails every request whose deadline is at or before `now`, returning how many there were
    pub fn expire(&mut self, now: Instant) -> usize {
        self.prune();

        let (expired, alive): (VecDeque<_>, VecDeque<_>) = self
            .requests
            .drain(..)
            .partition(|request| request.deadline <= now);
        self.requests = alive;

        let count = expired.len();
        for request in expired {
            request.fail(WireError::RequestTimeout);
        }

        count
    }

    /// The earliest deadline among requests someone is still waiting on
    pub fn next_deadline(&self) -> Option<Instant> {
        self.requests
            .iter()
            .filter(|r| !r.is_cancelled())
            .map(|r| r.deadline)
            .min()
    }

    /// Fails everything, used when the connection goes away
    pub fn fail_all(&mut self) {
        for request in self.requests.drain(..) {
            request.fail(WireError::ConnectionLost);
        }
    }
}
