//! Asking several peers the same question.
//!
//! A single peer can lie, or just be behind. [`Pool::call_with_consensus`] sends the same
//! request to `consensus_size` distinct live connections, picked at random, and only returns an
//! answer if all of them gave exactly the same one.

use bitcoin::block::Header;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use futures::future::join_all;
use log::debug;
use log::warn;
use peerpool_common::Hash256;

use super::connection::get_blocks_message;
use super::connection::get_headers_message;
use super::error::WireError;
use super::pool::Pool;

/// Returns the value everyone agrees on, `None` if there are no values, or every distinct value
/// in the order they were first seen if there's any disagreement.
pub fn unanimous<T: PartialEq>(values: Vec<T>) -> Result<Option<T>, Vec<T>> {
    let mut distinct: Vec<T> = Vec::new();
    for value in values {
        if !distinct.contains(&value) {
            distinct.push(value);
        }
    }

    match distinct.len() {
        0 | 1 => Ok(distinct.pop()),
        _ => Err(distinct),
    }
}

impl Pool {
    /// Sends `request` to a random sample of live connections and returns the response if they
    /// all agree.
    ///
    /// Fails without sending anything if there are fewer than `consensus_size` live
    /// connections. If any of the requests fails, the whole call fails with the error of the
    /// first failed request, in sample order.
    pub async fn call_with_consensus(
        &self,
        request: NetworkMessage,
    ) -> Result<Option<NetworkMessage>, WireError> {
        let clients = self.inner.sample_clients(self.config().consensus_size)?;
        debug!(
            "Asking {:?} for {} with consensus",
            clients.iter().map(|c| c.address()).collect::<Vec<_>>(),
            request.command()
        );

        let responses = join_all(clients.iter().map(|client| client.request(request.clone()))).await;
        let values = responses.into_iter().collect::<Result<Vec<_>, _>>()?;

        unanimous(values).map_err(|distinct| {
            warn!(
                "Peers disagree on {}, got {} different answers",
                request.command(),
                distinct.len()
            );
            WireError::ConsensusMismatch(distinct)
        })
    }

    /// `getheaders`, answered only if every sampled peer sends the same headers
    pub async fn get_headers_with_consensus(
        &self,
        locator: &[Hash256],
    ) -> Result<Vec<Header>, WireError> {
        match self
            .call_with_consensus(get_headers_message(locator))
            .await?
        {
            Some(NetworkMessage::Headers(headers)) => Ok(headers),
            Some(other) => Err(WireError::UnexpectedMessage(other.command().to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// `getblocks`, answered only if every sampled peer sends the same inventory
    pub async fn get_block_list_with_consensus(
        &self,
        locator: &[Hash256],
    ) -> Result<Vec<Inventory>, WireError> {
        match self.call_with_consensus(get_blocks_message(locator)).await? {
            Some(NetworkMessage::Inv(inventory)) => Ok(inventory),
            Some(other) => Err(WireError::UnexpectedMessage(other.command().to_string())),
            None => Ok(Vec::new()),
        }
    }
}
