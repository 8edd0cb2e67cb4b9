// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pending-call bookkeeping for the client session (§4.5).
//!
//! The receive loop doesn't know a call's `Reply` type — only its `seq` and
//! the raw body bytes paired with that header. Decoding into the caller's
//! concrete type happens at the call site, once the bytes cross back over
//! the `oneshot` channel, the same deferred-decode shape the server's
//! `TypedMethod` uses in reverse.

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::Header,
    error::{Result, RpcError},
};

/// Decode target that just captures the raw body bytes verbatim, deferring
/// interpretation to whoever holds the matching [`Call`].
#[derive(Default)]
pub(crate) struct RawBody(pub Vec<u8>);

impl crate::codec::DecodeInto for RawBody {
    fn decode_into(&mut self, bytes: &[u8]) -> Result<()> {
        self.0 = bytes.to_vec();
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// What the receive loop hands back to a waiting caller: the response
/// header (carrying `error`, if any) and its undecoded body.
pub(crate) struct RawReply {
    pub header: Header,
    pub body: Vec<u8>,
}

pub(crate) type PendingSender = oneshot::Sender<Result<RawReply>>;

/// A single outstanding RPC, as seen by the caller that issued it.
///
/// Mirrors the teacher's request/response correlation (`ClientConnection`'s
/// `sending`/`reciver` maps keyed by initiator task tag) but keyed by `seq`
/// and backed by a single `oneshot` per call rather than an `mpsc` channel,
/// since a unary RPC has exactly one reply.
pub struct Call {
    pub(crate) seq: u64,
    pub(crate) rx: oneshot::Receiver<Result<RawReply>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) pending: crate::client::client::PendingTable,
}

impl Call {
    /// The sequence number this call was assigned.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Requests cancellation. Removes the pending-table entry so the
    /// eventual response (if one ever arrives) is silently dropped; leaves
    /// the wire undisturbed (§5) — there is no "cancel" message, the request
    /// was already sent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Awaits the response and decodes it as `Reply`. Races the server's
    /// answer against this call's own cancellation token.
    pub async fn recv<Reply: DeserializeOwned + Send>(mut self) -> Result<Reply> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.remove(&self.seq);
                Err(RpcError::Cancelled)
            }
            res = &mut self.rx => {
                let raw = res.map_err(|_| RpcError::Shutdown)??;
                if raw.header.is_error() {
                    return Err(RpcError::Handler(raw.header.error));
                }
                if raw.body.is_empty() {
                    return Err(RpcError::Decode("empty reply body".to_string()));
                }
                bincode::deserialize(&raw.body).map_err(|e| RpcError::Decode(e.to_string()))
            }
        }
    }
}
