// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client session (§4.5): one connection, many concurrent in-flight calls.
//!
//! Grounded almost directly on `client/client.rs::ClientConnection` — a
//! `DashMap` correlating in-flight work with a background receive loop
//! spawned at construction — reshaped from per-ITT `mpsc` channels into a
//! single `seq`-keyed table of one-shot reply slots, since unlike an iSCSI
//! connection's NOP-In/SCSI exchange pattern every RPC call has exactly one
//! reply. The send and receive paths are split into independent locks at
//! construction (`Codec::split`), the same way the teacher splits a
//! `TcpStream` into owned `reader`/`writer` halves: the receive loop blocks
//! on `read_header` for the next reply, and a concurrent `go()`/`close()`
//! writing a request must never wait on that same lock.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde::Serialize;
use tokio::{net::TcpStream, sync::Mutex, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::pending::{Call, PendingSender, RawBody, RawReply},
    codec::{Codec, CodecReader, CodecRegistry, CodecWriter, Header, Stream},
    error::{Result, RpcError},
    option::{OptionRecord, client_handshake},
};

pub(crate) type PendingTable = Arc<DashMap<u64, PendingSender>>;

/// A connected RPC client. The background receive loop holds its own `Arc`
/// so the client stays alive as long as either a caller or the loop needs
/// it.
pub struct Client {
    reader: Mutex<Box<dyn CodecReader>>,
    writer: Mutex<Box<dyn CodecWriter>>,
    next_seq: AtomicU64,
    pending: PendingTable,
    shutdown: AtomicBool,
}

impl Client {
    /// Wraps an already-negotiated codec as a client, spawning its
    /// background receive loop.
    pub fn new(codec: Box<dyn Codec>) -> Arc<Self> {
        let (reader, writer) = codec.split();
        let client = Arc::new(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            next_seq: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let reader = Arc::clone(&client);
        tokio::spawn(async move {
            reader.receive_loop().await;
        });

        client
    }

    /// Issues a call without waiting for the reply; returns a [`Call`]
    /// handle the caller awaits (or cancels) on its own schedule.
    pub async fn go<Args>(&self, service_method: impl Into<String>, args: &Args) -> Result<Call>
    where Args: Serialize + Send + Sync {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let header = Header::request(service_method, seq);

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.insert(seq, tx);

        let write_result = {
            let mut writer = self.writer.lock().await;
            writer.write(&header, args).await
        };

        if let Err(e) = write_result {
            self.pending.remove(&seq);
            return Err(e);
        }

        Ok(Call {
            seq,
            rx,
            cancel: CancellationToken::new(),
            pending: Arc::clone(&self.pending),
        })
    }

    /// Issues a call and awaits its reply, the common case.
    pub async fn call<Args, Reply>(&self, service_method: impl Into<String>, args: &Args) -> Result<Reply>
    where
        Args: Serialize + Send + Sync,
        Reply: serde::de::DeserializeOwned + Send,
    {
        self.go(service_method, args).await?.recv().await
    }

    /// Shuts the connection down: no further calls will be accepted, and any
    /// pending ones are failed once the receive loop notices the closed
    /// transport.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        writer.close().await
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            let header = {
                let mut reader = self.reader.lock().await;
                reader.read_header().await
            };

            let header = match header {
                Ok(h) => h,
                Err(RpcError::Eof) => {
                    debug!("rpc client: connection closed by peer");
                    break;
                },
                Err(e) => {
                    warn!(error = %e, "rpc client: read header error");
                    break;
                },
            };

            let mut body = RawBody::default();
            let body_result = {
                let mut reader = self.reader.lock().await;
                reader.read_body(&mut body).await
            };

            let seq = header.seq;
            match self.pending.remove(&seq) {
                Some((_, tx)) => {
                    let reply = body_result.map(|()| RawReply {
                        header,
                        body: body.0,
                    });
                    let _ = tx.send(reply);
                },
                None => {
                    warn!(seq, "rpc client: reply for unknown or cancelled call");
                },
            }
        }

        self.shutdown.store(true, Ordering::Release);
        // Any sender still in the table at this point belongs to a call no
        // one will ever hear back from; dropping it completes the receiver
        // with a `RecvError`, which `Call::recv` turns into
        // `RpcError::Shutdown`.
        self.pending.retain(|_, _| false);
    }
}

/// Dials `addr`, performs the `Option` handshake within `opt.connect_timeout`,
/// and returns a running [`Client`]. An explicitly out-of-scope convenience
/// layered on top of the core (§1), mirroring `ClientConnection::connect`'s
/// "connect, then spawn the background reader" shape.
pub async fn dial(
    addr: impl tokio::net::ToSocketAddrs,
    registry: &CodecRegistry,
    opt: OptionRecord,
) -> Result<Arc<Client>> {
    let connect_fut = TcpStream::connect(addr);
    let stream = match opt.connect_timeout() {
        Some(d) => timeout(d, connect_fut)
            .await
            .map_err(|_| RpcError::DialTimeout(d))??,
        None => connect_fut.await?,
    };
    stream.set_nodelay(true)?;

    let codec = client_handshake(Box::new(stream) as Box<dyn Stream>, registry, &opt).await?;
    Ok(Client::new(codec))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tokio::io::duplex;

    use super::*;
    use crate::codec::gob::GobCodec;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Reply(i64);

    #[tokio::test]
    async fn call_round_trips_through_a_fake_peer() {
        let (client_stream, server_stream) = duplex(4096);
        let client = Client::new(Box::new(GobCodec::new(client_stream)));

        tokio::spawn(async move {
            let mut server_codec = GobCodec::new(server_stream);
            let header = server_codec.read_header().await.unwrap();
            let mut argv = Args::default();
            server_codec.read_body(&mut argv).await.unwrap();
            let reply = Reply(argv.a + argv.b);
            server_codec.write(&header, &reply).await.unwrap();
        });

        let reply: Reply = client.call("Foo.Sum", &Args { a: 3, b: 4 }).await.unwrap();
        assert_eq!(reply.0, 7);
    }

    #[tokio::test]
    async fn cancelling_a_call_before_reply_returns_cancelled() {
        let (client_stream, _server_stream) = duplex(4096);
        let client = Client::new(Box::new(GobCodec::new(client_stream)));

        let call = client.go("Foo.Sum", &Args::default()).await.unwrap();
        call.cancel();
        let result: Result<Reply> = call.recv().await;
        assert!(matches!(result, Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn closed_connection_fails_outstanding_calls_with_shutdown() {
        let (client_stream, server_stream) = duplex(4096);
        let client = Client::new(Box::new(GobCodec::new(client_stream)));

        let call = client.go("Foo.Sum", &Args::default()).await.unwrap();
        drop(server_stream);

        let result: Result<Reply> = call.recv().await;
        assert!(matches!(result, Err(RpcError::Shutdown)));
    }
}
