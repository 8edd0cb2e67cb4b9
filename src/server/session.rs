// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection server session (§4.4): single-threaded read loop,
//! concurrent handler dispatch, serialized response writes, drain-on-EOF.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::{
    codec::{Codec, CodecWriter, Header},
    error::RpcError,
    registry::{MethodDesc, ServiceRegistry},
};

/// One connection's worth of protocol interaction on the server.
///
/// The codec is split into independent [`CodecReader`](crate::codec::CodecReader)/
/// [`CodecWriter`] halves at construction time (`Codec::split`). Handler
/// tasks write their own responses concurrently with the read loop's next
/// `read_header`; if both directions shared one lock, a handler waiting to
/// write its reply could never acquire it while the read loop holds it
/// blocked on the next `read_header` — exactly the deadlock this split
/// avoids. The read half is only ever touched by `serve`/`dispatch`, which
/// run sequentially on `&self`, so it needs no `Arc`; the write half is
/// cloned into every spawned handler task, so it does.
pub struct ServerSession {
    registry: Arc<ServiceRegistry>,
    reader: Mutex<Box<dyn crate::codec::CodecReader>>,
    writer: Arc<Mutex<Box<dyn CodecWriter>>>,
    handle_timeout: Option<Duration>,
    inflight: Arc<AtomicU64>,
    drained: Arc<Notify>,
}

impl ServerSession {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        codec: Box<dyn Codec>,
        handle_timeout: Option<Duration>,
    ) -> Self {
        let (reader, writer) = codec.split();
        Self {
            registry,
            reader: Mutex::new(reader),
            writer: Arc::new(Mutex::new(writer)),
            handle_timeout,
            inflight: Arc::new(AtomicU64::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Runs the session to completion: reads requests until EOF or a fatal
    /// framing error, dispatching each to a handler task, then waits for all
    /// outstanding handler tasks to finish before closing the transport.
    pub async fn serve(self) {
        loop {
            let header = {
                let mut reader = self.reader.lock().await;
                reader.read_header().await
            };

            let header = match header {
                Ok(h) => h,
                Err(RpcError::Eof) => {
                    debug!("rpc server: connection closed by peer");
                    break;
                },
                Err(e) => {
                    warn!(error = %e, "rpc server: read header error");
                    break;
                },
            };

            self.dispatch(header).await;
        }

        self.drain().await;
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }

    async fn dispatch(&self, header: Header) {
        let lookup = self.registry.find(&header.service_method);

        let (_service, method) = match lookup {
            Ok(pair) => pair,
            Err(e) => {
                warn!(service_method = %header.service_method, error = %e, "rpc server: routing error");
                {
                    let mut reader = self.reader.lock().await;
                    let _ = reader.read_body_discard().await;
                }
                let mut writer = self.writer.lock().await;
                Self::send_error(&mut writer, header, e.to_string()).await;
                return;
            },
        };

        let mut argv = method.new_argv();
        let decode_result = {
            let mut reader = self.reader.lock().await;
            reader.read_body(&mut *argv).await
        };
        if let Err(e) = decode_result {
            warn!(service_method = %header.service_method, error = %e, "rpc server: read body error");
            let mut writer = self.writer.lock().await;
            Self::send_error(&mut writer, header, format!("read body: {e}")).await;
            return;
        }

        self.spawn_handler(header, method, argv);
    }

    fn spawn_handler(
        &self,
        header: Header,
        method: Arc<MethodDesc>,
        argv: Box<dyn crate::codec::DecodeInto>,
    ) {
        let writer = Arc::clone(&self.writer);
        let inflight = Arc::clone(&self.inflight);
        let drained = Arc::clone(&self.drained);
        let handle_timeout = self.handle_timeout;

        inflight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut reply = method.new_reply();
            let call = tokio::spawn(async move {
                let result = method.call(&*argv, &mut *reply).await;
                (result, reply)
            });

            let outcome = match handle_timeout {
                Some(d) => tokio::time::timeout(d, call).await,
                None => Ok(call.await),
            };

            match outcome {
                Ok(Ok((Ok(()), reply))) => {
                    let mut writer = writer.lock().await;
                    if let Err(e) = writer.write(&header, &*reply).await {
                        warn!(error = %e, "rpc server: write response error");
                    }
                },
                Ok(Ok((Err(e), _reply))) => {
                    let mut writer = writer.lock().await;
                    Self::send_error(&mut writer, header, e.to_string()).await;
                },
                Ok(Err(join_err)) => {
                    let msg = if join_err.is_panic() {
                        "handler panicked".to_string()
                    } else {
                        join_err.to_string()
                    };
                    let mut writer = writer.lock().await;
                    Self::send_error(&mut writer, header, msg).await;
                },
                Err(_elapsed) => {
                    let d = handle_timeout.unwrap_or_default();
                    let mut writer = writer.lock().await;
                    Self::send_error(
                        &mut writer,
                        header,
                        format!("request handle timeout: expected within {d:?}"),
                    )
                    .await;
                    // `call` keeps running in the background; its eventual
                    // (result, reply) is dropped when it finishes, since
                    // nothing is left holding on to it.
                },
            }

            if inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_waiters();
            }
        });
    }

    async fn send_error(writer: &mut Box<dyn CodecWriter>, mut header: Header, error: String) {
        header.error = error;
        if let Err(e) = writer.write(&header, &()).await {
            warn!(error = %e, "rpc server: write error response failed");
        }
    }

    /// Waits until `inflight` drops to zero. The `Notified` future must be
    /// created and `enable()`-armed *before* the `inflight` check: otherwise
    /// a handler that decrements `inflight` to 0 and calls `notify_waiters()`
    /// between our check and our `.notified()` call would wake no one, and
    /// this would hang forever (tokio's documented lost-wakeup hazard for
    /// `Notify`).
    async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inflight.load(Ordering::SeqCst) == 0 {
                break;
            }

            notified.await;
        }
        info!("rpc server: session drained");
    }
}
