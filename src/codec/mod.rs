// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pluggable framing/codec layer (§4.1 of the spec).
//!
//! A [`Codec`] is a bidirectional translator bound to a single byte stream.
//! Its contract is dyn-safe so the [`CodecFactory`] table can hand back a
//! boxed codec chosen at runtime from the [`crate::option::Option`] record's
//! `codec_type` tag. Typed argument/reply values cross the dyn boundary via
//! the small [`DecodeInto`]/[`EncodeFrom`] adapters below, which are
//! blanket-implemented for any `serde`-compatible type.
//!
//! Reading and writing are deliberately separate traits ([`CodecReader`],
//! [`CodecWriter`]): §3/§4.4/§4.5 require that a slow writer never blocks the
//! read loop, which means the two directions need independent locks, not one
//! mutex around the whole [`Codec`]. [`Codec::split`] hands back one of each,
//! backed by the same underlying stream via [`tokio::io::split`] the way the
//! teacher's `ClientConnection` splits a `TcpStream` into owned read/write
//! halves.

pub mod gob;

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Result, RpcError};

/// Metadata record transmitted before every body (§3).
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Object-safe decode target: "populate `self` from these bytes".
///
/// Blanket-implemented for every `DeserializeOwned` type so callers can pass
/// `&mut argv` as `&mut dyn DecodeInto` without writing an adapter by hand.
pub trait DecodeInto: Send {
    fn decode_into(&mut self, bytes: &[u8]) -> Result<()>;

    /// Lets dispatch code recover the concrete type behind the trait
    /// object once it already knows what that type is (see
    /// `registry::TypedMethod`).
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

impl<T> DecodeInto for T
where T: DeserializeOwned + Send + 'static
{
    fn decode_into(&mut self, bytes: &[u8]) -> Result<()> {
        *self = bincode::deserialize(bytes).map_err(|e| RpcError::Decode(e.to_string()))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Object-safe encode source: "serialize `self` to bytes".
pub trait EncodeFrom: Send + Sync {
    fn encode(&self) -> Result<Vec<u8>>;
}

impl<T> EncodeFrom for T
where T: Serialize + Send + Sync
{
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// A byte stream a [`Codec`] can be built on: owned, `Unpin`, and movable
/// across tasks (one codec per connection, one task reading it).
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

impl AsyncRead for Box<dyn Stream> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self).poll_read(cx, buf)
    }
}

impl AsyncWrite for Box<dyn Stream> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut **self).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self).poll_shutdown(cx)
    }
}

/// The read half of a [`Codec`] (§4.1).
///
/// Guarantee: header and body pairing is positional. A caller that reads a
/// header must read (or discard) exactly one body before reading the next
/// header; implementations track this and return a framing error if it is
/// violated.
#[async_trait]
pub trait CodecReader: Send {
    /// Blocking read of the next header. Fails with [`RpcError::Eof`] if the
    /// peer cleanly closed the stream at a frame boundary, or
    /// [`RpcError::Framing`] if it closed mid-frame.
    async fn read_header(&mut self) -> Result<Header>;

    /// Reads the body paired with the most recent header into `sink`.
    async fn read_body(&mut self, sink: &mut dyn DecodeInto) -> Result<()>;

    /// Reads the body paired with the most recent header and discards it,
    /// preserving framing without requiring the caller to know its type.
    async fn read_body_discard(&mut self) -> Result<()>;
}

/// The write half of a [`Codec`] (§4.1).
#[async_trait]
pub trait CodecWriter: Send {
    /// Atomically serializes `header` then `body`, flushing before
    /// returning. A flush failure means the connection must be considered
    /// dead.
    async fn write(&mut self, header: &Header, body: &dyn EncodeFrom) -> Result<()>;

    /// Releases the underlying stream.
    async fn close(&mut self) -> Result<()>;
}

/// Bidirectional translator between in-memory values and wire bytes, bound
/// to one stream (§4.1). [`Codec::split`] breaks it into an independently
/// lockable [`CodecReader`]/[`CodecWriter`] pair — the read loop and
/// concurrent response writers never contend for the same lock (§3/§4.4/
/// §4.5).
pub trait Codec: CodecReader + CodecWriter {
    /// Splits into independent read/write halves sharing the same
    /// underlying stream, the way `tokio::io::split` splits a `TcpStream`
    /// into owned halves.
    fn split(self: Box<Self>) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>);
}

/// Constructs a boxed [`Codec`] over an arbitrary boxed stream.
pub type CodecFactory = fn(Box<dyn Stream>) -> Box<dyn Codec>;

/// Maps a `codec_type` tag (e.g. `"application/gob"`) to a constructor, the
/// way the original's `codec.NewCodecFuncMap` does. Concurrency-safe for
/// read-mostly access, matching the registry's own `DashMap`-backed service
/// table.
#[derive(Clone)]
pub struct CodecRegistry {
    factories: DashMap<&'static str, CodecFactory>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field(
                "codec_types",
                &self.factories.iter().map(|e| *e.key()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let factories = DashMap::new();
        factories.insert(gob::CODEC_TYPE, gob::new_boxed as CodecFactory);
        Self { factories }
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, codec_type: &'static str, factory: CodecFactory) {
        self.factories.insert(codec_type, factory);
    }

    pub fn get(&self, codec_type: &str) -> Option<CodecFactory> {
        self.factories.get(codec_type).map(|f| *f.value())
    }

    pub fn build(&self, codec_type: &str, stream: Box<dyn Stream>) -> Result<Box<dyn Codec>> {
        let factory = self
            .get(codec_type)
            .ok_or_else(|| RpcError::Handshake(format!("invalid codec type: {codec_type}")))?;
        Ok(factory(stream))
    }
}
