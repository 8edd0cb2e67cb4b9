// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `"application/gob"`: a length-delimited, `bincode`-encoded binary codec —
//! this ecosystem's closest analogue to Go's reflection-capable
//! `encoding/gob`, which the spec requires at least one codec to be
//! comparable to.
//!
//! Wire shape per frame component: `u32` big-endian byte length, followed by
//! that many bincode-encoded bytes. A zero-length body is the "empty body"
//! sentinel used for error responses (§4.4).

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{Codec, CodecReader, CodecWriter, DecodeInto, EncodeFrom, Header, Stream};
use crate::error::{Result, RpcError};

pub const CODEC_TYPE: &str = "application/gob";

pub fn new_boxed(stream: Box<dyn Stream>) -> Box<dyn Codec> {
    Box::new(GobCodec::new(stream))
}

/// Reads a length-prefixed frame, distinguishing a clean end-of-stream
/// (nothing read yet) from a truncated one (some bytes read, then EOF).
async fn fill_or_eof<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
) -> Result<bool> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(RpcError::Framing(format!(
                "truncated frame: got {filled} of {} bytes",
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(true)
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
    allow_eof: bool,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !fill_or_eof(r, &mut len_buf).await? {
        if allow_eof {
            return Ok(None);
        }
        return Err(RpcError::Framing("truncated frame: missing length prefix".into()));
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    if len > 0 && !fill_or_eof(r, &mut body).await? {
        return Err(RpcError::Framing("truncated frame: missing payload".into()));
    }
    Ok(Some(body))
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| RpcError::Framing("frame too large".into()))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(bytes).await?;
    Ok(())
}

/// Tracks whether a header has been read without its paired body being
/// consumed yet, enforcing the codec's positional-pairing guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    AwaitingHeader,
    AwaitingBody,
}

pub struct GobCodec<S> {
    stream: S,
    state: ReadState,
}

impl<S: Stream> GobCodec<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ReadState::AwaitingHeader,
        }
    }
}

#[async_trait]
impl<S: Stream> CodecReader for GobCodec<S> {
    async fn read_header(&mut self) -> Result<Header> {
        read_header(&mut self.stream, &mut self.state).await
    }

    async fn read_body(&mut self, sink: &mut dyn DecodeInto) -> Result<()> {
        read_body(&mut self.stream, &mut self.state, sink).await
    }

    async fn read_body_discard(&mut self) -> Result<()> {
        read_body_discard(&mut self.stream, &mut self.state).await
    }
}

#[async_trait]
impl<S: Stream> CodecWriter for GobCodec<S> {
    async fn write(&mut self, header: &Header, body: &dyn EncodeFrom) -> Result<()> {
        write_frames(&mut self.stream, header, body).await
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

impl<S: Stream> Codec for GobCodec<S> {
    /// Splits the underlying stream via `tokio::io::split`, the same
    /// primitive `TcpStream::into_split` is built on, so the read loop and a
    /// concurrent response writer never contend for one lock.
    fn split(self: Box<Self>) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>) {
        let this = *self;
        let (read_half, write_half) = tokio::io::split(this.stream);
        (
            Box::new(GobReader {
                stream: read_half,
                state: this.state,
            }),
            Box::new(GobWriter { stream: write_half }),
        )
    }
}

/// Read-only half produced by [`Codec::split`].
struct GobReader<R> {
    stream: R,
    state: ReadState,
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin + 'static> CodecReader for GobReader<R> {
    async fn read_header(&mut self) -> Result<Header> {
        read_header(&mut self.stream, &mut self.state).await
    }

    async fn read_body(&mut self, sink: &mut dyn DecodeInto) -> Result<()> {
        read_body(&mut self.stream, &mut self.state, sink).await
    }

    async fn read_body_discard(&mut self) -> Result<()> {
        read_body_discard(&mut self.stream, &mut self.state).await
    }
}

/// Write-only half produced by [`Codec::split`].
struct GobWriter<W> {
    stream: W,
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin + 'static> CodecWriter for GobWriter<W> {
    async fn write(&mut self, header: &Header, body: &dyn EncodeFrom) -> Result<()> {
        write_frames(&mut self.stream, header, body).await
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

async fn read_header<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut R,
    state: &mut ReadState,
) -> Result<Header> {
    if *state == ReadState::AwaitingBody {
        return Err(RpcError::Framing(
            "read_header called before the previous body was consumed".into(),
        ));
    }
    let frame = read_frame(stream, true).await?;
    let bytes = frame.ok_or(RpcError::Eof)?;
    let header: Header =
        bincode::deserialize(&bytes).map_err(|e| RpcError::Framing(e.to_string()))?;
    *state = ReadState::AwaitingBody;
    trace!(?header, "read_header");
    Ok(header)
}

async fn read_body<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut R,
    state: &mut ReadState,
    sink: &mut dyn DecodeInto,
) -> Result<()> {
    let bytes = read_frame(stream, false).await?.unwrap_or_default();
    *state = ReadState::AwaitingHeader;
    if bytes.is_empty() {
        return Ok(());
    }
    sink.decode_into(&bytes)
}

async fn read_body_discard<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut R,
    state: &mut ReadState,
) -> Result<()> {
    let _ = read_frame(stream, false).await?;
    *state = ReadState::AwaitingHeader;
    Ok(())
}

async fn write_frames<W: tokio::io::AsyncWrite + Unpin>(
    stream: &mut W,
    header: &Header,
    body: &dyn EncodeFrom,
) -> Result<()> {
    let header_bytes = bincode::serialize(header).map_err(|e| RpcError::Framing(e.to_string()))?;
    let body_bytes = body.encode()?;
    write_frame(stream, &header_bytes).await?;
    write_frame(stream, &body_bytes).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn round_trips_header_and_body() {
        let (client, server) = duplex(4096);
        let mut writer = GobCodec::new(client);
        let mut reader = GobCodec::new(server);

        let header = Header::request("Foo.Sum", 7);
        let body: i64 = 42;
        writer.write(&header, &body).await.unwrap();

        let got = reader.read_header().await.unwrap();
        assert_eq!(got.seq, 7);
        assert_eq!(got.service_method, "Foo.Sum");

        let mut sink: i64 = 0;
        reader.read_body(&mut sink).await.unwrap();
        assert_eq!(sink, 42);
    }

    #[tokio::test]
    async fn empty_body_is_a_noop_sentinel() {
        let (client, server) = duplex(4096);
        let mut writer = GobCodec::new(client);
        let mut reader = GobCodec::new(server);

        let header = Header {
            service_method: "Foo.Sum".into(),
            seq: 1,
            error: "boom".into(),
        };
        writer.write(&header, &()).await.unwrap();

        let got = reader.read_header().await.unwrap();
        assert!(got.is_error());
        reader.read_body_discard().await.unwrap();
    }

    #[tokio::test]
    async fn clean_close_before_any_frame_is_eof() {
        let (client, server) = duplex(4096);
        drop(client);
        let mut reader = GobCodec::new(server);
        let err = reader.read_header().await.unwrap_err();
        assert!(matches!(err, RpcError::Eof));
    }

    #[tokio::test]
    async fn truncated_header_is_a_framing_error() {
        let (mut client, server) = duplex(4096);
        client.write_all(&[0, 0, 0, 1]).await.unwrap();
        drop(client);
        let mut reader = GobCodec::new(server);
        let err = reader.read_header().await.unwrap_err();
        assert!(matches!(err, RpcError::Framing(_)));
    }
}
