// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection-setup handshake (§4.2 of the spec).
//!
//! The very first bytes on any connection are a single self-describing JSON
//! line carrying the [`OptionRecord`] — independent of whatever codec gets
//! negotiated, because the codec isn't known until this line is parsed.
//! Everything after it is a sequence of (header, body) frames in the
//! negotiated codec.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    codec::{Codec, CodecRegistry, Stream},
    error::{Result, RpcError},
};

/// Rejects mismatched peers before any codec-specific bytes are trusted.
pub const MAGIC_NUMBER: i64 = 0x5a6b7c8d;

/// The option record exchanged at connection setup (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionRecord {
    #[serde(rename = "MagicNumber")]
    pub magic_number: i64,
    #[serde(rename = "CodecType")]
    pub codec_type: String,
    /// Nanoseconds; zero means unbounded.
    #[serde(rename = "ConnectTimeout")]
    pub connect_timeout_nanos: i64,
    /// Nanoseconds; zero means unbounded.
    #[serde(rename = "HandleTimeout")]
    pub handle_timeout_nanos: i64,
}

impl OptionRecord {
    pub fn new(codec_type: impl Into<String>, connect_timeout: Duration, handle_timeout: Duration) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: codec_type.into(),
            connect_timeout_nanos: connect_timeout.as_nanos() as i64,
            handle_timeout_nanos: handle_timeout.as_nanos() as i64,
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        duration_or_unbounded(self.connect_timeout_nanos)
    }

    pub fn handle_timeout(&self) -> Option<Duration> {
        duration_or_unbounded(self.handle_timeout_nanos)
    }
}

impl Default for OptionRecord {
    fn default() -> Self {
        Self::new(crate::codec::gob::CODEC_TYPE, Duration::ZERO, Duration::ZERO)
    }
}

fn duration_or_unbounded(nanos: i64) -> Option<Duration> {
    if nanos <= 0 {
        None
    } else {
        Some(Duration::from_nanos(nanos as u64))
    }
}

async fn write_option_line<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    opt: &OptionRecord,
) -> Result<()> {
    let mut line = serde_json::to_string(opt).map_err(|e| RpcError::Handshake(e.to_string()))?;
    line.push('\n');
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

async fn read_option_line<R: tokio::io::AsyncBufRead + Unpin>(r: &mut R) -> Result<OptionRecord> {
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Eof);
    }
    serde_json::from_str(line.trim_end())
        .map_err(|e| RpcError::Handshake(format!("options error: {e}")))
}

/// Server-side half of the handshake (§4.2): read the option line, validate
/// magic + codec, build the negotiated codec. Returns `Ok(None)` for
/// handshakes that should be silently dropped (bad magic / unknown codec),
/// matching the "log and drop the connection" contract — the caller logs
/// and returns rather than tearing anything else down.
pub async fn server_handshake(
    socket: impl Stream,
    registry: &CodecRegistry,
) -> Result<(Box<dyn Codec>, OptionRecord)> {
    let mut buffered = BufReader::new(socket);
    let opt = read_option_line(&mut buffered).await?;

    if opt.magic_number != MAGIC_NUMBER {
        warn!(magic = opt.magic_number, "rpc server: invalid magic number");
        return Err(RpcError::Handshake(format!(
            "invalid magic number {:#x}",
            opt.magic_number
        )));
    }

    let codec = registry.build(&opt.codec_type, Box::new(buffered))?;
    debug!(codec_type = %opt.codec_type, "rpc server: handshake complete");
    Ok((codec, opt))
}

/// Client-side half of the handshake (§4.2): write the option line then
/// install the negotiated codec for all subsequent frames. The whole
/// exchange (transport already established) is bounded by
/// `opt.connect_timeout`.
pub async fn client_handshake(
    socket: impl Stream,
    registry: &CodecRegistry,
    opt: &OptionRecord,
) -> Result<Box<dyn Codec>> {
    let mut buffered = BufReader::new(socket);
    let body = async {
        write_option_line(&mut buffered, opt).await?;
        Ok::<_, RpcError>(())
    };

    match opt.connect_timeout() {
        Some(d) => timeout(d, body)
            .await
            .map_err(|_| RpcError::DialTimeout(d))??,
        None => body.await?,
    };

    registry.build(&opt.codec_type, Box::new(buffered))
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn handshake_round_trips_the_option_record_and_negotiates_gob() {
        let (client_stream, server_stream) = duplex(1024);
        let registry = CodecRegistry::new();
        let opt = OptionRecord::default();

        let client_side = client_handshake(client_stream, &registry, &opt);
        let server_side = server_handshake(server_stream, &registry);

        let (client_result, server_result) = tokio::join!(client_side, server_side);
        client_result.unwrap();
        let (_codec, server_opt) = server_result.unwrap();
        assert_eq!(server_opt.magic_number, MAGIC_NUMBER);
        assert_eq!(server_opt.codec_type, crate::codec::gob::CODEC_TYPE);
    }

    #[tokio::test]
    async fn bad_magic_number_is_rejected() {
        let (mut client_stream, server_stream) = duplex(1024);
        let registry = CodecRegistry::new();

        let mut bad_opt = OptionRecord::default();
        bad_opt.magic_number = 0xdead_beefu32 as i64;
        let line = serde_json::to_string(&bad_opt).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client_stream, format!("{line}\n").as_bytes())
            .await
            .unwrap();

        let err = server_handshake(server_stream, &registry).await.unwrap_err();
        assert!(matches!(err, RpcError::Handshake(_)));
    }

    #[tokio::test]
    async fn client_handshake_times_out_when_peer_never_drains_the_buffer() {
        // A one-byte duplex buffer: the option line is several dozen bytes,
        // so the write stalls forever unless someone reads the other end —
        // which nothing does here, simulating an unresponsive peer.
        let (client_stream, _server_stream) = duplex(1);
        let registry = CodecRegistry::new();
        let opt = OptionRecord::new(
            crate::codec::gob::CODEC_TYPE,
            Duration::from_millis(50),
            Duration::ZERO,
        );

        let started = tokio::time::Instant::now();
        let err = client_handshake(client_stream, &registry, &opt)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::DialTimeout(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
