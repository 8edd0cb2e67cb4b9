// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HTTP request-line dispatch for the two external-collaborator adapters
//! (§6): the `CONNECT` hijack that hands a raw stream to a session, and the
//! `/debug/mrpc` registry page. Everything downstream of a successful
//! hijack is ordinary session protocol — this module never touches a
//! `Header` or `Codec`.

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::{info, warn};

use crate::{
    error::Result,
    server::{debug, frontend::Server},
};

/// Default path the adapter listens for a `CONNECT` request on (§6).
pub const DEFAULT_CONNECT_PATH: &str = "/_mrpc_";

const SUCCESS_LINE: &[u8] = b"HTTP/1.0 200 Connected to m RPC\n\n";
const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.0 405 Method Not Allowed\n\n";

/// Reads one HTTP request line off `stream` and routes it: `CONNECT
/// <connect_path>` hijacks the stream into an ordinary session, `GET
/// /debug/mrpc` renders the registry page, anything else gets `405`.
pub async fn handle(server: &Server, stream: TcpStream, connect_path: &str) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    if method == "CONNECT" && target == connect_path {
        return hijack(server, reader, &target).await;
    }

    if method == "GET" && target == debug::DEBUG_PATH {
        return serve_debug_page(server, reader).await;
    }

    warn!(%method, %target, "rpc connect: rejecting unrecognized request");
    reader.write_all(METHOD_NOT_ALLOWED).await?;
    reader.shutdown().await?;
    Ok(())
}

async fn hijack(
    server: &Server,
    mut reader: BufReader<TcpStream>,
    target: &str,
) -> Result<()> {
    drain_headers(&mut reader).await?;

    reader.write_all(SUCCESS_LINE).await?;
    reader.flush().await?;
    info!(%target, "rpc connect: hijacked stream for session");

    // Hand the still-buffered reader onward rather than unwrapping it: any
    // bytes the peer already sent past the blank line (pipelined with the
    // CONNECT request) must not be dropped, the same reasoning the option
    // handshake uses for its own `BufReader`.
    server.serve_conn(reader).await
}

async fn serve_debug_page(server: &Server, mut reader: BufReader<TcpStream>) -> Result<()> {
    drain_headers(&mut reader).await?;

    let body = debug::render(server.registry());
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: \
         {}\r\n\r\n{}",
        body.len(),
        body
    );
    reader.write_all(response.as_bytes()).await?;
    reader.flush().await?;
    reader.shutdown().await?;
    Ok(())
}

/// Drains the remaining header lines up to the blank line that terminates
/// the request, same as any HTTP/1.x request parser would.
async fn drain_headers(reader: &mut BufReader<TcpStream>) -> Result<()> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(())
}
