// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The core's own typed error kinds (§7 of the spec).
//!
//! `Header.error` on the wire is always the [`Display`](std::fmt::Display)
//! of one of these variants, or a handler's own error message forwarded
//! unchanged. This crate never invents a cross-network error taxonomy
//! beyond that: callers that need structure should match on
//! [`RpcError`] locally; only the byte-rendered error text crosses the
//! connection.

use thiserror::Error;

/// A single opaque-to-the-wire error kind covering every failure mode the
/// core can produce.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("connection closed by peer")]
    Eof,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("can't find service: {0}")]
    ServiceNotFound(String),

    #[error("can't find method: {0}")]
    MethodNotFound(String),

    #[error("ill-formed service method: {0}")]
    IllFormedServiceMethod(String),

    #[error("duplicate service: {0}")]
    DuplicateService(String),

    #[error("read body: {0}")]
    Decode(String),

    #[error("{0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    #[error("request handle timeout: expected within {0:?}")]
    Timeout(std::time::Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("connection is shutting down")]
    Shutdown,

    #[error("dial timeout after {0:?}")]
    DialTimeout(std::time::Duration),
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RpcError::Eof
        } else {
            RpcError::Transport(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
