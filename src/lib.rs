// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cfg;
pub mod client;
pub mod codec;
pub mod error;
pub mod option;
pub mod registry;
pub mod server;

pub use error::{Result, RpcError};

use once_cell::sync::Lazy;

use crate::server::Server;

static DEFAULT_SERVER: Lazy<Server> = Lazy::new(Server::new);

/// The process-wide default server (mirrors `net/rpc`'s `DefaultServer`):
/// a single lazily-constructed [`Server`] that callers can register
/// services on without threading one through explicitly.
pub fn default_server() -> Server {
    DEFAULT_SERVER.clone()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::registry::ServiceBuilder;

    // `default_server()` hands back the same process-wide registry every
    // time, so registering a fixed service name must run serially across
    // tests or a second run sees `DuplicateService` from the first.
    #[test]
    #[serial]
    fn default_server_is_a_single_shared_instance() {
        let a = default_server();
        a.register(ServiceBuilder::new("DefaultServerProbe").build()).unwrap();

        let b = default_server();
        assert!(matches!(
            b.register(ServiceBuilder::new("DefaultServerProbe").build()),
            Err(RpcError::DuplicateService(_))
        ));
    }
}
