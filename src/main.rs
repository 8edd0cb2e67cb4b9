// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use mrpc_core::{
    cfg::{cli::resolve_config_path, config::ServerConfig, logger::init_logger},
    registry::ServiceBuilder,
    server::{connect::DEFAULT_CONNECT_PATH, frontend::Server},
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SumArgs {
    num1: i64,
    num2: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path("demos/config.server.yaml")
        .and_then(ServerConfig::load_from_file)
        .context("failed to resolve or load server config")?;

    let foo = ServiceBuilder::new("Foo")
        .method("Sum", |args: SumArgs, reply: &mut i64| async move {
            *reply = args.num1 + args.num2;
            Ok(())
        })
        .build();

    let server = Server::new();
    server.register(foo).context("registering Foo service")?;

    info!(address = %cfg.address, "mrpc demo server starting");
    server
        .serve_http(&cfg.address, DEFAULT_CONNECT_PATH)
        .await
        .context("server loop exited")?;

    Ok(())
}
