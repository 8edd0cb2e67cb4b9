// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use mrpc_core::{
    cfg::{cli::resolve_config_path, config::ClientConfig, logger::init_logger},
    client::dial,
    codec::CodecRegistry,
    option::OptionRecord,
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

    let cfg = resolve_config_path("demos/config.client.yaml")
        .and_then(ClientConfig::load_from_file)
        .context("failed to resolve or load client config")?;

    let opt = OptionRecord::new(cfg.codec_type.clone(), cfg.connect_timeout, cfg.handle_timeout);
    let client = dial(&cfg.address, &CodecRegistry::new(), opt)
        .await
        .context("dial failed")?;

    let reply: i64 = client
        .call("Foo.Sum", &SumArgs { num1: 3, num2: 4 })
        .await
        .context("Foo.Sum call failed")?;
    info!(reply, "Foo.Sum(3, 4)");
    assert_eq!(reply, 7);

    client.close().await.context("close failed")?;
    Ok(())
}
