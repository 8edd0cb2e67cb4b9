// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed configuration for the demo server/client binaries (§1's "ambient
//! stack" — the core library itself is configured purely by its Rust API;
//! YAML loading only exists for the two `src/bin` entry points).

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(rename = "Address")]
    pub address: String,

    #[serde(rename = "CodecType", default = "default_codec_type")]
    pub codec_type: String,

    #[serde(rename = "HandleTimeout", default, with = "serde_secs")]
    pub handle_timeout: Duration,

    #[serde(rename = "ConnectPath", default = "default_connect_path")]
    pub connect_path: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(rename = "Address")]
    pub address: String,

    #[serde(rename = "CodecType", default = "default_codec_type")]
    pub codec_type: String,

    #[serde(rename = "ConnectTimeout", default, with = "serde_secs")]
    pub connect_timeout: Duration,

    #[serde(rename = "HandleTimeout", default, with = "serde_secs")]
    pub handle_timeout: Duration,
}

fn default_codec_type() -> String {
    crate::codec::gob::CODEC_TYPE.to_string()
}

fn default_connect_path() -> String {
    crate::server::connect::DEFAULT_CONNECT_PATH.to_string()
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Self = serde_yaml::from_str(&s).context("failed to parse server config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.address.is_empty(), "Address must not be empty");
        Ok(())
    }
}

impl ClientConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Self = serde_yaml::from_str(&s).context("failed to parse client config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.address.is_empty(), "Address must not be empty");
        Ok(())
    }
}

/// Serde helper representing a `Duration` as a number of seconds, zero
/// meaning unbounded — matches `crate::option::OptionRecord`'s own
/// zero-means-unbounded convention.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
