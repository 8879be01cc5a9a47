// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub mod config;
pub mod logger;

use crate::utils::io::read_toml;
use config::Config;
use std::path::Path;

/// Reads the configuration at `path`, or the defaults when no path is given.
pub fn read_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            // Read from config file
            let toml = std::fs::read_to_string(path)?;
            // Parse and return the configuration file
            read_toml(&toml)
        }
        None => Ok(Config::default()),
    }
}
