// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::cli_shared::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

/// Installs the global subscriber: a console layer, plus an hourly rotated
/// file layer when [`LogConfig::log_dir`] is set. Keep the returned guard
/// alive for as long as file logs should be flushed.
pub fn setup_logger(config: &LogConfig) -> Option<WorkerGuard> {
    let mut guard = None;
    let mut layers: Vec<Box<dyn tracing_subscriber::layer::Layer<Registry> + Send + Sync>> =
        // console logger
        vec![Box::new(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_filter(get_env_filter(default_env_filter(config))),
        )];

    // file logger
    if let Some(log_dir) = &config.log_dir {
        let file_appender = tracing_appender::rolling::hourly(log_dir, "market-client.log");
        let (writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);
        layers.push(Box::new(
            tracing_subscriber::fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_filter(get_env_filter(default_env_filter(config))),
        ));
    }

    if let Err(e) = tracing_subscriber::registry().with(layers).try_init() {
        tracing::debug!("logger already installed: {e}");
    }
    guard
}

/// Returns an [`EnvFilter`] according to the `RUST_LOG` environment variable, or a default
/// - see [`default_env_filter`]
fn get_env_filter(def: EnvFilter) -> EnvFilter {
    use std::env::{
        self,
        VarError::{NotPresent, NotUnicode},
    };
    match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(s) => EnvFilter::new(s),
        Err(NotPresent) => def,
        Err(NotUnicode(_)) => EnvFilter::default(),
    }
}

fn default_env_filter(config: &LogConfig) -> EnvFilter {
    let mut directives = vec!["info".to_owned()];
    directives.extend(
        config
            .to_filter_string()
            .split(',')
            .filter(|d| !d.is_empty())
            .map(str::to_owned),
    );
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|e| {
        eprintln!("ignoring invalid log filters: {e}");
        EnvFilter::new("info")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli_shared::config::LogValue;

    #[test]
    fn test_default_env_filter() {
        let filter = default_env_filter(&LogConfig::default());
        assert!(filter.to_string().contains("info"));
    }

    #[test]
    fn invalid_filters_fall_back_to_info() {
        let config = LogConfig {
            filters: vec![LogValue::new("market_client", "loud")],
            ..Default::default()
        };
        assert_eq!(default_env_filter(&config).to_string(), "info");
    }

    #[test]
    fn file_logging_returns_a_guard() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            log_dir: Some(dir.path().to_owned()),
            ..Default::default()
        };
        assert!(setup_logger(&config).is_some());
        assert!(setup_logger(&LogConfig::default()).is_none());
    }
}
