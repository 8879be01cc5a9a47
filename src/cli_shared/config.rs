// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::unixfs::BuilderOptions;
use crate::utils::cid::{DEFAULT_INLINE_LIMIT, InlineCidBuilder};
use crate::utils::multihash::prelude::*;
use fvm_shared4::clock::ChainEpoch;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::path::PathBuf;
use std::time::Duration;

const EPOCH_DURATION_SECONDS: ChainEpoch = 30;
const EPOCHS_PER_DAY: ChainEpoch = 24 * 60 * 60 / EPOCH_DURATION_SECONDS;

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct LogConfig {
    /// Hourly rotated log files are written here when set.
    pub log_dir: Option<PathBuf>,
    pub filters: Vec<LogValue>,
}

impl LogConfig {
    pub(in crate::cli_shared) fn to_filter_string(&self) -> String {
        self.filters
            .iter()
            .map(|f| format!("{}={}", f.module, f.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            filters: vec![
                LogValue::new("libp2p_swarm", "warn"),
                LogValue::new("libp2p_tcp", "error"),
                LogValue::new("market_client::db", "info"),
            ],
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Debug, Clone)]
pub struct LogValue {
    pub module: String,
    /// One of `off`, `error`, `warn`, `info`, `debug`, `trace`.
    pub level: String,
}

impl LogValue {
    pub fn new(module: &str, level: &str) -> Self {
        Self {
            module: module.to_string(),
            level: level.to_string(),
        }
    }
}

/// Local directories used by the client.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, SmartDefault)]
#[serde(default)]
pub struct ClientConfig {
    #[default(PathBuf::from(".market-client"))]
    pub repo_dir: PathBuf,
    /// Defaults to `<repo_dir>/imports`.
    pub imports_dir: Option<PathBuf>,
    /// Defaults to `<repo_dir>/retrievals`.
    pub retrievals_dir: Option<PathBuf>,
    /// Wallet address deals are made from when none is given, e.g. `f01234`.
    pub default_market_address: Option<String>,
}

impl ClientConfig {
    pub fn imports_dir(&self) -> PathBuf {
        self.imports_dir
            .clone()
            .unwrap_or_else(|| self.repo_dir.join("imports"))
    }

    pub fn retrievals_dir(&self) -> PathBuf {
        self.retrievals_dir
            .clone()
            .unwrap_or_else(|| self.repo_dir.join("retrievals"))
    }
}

/// How files are chunked into UnixFS DAGs. Leaves are always raw blocks.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, SmartDefault)]
#[serde(default)]
pub struct ImportConfig {
    #[default(1024 * 1024)]
    pub chunk_size: usize,
    #[default(1024)]
    pub max_links: usize,
    /// Blocks up to this size are stored inside their CID. Capped at 64.
    #[default(DEFAULT_INLINE_LIMIT)]
    pub inline_limit: usize,
}

impl ImportConfig {
    pub fn builder_options(&self) -> BuilderOptions {
        BuilderOptions {
            chunk_size: self.chunk_size.max(1),
            max_links: self.max_links.max(2),
            cid_builder: InlineCidBuilder::new(MultihashCode::Blake2b256, self.inline_limit),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, SmartDefault)]
#[serde(default)]
pub struct DealConfig {
    /// Distance from the chain head to the start of a deal whose start
    /// epoch was left unset.
    #[default(8 * EPOCHS_PER_DAY)]
    pub default_start_offset_epochs: ChainEpoch,
    #[default(180 * EPOCHS_PER_DAY)]
    pub min_deal_duration: ChainEpoch,
    #[default(540 * EPOCHS_PER_DAY)]
    pub max_deal_duration: ChainEpoch,
    #[default(60)]
    pub handshake_timeout_secs: u64,
}

impl DealConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, SmartDefault)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Progress events buffered for a slow consumer before the orchestrator
    /// waits.
    #[default(16)]
    pub event_buffer: usize,
    #[default(1 << 20)]
    pub default_payment_interval: u64,
    #[default(1 << 20)]
    pub default_payment_interval_increase: u64,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Default, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub import: ImportConfig,
    pub deal: DealConfig,
    pub retrieval: RetrievalConfig,
    pub log: LogConfig,
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::Arbitrary;
    use quickcheck_macros::quickcheck;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Debug)]
    struct ArbitraryConfig(Config);

    impl Arbitrary for ArbitraryConfig {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            ArbitraryConfig(Config {
                client: ClientConfig {
                    repo_dir: PathBuf::arbitrary(g),
                    imports_dir: Option::arbitrary(g),
                    retrievals_dir: Option::arbitrary(g),
                    default_market_address: Option::arbitrary(g),
                },
                import: ImportConfig {
                    chunk_size: u32::arbitrary(g) as usize,
                    max_links: usize::from(u16::arbitrary(g)),
                    inline_limit: usize::from(u8::arbitrary(g)),
                },
                deal: DealConfig {
                    default_start_offset_epochs: i32::arbitrary(g).into(),
                    min_deal_duration: i32::arbitrary(g).into(),
                    max_deal_duration: i32::arbitrary(g).into(),
                    handshake_timeout_secs: u32::arbitrary(g).into(),
                },
                retrieval: RetrievalConfig {
                    event_buffer: usize::from(u16::arbitrary(g)),
                    default_payment_interval: u32::arbitrary(g).into(),
                    default_payment_interval_increase: u32::arbitrary(g).into(),
                },
                log: LogConfig::default(),
            })
        }
    }

    #[quickcheck]
    fn test_config_all_params_under_section(config: ArbitraryConfig) {
        let serialized_config =
            toml::to_string(&config.0).expect("could not serialize the configuration");
        assert_eq!(
            serialized_config
                .trim_start()
                .chars()
                .next()
                .expect("configuration empty"),
            '['
        );
        let back: Config = toml::from_str(&serialized_config).unwrap();
        assert_eq!(back, config.0);
    }

    #[test]
    fn test_default_log_filters() {
        let config = LogConfig::default();
        EnvFilter::builder()
            .parse(config.to_filter_string())
            .unwrap();
    }

    #[test]
    fn default_deal_start_is_eight_days() {
        assert_eq!(DealConfig::default().default_start_offset_epochs, 23040);
    }

    #[test]
    fn directories_default_under_repo() {
        let client = ClientConfig::default();
        assert_eq!(client.imports_dir(), PathBuf::from(".market-client/imports"));
        assert_eq!(
            client.retrievals_dir(),
            PathBuf::from(".market-client/retrievals")
        );
    }

    #[test]
    fn inline_limit_is_capped() {
        let opts = ImportConfig {
            inline_limit: 1000,
            ..Default::default()
        };
        assert_eq!(opts.builder_options().cid_builder.inline_limit, 64);
    }
}
