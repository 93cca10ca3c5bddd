// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for processes embedding the mmserve crates.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `MMSERVE_LOGGING_CONFIG_PATH` environment variable.
//!   3. `/opt/mmserve/etc/logging.toml`.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `MMSERVE_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters can be configured using the `MMSERVE_LOG` environment variable or by setting the
//! `log_filters` key in the TOML configuration file. The default log level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "mmserve_resources" = "debug"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::Directive, fmt};

use crate::config::environment_names::logging as env_logging;
use crate::config::{disable_ansi_logging, jsonl_logging_enabled};

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// System-wide logging configuration file
const SYSTEM_LOGGING_CONFIG_PATH: &str = "/opt/mmserve/etc/logging.toml";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// Safe to call more than once; only the first call has an effect. If another subscriber
/// has already been installed by the host process, the error is reported on stderr and the
/// existing subscriber is kept.
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = setup_logging() {
            eprintln!("Failed to initialize logging: {}", e);
        }
    });
}

fn setup_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter_layer = filters(load_config()?);

    if jsonl_logging_enabled() {
        let l = fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()?;
    } else {
        let l = fmt::layer()
            .compact()
            .with_ansi(!disable_ansi_logging())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()?;
    }

    Ok(())
}

fn load_config() -> Result<LoggingConfig, figment::Error> {
    let config_path =
        std::env::var(env_logging::MMSERVE_LOGGING_CONFIG_PATH).unwrap_or_else(|_| "".to_string());
    Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(SYSTEM_LOGGING_CONFIG_PATH))
        .merge(Toml::file(config_path))
        .extract()
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed parsing log level '{}': {e}; falling back to {DEFAULT_FILTER_LEVEL}",
                config.log_level
            );
            LevelFilter::INFO.into()
        });

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(env_logging::MMSERVE_LOG)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_defaults() {
        temp_env::with_vars(
            vec![(env_logging::MMSERVE_LOGGING_CONFIG_PATH, None::<&str>)],
            || {
                let config = load_config().unwrap();
                assert_eq!(config.log_level, DEFAULT_FILTER_LEVEL);
                assert!(config.log_filters.is_empty());
            },
        );
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "log_level = \"warn\"\n\n[log_filters]\n\"mmserve_resources\" = \"trace\""
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        temp_env::with_vars(
            vec![(env_logging::MMSERVE_LOGGING_CONFIG_PATH, Some(path.as_str()))],
            || {
                let config = load_config().unwrap();
                assert_eq!(config.log_level, "warn");
                assert_eq!(
                    config.log_filters.get("mmserve_resources").map(String::as_str),
                    Some("trace")
                );
            },
        );
    }

    #[test]
    fn test_filters_include_module_directives() {
        temp_env::with_vars(vec![(env_logging::MMSERVE_LOG, None::<&str>)], || {
            let config = LoggingConfig {
                log_level: "error".to_string(),
                log_filters: HashMap::from([(
                    "mmserve_resources".to_string(),
                    "debug".to_string(),
                )]),
            };
            let rendered = filters(config).to_string();
            assert!(rendered.contains("mmserve_resources=debug"), "{rendered}");
            assert!(rendered.contains("error"), "{rendered}");
        });
    }

    #[test]
    fn test_filters_survive_bad_level() {
        temp_env::with_vars(vec![(env_logging::MMSERVE_LOG, None::<&str>)], || {
            let config = LoggingConfig {
                log_level: "mmserve=loud".to_string(),
                log_filters: HashMap::new(),
            };
            let rendered = filters(config).to_string();
            assert!(rendered.contains("info"), "{rendered}");
        });
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!("logging initialized");
    }
}
