// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use mmserve_runtime::config::environment_names::{owner as env_owner, resources as env_resources};
use mmserve_runtime::config::first_non_empty_env;

use crate::channel::DEFAULT_SHM_DIR;
use crate::{GIB, ResourceError, Result};

/// Default share of device memory available to the serving stack
pub const DEFAULT_MEM_FRACTION: f64 = 0.9;

/// Default headroom reserve subtracted from every availability query (1 GiB)
pub const DEFAULT_SAFETY_MARGIN_BYTES: i64 = GIB as i64;

/// Default per-model auxiliary pool reservation for pooled workers, in GB
pub const DEFAULT_WORKER_POOL_MEMORY_GB: f64 = 0.25;

/// System-wide resource configuration file
const SYSTEM_CONFIG_PATH: &str = "/opt/mmserve/etc/resources.toml";

/// GPU memory arbitration settings
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone, PartialEq)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug))]
pub struct ResourceConfig {
    /// CUDA device ordinal being budgeted
    /// Set this at runtime with environment variable MMSERVE_RESOURCES_GPU_ID
    #[builder(default = "0")]
    pub gpu_id: u32,

    /// Fraction of the device's physical memory the serving stack may use, in (0, 1]
    /// Set this at runtime with environment variable MMSERVE_RESOURCES_MEM_FRACTION
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    #[builder(default = "DEFAULT_MEM_FRACTION")]
    pub mem_fraction: f64,

    /// Owner tag embedded in usage segment names. Defaults to the login name.
    /// Set this at runtime with environment variable MMSERVE_RESOURCES_OWNER_TAG
    #[builder(default, setter(into, strip_option))]
    pub owner_tag: Option<String>,

    /// Directory backing the shared memory namespace
    /// Set this at runtime with environment variable MMSERVE_RESOURCES_SHM_DIR
    #[builder(default = "PathBuf::from(DEFAULT_SHM_DIR)", setter(into))]
    pub shm_dir: PathBuf,

    /// Headroom reserve subtracted from every availability query, in bytes
    /// Set this at runtime with environment variable MMSERVE_RESOURCES_SAFETY_MARGIN_BYTES
    #[validate(range(min = 0))]
    #[builder(default = "DEFAULT_SAFETY_MARGIN_BYTES")]
    pub safety_margin_bytes: i64,

    /// Fixed auxiliary pool reservation per model when serving from a worker pool, in GB
    /// Set this at runtime with environment variable MMSERVE_RESOURCES_WORKER_POOL_MEMORY_GB
    #[validate(range(min = 0.0))]
    #[builder(default = "DEFAULT_WORKER_POOL_MEMORY_GB")]
    pub worker_pool_memory_gb: f64,

    /// Pins the device's total memory instead of querying the driver
    /// Set this at runtime with environment variable MMSERVE_RESOURCES_GPU_TOTAL_MEMORY_BYTES
    #[validate(range(min = 1))]
    #[builder(default, setter(strip_option))]
    pub gpu_total_memory_bytes: Option<u64>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        ResourceConfig {
            gpu_id: 0,
            mem_fraction: DEFAULT_MEM_FRACTION,
            owner_tag: None,
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            safety_margin_bytes: DEFAULT_SAFETY_MARGIN_BYTES,
            worker_pool_memory_gb: DEFAULT_WORKER_POOL_MEMORY_GB,
            gpu_total_memory_bytes: None,
        }
    }
}

impl ResourceConfig {
    pub fn builder() -> ResourceConfigBuilder {
        ResourceConfigBuilder::default()
    }

    pub(crate) fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(ResourceConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Env::prefixed(env_resources::PREFIX).filter_map(|k| {
                let full_key = format!("{}{}", env_resources::PREFIX, k.as_str());
                // filters out empty environment variables
                match std::env::var(&full_key) {
                    Ok(v) if !v.is_empty() => Some(k.into()),
                    _ => None,
                }
            }))
    }

    /// Load the resource configuration from the environment and configuration files
    /// Configuration is prioritized in the following order, where the last has the lowest priority:
    /// 1. Environment variables prefixed with `MMSERVE_RESOURCES_`
    /// 2. /opt/mmserve/etc/resources.toml
    /// 3. Built-in defaults
    pub fn from_settings() -> Result<ResourceConfig> {
        let config: ResourceConfig = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Owner tag used to address usage segments.
    ///
    /// The configured tag wins; otherwise the login name is read from `LOGNAME`, `USER`,
    /// `LNAME` or `USERNAME`, in that order.
    pub fn owner(&self) -> Result<String> {
        let owner = match self.owner_tag.as_deref().filter(|tag| !tag.is_empty()) {
            Some(tag) => tag.to_string(),
            None => first_non_empty_env(&env_owner::LOOKUP_ORDER).ok_or_else(|| {
                ResourceError::Config(
                    "unable to determine owner tag: set owner_tag or one of LOGNAME, USER, LNAME, USERNAME"
                        .to_string(),
                )
            })?,
        };

        if owner.contains('/') {
            return Err(ResourceError::Config(format!(
                "owner tag '{owner}' must not contain '/'"
            )));
        }
        Ok(owner)
    }
}

impl ResourceConfigBuilder {
    /// Build and validate the resource configuration
    pub fn build(&self) -> Result<ResourceConfig> {
        let config = self
            .build_internal()
            .map_err(|e| ResourceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
