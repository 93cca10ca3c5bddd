// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable name constants for centralized management across the workspace
//!
//! ## Organization
//!
//! - **Logging**: Log level, configuration file and output format
//! - **Resources**: GPU memory arbitration settings
//! - **Owner**: Login-name variables used to tag shared memory segments

/// Logging and tracing environment variables
pub mod logging {
    /// Log level and filter directives (e.g., "debug", "mmserve_resources=trace")
    pub const MMSERVE_LOG: &str = "MMSERVE_LOG";

    /// Path to logging configuration file
    pub const MMSERVE_LOGGING_CONFIG_PATH: &str = "MMSERVE_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const MMSERVE_LOGGING_JSONL: &str = "MMSERVE_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const MMSERVE_DISABLE_ANSI_LOGGING: &str = "MMSERVE_DISABLE_ANSI_LOGGING";
}

/// GPU memory arbitration environment variables
///
/// All of these map onto `ResourceConfig` fields through the `MMSERVE_RESOURCES_` prefix.
pub mod resources {
    /// Prefix shared by every resource configuration variable
    pub const PREFIX: &str = "MMSERVE_RESOURCES_";

    /// CUDA device ordinal the manager budgets for
    pub const MMSERVE_RESOURCES_GPU_ID: &str = "MMSERVE_RESOURCES_GPU_ID";

    /// Fraction of physical device memory the serving stack may use, in (0, 1]
    pub const MMSERVE_RESOURCES_MEM_FRACTION: &str = "MMSERVE_RESOURCES_MEM_FRACTION";

    /// Owner tag embedded in shared memory segment names
    pub const MMSERVE_RESOURCES_OWNER_TAG: &str = "MMSERVE_RESOURCES_OWNER_TAG";

    /// Directory backing the POSIX shared memory namespace
    pub const MMSERVE_RESOURCES_SHM_DIR: &str = "MMSERVE_RESOURCES_SHM_DIR";

    /// Headroom reserve subtracted from every availability query, in bytes
    pub const MMSERVE_RESOURCES_SAFETY_MARGIN_BYTES: &str =
        "MMSERVE_RESOURCES_SAFETY_MARGIN_BYTES";

    /// Fixed per-model auxiliary pool reservation in pooled-worker mode, in GB
    pub const MMSERVE_RESOURCES_WORKER_POOL_MEMORY_GB: &str =
        "MMSERVE_RESOURCES_WORKER_POOL_MEMORY_GB";

    /// Pin the device's total memory instead of querying the driver
    pub const MMSERVE_RESOURCES_GPU_TOTAL_MEMORY_BYTES: &str =
        "MMSERVE_RESOURCES_GPU_TOTAL_MEMORY_BYTES";
}

/// Login name variables, checked in order
pub mod owner {
    pub const LOGNAME: &str = "LOGNAME";
    pub const USER: &str = "USER";
    pub const LNAME: &str = "LNAME";
    pub const USERNAME: &str = "USERNAME";

    /// Lookup order when no explicit owner tag is configured
    pub const LOOKUP_ORDER: [&str; 4] = [LOGNAME, USER, LNAME, USERNAME];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_names_share_prefix() {
        for name in [
            resources::MMSERVE_RESOURCES_GPU_ID,
            resources::MMSERVE_RESOURCES_MEM_FRACTION,
            resources::MMSERVE_RESOURCES_OWNER_TAG,
            resources::MMSERVE_RESOURCES_SHM_DIR,
            resources::MMSERVE_RESOURCES_SAFETY_MARGIN_BYTES,
            resources::MMSERVE_RESOURCES_WORKER_POOL_MEMORY_GB,
            resources::MMSERVE_RESOURCES_GPU_TOTAL_MEMORY_BYTES,
        ] {
            assert!(
                name.starts_with(resources::PREFIX),
                "{name} is missing the {} prefix",
                resources::PREFIX
            );
        }
    }
}
