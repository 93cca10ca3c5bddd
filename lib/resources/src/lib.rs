// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! GPU memory arbitration for serving several models on one device.
//!
//! The crate keeps two budgets per device:
//! - the KV cache memory left once the weights and fixed pools of the active models are
//!   reserved ([`ResourceManager::total_usable_kv_cache_memory_gb`])
//! - the headroom left after the live usage that workers publish through shared memory
//!   counters ([`ResourceManager::available_kv_cache_memory_bytes`])

pub mod capacity;
pub mod channel;
pub mod config;
pub mod manager;
pub mod profile;
pub mod usage;

mod error;

pub use capacity::{DeviceMemoryQuery, FixedDeviceMemory, GpuCapacity};
pub use channel::{ChannelName, ShmNamespace, UsageChannel};
pub use config::{ResourceConfig, ResourceConfigBuilder};
pub use error::{ResourceError, Result};
pub use manager::{MemorySnapshot, ResourceManager, ResourceManagerBuilder, ServingMode};
pub use profile::{
    ModelMemoryProfile, ModelMemoryUsage, ModelSizeResolver, WeightFileSizeResolver,
};
pub use usage::{PerModelUsage, UsageMode, UsageSource, WorkerPoolUsage};

#[cfg(feature = "cuda")]
pub use capacity::CudaDeviceMemory;

/// Bytes per GB. Every GB figure in this crate is a multiple of 2^30 bytes.
pub const GIB: u64 = 1 << 30;
