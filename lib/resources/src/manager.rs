// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Resource Manager
//!
//! Arbitrates one GPU's memory between the models loaded on it.
//!
//! ## Budgets
//! - **Usable KV cache memory** (GB): the reservation-adjusted device memory minus the fixed
//!   weights and pool reservations of every active model. Recomputed whenever the active
//!   set changes and cached, so reading it is O(1).
//! - **Available KV cache memory** (bytes): the usable budget minus the live usage published
//!   by the workers, minus a safety margin. Read fresh on every call and never clamped;
//!   a negative value tells the allocator to throttle.
//!
//! ## Concurrency
//! The active set and the budget derived from it sit behind one lock and are replaced
//! together. Usage sums copy the active set first and read the channels without holding
//! the lock.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use derive_builder::Builder;
use derive_getters::Getters;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::capacity::{DeviceMemoryQuery, FixedDeviceMemory, GpuCapacity};
use crate::channel::ShmNamespace;
use crate::config::ResourceConfig;
use crate::profile::{ModelMemoryProfile, ModelMemoryUsage, ModelSizeResolver};
use crate::usage::{PerModelUsage, UsageMode, UsageSource, WorkerPoolUsage};
use crate::{GIB, ResourceError, Result};

/// How the models on the device are served, which decides both where fixed reservations
/// come from and where live usage is read.
#[derive(Clone)]
pub enum ServingMode {
    /// One engine per model. Reservations are measured by the engines; each engine
    /// publishes its own usage counter.
    PerEngine {
        usage: HashMap<String, ModelMemoryUsage>,
    },

    /// A shared pool of workers serves every model. Reservations are estimated from the
    /// model weights on disk; each worker publishes a usage counter.
    PooledWorkers {
        model_paths: HashMap<String, PathBuf>,
        num_workers: u32,
        resolver: Arc<dyn ModelSizeResolver>,
    },
}

/// Point-in-time view of the device budget, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct MemorySnapshot {
    #[getter(copy)]
    device_id: u32,
    #[getter(copy)]
    usable_gpu_memory_gb: f64,
    #[getter(copy)]
    usable_kv_cache_memory_gb: f64,
    #[getter(copy)]
    used_kv_cache_memory_bytes: i64,
    #[getter(copy)]
    available_kv_cache_memory_bytes: i64,
    active_models: Vec<String>,
}

#[derive(Debug, Clone)]
struct ActiveState {
    models: BTreeSet<Arc<str>>,
    usable_kv_cache_memory_gb: f64,
}

/// Inputs for [`ResourceManager`], assembled through [`ResourceManagerBuilder`].
#[derive(Builder)]
#[builder(
    name = "ResourceManagerBuilder",
    pattern = "owned",
    build_fn(private, name = "build_args")
)]
pub struct ResourceManagerArgs {
    config: ResourceConfig,

    mode: ServingMode,

    /// Device memory source. When unset, `config.gpu_total_memory_bytes` is used, and
    /// failing that the CUDA driver (with the `cuda` feature).
    #[builder(default, setter(strip_option))]
    device: Option<Arc<dyn DeviceMemoryQuery>>,

    #[builder(default, setter(custom))]
    active_models: BTreeSet<String>,

    /// Per-token KV cell size of each model, in bytes
    #[builder(default)]
    cell_sizes: HashMap<String, usize>,
}

impl ResourceManagerBuilder {
    /// Models active from the start.
    pub fn active_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    /// Build the manager: query the device, build the profile and open the usage source.
    pub fn build(self) -> Result<ResourceManager> {
        let args = self
            .build_args()
            .map_err(|e| ResourceError::Config(e.to_string()))?;
        ResourceManager::from_args(args)
    }
}

/// Tracks the active models on one GPU and the KV cache memory left for them.
#[derive(Debug)]
pub struct ResourceManager {
    capacity: GpuCapacity,
    profile: ModelMemoryProfile,
    usage: Box<dyn UsageSource>,
    safety_margin_bytes: i64,
    state: RwLock<ActiveState>,
}

impl ResourceManager {
    pub fn builder() -> ResourceManagerBuilder {
        ResourceManagerBuilder::default()
    }

    fn from_args(args: ResourceManagerArgs) -> Result<Self> {
        let ResourceManagerArgs {
            config,
            mode,
            device,
            active_models,
            cell_sizes,
        } = args;

        validator::Validate::validate(&config)?;

        let device = resolve_device(&config, device)?;
        let capacity = GpuCapacity::query(device.as_ref(), config.gpu_id, config.mem_fraction)?;
        let owner = config.owner()?;
        let ns = ShmNamespace::new(&config.shm_dir);

        let (profile, num_workers) = match &mode {
            ServingMode::PerEngine { usage } => {
                (ModelMemoryProfile::per_engine(usage.clone())?, None)
            }
            ServingMode::PooledWorkers {
                model_paths,
                num_workers,
                resolver,
            } => (
                ModelMemoryProfile::pooled(
                    model_paths,
                    config.worker_pool_memory_gb,
                    resolver.as_ref(),
                )?,
                Some(*num_workers),
            ),
        };
        let profile = profile.with_cell_sizes(cell_sizes);

        if let Some(model) = active_models.iter().find(|m| !profile.contains(m)) {
            return Err(ResourceError::MissingProfile {
                model: model.clone(),
            });
        }

        let usage: Box<dyn UsageSource> = match num_workers {
            Some(num_workers) => Box::new(WorkerPoolUsage::open(
                &ns,
                config.gpu_id,
                num_workers,
                &owner,
            )?),
            None => Box::new(PerModelUsage::new(ns, config.gpu_id, owner)),
        };

        let models: BTreeSet<Arc<str>> = active_models
            .iter()
            .map(|m| Arc::from(m.as_str()))
            .collect();
        let usable_kv_cache_memory_gb = usable_kv_cache_memory_gb(&capacity, &profile, &models)?;

        tracing::info!(
            device_id = config.gpu_id,
            mode = ?usage.mode(),
            models = profile.len(),
            active = models.len(),
            usable_gpu_memory_gb = capacity.total_usable_memory_gb(),
            usable_kv_cache_memory_gb,
            "resource manager initialized"
        );

        Ok(Self {
            capacity,
            profile,
            usage,
            safety_margin_bytes: config.safety_margin_bytes,
            state: RwLock::new(ActiveState {
                models,
                usable_kv_cache_memory_gb,
            }),
        })
    }

    pub fn mode(&self) -> UsageMode {
        self.usage.mode()
    }

    pub fn capacity(&self) -> &GpuCapacity {
        &self.capacity
    }

    pub fn profile(&self) -> &ModelMemoryProfile {
        &self.profile
    }

    /// KV cache budget left after the fixed reservations of the active models, in GB.
    pub fn total_usable_kv_cache_memory_gb(&self) -> f64 {
        self.state.read().usable_kv_cache_memory_gb
    }

    /// Live KV cache usage across all workers, in bytes.
    pub fn total_used_kv_cache_memory_bytes(&self) -> i64 {
        let snapshot = self.active_snapshot();
        self.usage.total_used_bytes(&snapshot)
    }

    /// KV cache memory still available after live usage and the safety margin, in bytes.
    /// May be negative.
    pub fn available_kv_cache_memory_bytes(&self) -> i64 {
        let usable = self.total_usable_kv_cache_memory_gb();
        let used = self.total_used_kv_cache_memory_bytes();
        self.available_bytes(usable, used)
    }

    /// Per-token KV cell size of `model`, in bytes.
    pub fn model_cell_size(&self, model: &str) -> Result<usize> {
        self.profile.cell_size(model)
    }

    /// Mark `model` active and charge its fixed reservation. Activating an active model
    /// changes nothing.
    pub fn activate_model(&self, model: &str) -> Result<()> {
        self.profile.usage(model)?;

        let mut state = self.state.write();
        let mut models = state.models.clone();
        let inserted = models.insert(Arc::from(model));
        let usable = usable_kv_cache_memory_gb(&self.capacity, &self.profile, &models)?;
        *state = ActiveState {
            models,
            usable_kv_cache_memory_gb: usable,
        };
        drop(state);

        if inserted {
            tracing::info!(model, usable_kv_cache_memory_gb = usable, "activated model");
        } else {
            tracing::debug!(model, "model already active");
        }
        Ok(())
    }

    /// Mark `model` inactive and release its fixed reservation.
    pub fn deactivate_model(&self, model: &str) -> Result<()> {
        self.profile.usage(model)?;

        let mut state = self.state.write();
        if !state.models.contains(model) {
            return Err(ResourceError::NotActive {
                model: model.to_string(),
            });
        }
        let mut models = state.models.clone();
        models.remove(model);
        let usable = usable_kv_cache_memory_gb(&self.capacity, &self.profile, &models)?;
        *state = ActiveState {
            models,
            usable_kv_cache_memory_gb: usable,
        };
        drop(state);

        tracing::info!(model, usable_kv_cache_memory_gb = usable, "deactivated model");
        Ok(())
    }

    pub fn is_active(&self, model: &str) -> bool {
        self.state.read().models.contains(model)
    }

    /// Sorted copy of the active set.
    pub fn active_models(&self) -> Vec<String> {
        self.state
            .read()
            .models
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    /// Budget, usage and headroom captured together.
    pub fn memory_snapshot(&self) -> MemorySnapshot {
        let (models, usable) = {
            let state = self.state.read();
            (
                state.models.iter().cloned().collect::<Vec<_>>(),
                state.usable_kv_cache_memory_gb,
            )
        };
        let used = self.usage.total_used_bytes(&models);

        let snapshot = MemorySnapshot {
            device_id: self.capacity.device_id(),
            usable_gpu_memory_gb: self.capacity.total_usable_memory_gb(),
            usable_kv_cache_memory_gb: usable,
            used_kv_cache_memory_bytes: used,
            available_kv_cache_memory_bytes: self.available_bytes(usable, used),
            active_models: models.iter().map(|m| m.to_string()).collect(),
        };
        tracing::debug!(?snapshot, "memory snapshot");
        snapshot
    }

    fn active_snapshot(&self) -> Vec<Arc<str>> {
        self.state.read().models.iter().cloned().collect()
    }

    fn available_bytes(&self, usable_gb: f64, used_bytes: i64) -> i64 {
        let usable_bytes = (usable_gb * GIB as f64) as i64;
        usable_bytes
            .saturating_sub(used_bytes)
            .saturating_sub(self.safety_margin_bytes)
    }
}

fn resolve_device(
    config: &ResourceConfig,
    device: Option<Arc<dyn DeviceMemoryQuery>>,
) -> Result<Arc<dyn DeviceMemoryQuery>> {
    if let Some(total_bytes) = config.gpu_total_memory_bytes {
        return Ok(Arc::new(FixedDeviceMemory::new(config.gpu_id, total_bytes)));
    }
    if let Some(device) = device {
        return Ok(device);
    }

    #[cfg(feature = "cuda")]
    {
        Ok(Arc::new(crate::capacity::CudaDeviceMemory))
    }

    #[cfg(not(feature = "cuda"))]
    {
        Err(ResourceError::DeviceQuery {
            device_id: config.gpu_id,
            message: "no device memory source: set gpu_total_memory_bytes or enable the cuda feature"
                .to_string(),
        })
    }
}

fn usable_kv_cache_memory_gb(
    capacity: &GpuCapacity,
    profile: &ModelMemoryProfile,
    models: &BTreeSet<Arc<str>>,
) -> Result<f64> {
    let reserved: f64 = models
        .iter()
        .map(|m| profile.usage(m).map(ModelMemoryUsage::reserved_gb))
        .sum::<Result<f64>>()?;
    Ok(capacity.total_usable_memory_gb() - reserved)
}
