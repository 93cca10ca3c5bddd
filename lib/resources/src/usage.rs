// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Usage Sources
//!
//! Live KV cache usage is summed from the shared memory counters of whichever processes
//! hold the cache. Two deployments exist:
//!
//! ### Worker pool
//! A fixed pool of workers serves every model. One counter per worker; all of them must
//! exist before the manager starts, so they are opened eagerly and a missing one is fatal.
//!
//! ### Per model
//! Each model runs its own engine that publishes a counter once it is up. Counters are
//! opened on first read. A counter that is not there yet contributes zero and is looked
//! for again on the next read.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::channel::{ChannelName, ShmNamespace, UsageChannel};

/// Which kind of usage source a manager reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMode {
    WorkerPool,
    PerModel,
}

/// Sums live KV cache usage across the processes sharing a device.
pub trait UsageSource: Send + Sync + fmt::Debug {
    fn mode(&self) -> UsageMode;

    /// Total bytes in use.
    ///
    /// `active_models` is a point-in-time copy of the active set; sources that are not
    /// keyed by model ignore it.
    fn total_used_bytes(&self, active_models: &[Arc<str>]) -> i64;
}

/// Counters of a fixed worker pool, opened at construction.
#[derive(Debug)]
pub struct WorkerPoolUsage {
    channels: Vec<UsageChannel>,
}

impl WorkerPoolUsage {
    /// Open the counters of workers `0..num_workers`.
    pub fn open(ns: &ShmNamespace, device_id: u32, num_workers: u32, owner: &str) -> Result<Self> {
        let channels = (0..num_workers)
            .map(|worker_id| ns.open(&ChannelName::worker(device_id, worker_id, owner)))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(device_id, num_workers, "opened worker pool usage channels");
        Ok(Self { channels })
    }

    pub fn num_workers(&self) -> usize {
        self.channels.len()
    }
}

impl UsageSource for WorkerPoolUsage {
    fn mode(&self) -> UsageMode {
        UsageMode::WorkerPool
    }

    fn total_used_bytes(&self, _active_models: &[Arc<str>]) -> i64 {
        self.channels
            .iter()
            .map(UsageChannel::read)
            .fold(0i64, i64::saturating_add)
    }
}

/// Counters of per-model engines, opened lazily.
#[derive(Debug)]
pub struct PerModelUsage {
    ns: ShmNamespace,
    device_id: u32,
    owner: String,
    channels: DashMap<String, Arc<UsageChannel>>,

    /// Models whose missing segment has already been reported at warn level
    reported_missing: DashSet<String>,
}

impl PerModelUsage {
    pub fn new(ns: ShmNamespace, device_id: u32, owner: impl Into<String>) -> Self {
        Self {
            ns,
            device_id,
            owner: owner.into(),
            channels: DashMap::new(),
            reported_missing: DashSet::new(),
        }
    }

    /// Bytes in use by `model`, or zero if its counter is not published yet.
    pub fn used_bytes(&self, model: &str) -> i64 {
        self.channel(model).map_or(0, |channel| channel.read())
    }

    /// Number of counters opened so far.
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    fn channel(&self, model: &str) -> Option<Arc<UsageChannel>> {
        let cached = self.channels.get(model).map(|c| Arc::clone(c.value()));
        if cached.is_some() {
            return cached;
        }

        // the vacant entry holds the shard lock, so racing first reads open the segment once
        match self.channels.entry(model.to_string()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let name = ChannelName::model(self.device_id, model, self.owner.as_str());
                match self.ns.open(&name) {
                    Ok(channel) => {
                        self.reported_missing.remove(model);
                        Some(Arc::clone(entry.insert(Arc::new(channel)).value()))
                    }
                    Err(e) => {
                        if self.reported_missing.insert(model.to_string()) {
                            tracing::warn!(
                                model,
                                channel = %name,
                                "usage channel unavailable, assuming no KV cache in use: {e}"
                            );
                        } else {
                            tracing::debug!(model, channel = %name, "usage channel still unavailable: {e}");
                        }
                        None
                    }
                }
            }
        }
    }
}

impl UsageSource for PerModelUsage {
    fn mode(&self) -> UsageMode {
        UsageMode::PerModel
    }

    fn total_used_bytes(&self, active_models: &[Arc<str>]) -> i64 {
        active_models
            .iter()
            .map(|model| self.used_bytes(model))
            .fold(0i64, i64::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::COUNTER_BYTES;
    use crate::ResourceError;
    use std::path::Path;
    use tempfile::TempDir;

    fn publish(ns: &ShmNamespace, name: &ChannelName, value: i64) {
        write_counter(&ns.segment_path(name), value);
    }

    fn write_counter(path: &Path, value: i64) {
        let mut bytes = value.to_ne_bytes().to_vec();
        bytes.resize(COUNTER_BYTES, 0);
        std::fs::write(path, bytes).unwrap();
    }

    fn models(names: &[&str]) -> Vec<Arc<str>> {
        names.iter().map(|n| Arc::from(*n)).collect()
    }

    #[test]
    fn test_worker_pool_sums_all_workers() {
        let dir = TempDir::new().unwrap();
        let ns = ShmNamespace::new(dir.path());
        for (worker_id, used) in [(0, 100), (1, 250), (2, 0)] {
            publish(&ns, &ChannelName::worker(0, worker_id, "alice"), used);
        }

        let usage = WorkerPoolUsage::open(&ns, 0, 3, "alice").unwrap();
        assert_eq!(usage.mode(), UsageMode::WorkerPool);
        assert_eq!(usage.num_workers(), 3);
        assert_eq!(usage.total_used_bytes(&[]), 350);
        assert_eq!(usage.total_used_bytes(&models(&["ignored"])), 350);
    }

    #[test]
    fn test_worker_pool_missing_worker_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ns = ShmNamespace::new(dir.path());
        publish(&ns, &ChannelName::worker(0, 0, "alice"), 1);

        let err = WorkerPoolUsage::open(&ns, 0, 2, "alice").unwrap_err();
        assert!(matches!(&err, ResourceError::ChannelOpen { name, .. } if name == "ipc_0_1_alice"));
        assert!(err.is_missing_segment());
    }

    #[test]
    fn test_per_model_missing_channel_reads_zero_then_recovers() {
        let dir = TempDir::new().unwrap();
        let ns = ShmNamespace::new(dir.path());
        let usage = PerModelUsage::new(ns.clone(), 0, "alice");

        assert_eq!(usage.used_bytes("llama"), 0);
        assert!(usage.reported_missing.contains("llama"));
        // later misses are already reported and are not re-armed
        assert!(!usage.reported_missing.insert("llama".to_string()));
        assert_eq!(usage.used_bytes("llama"), 0);
        assert_eq!(usage.reported_missing.len(), 1);
        assert_eq!(usage.open_channels(), 0);

        publish(&ns, &ChannelName::model(0, "llama", "alice"), 4096);
        assert_eq!(usage.used_bytes("llama"), 4096);
        assert_eq!(usage.open_channels(), 1);
        assert!(usage.reported_missing.is_empty());
    }

    #[test]
    fn test_per_model_sums_only_snapshot() {
        let dir = TempDir::new().unwrap();
        let ns = ShmNamespace::new(dir.path());
        publish(&ns, &ChannelName::model(0, "llama", "alice"), 10);
        publish(&ns, &ChannelName::model(0, "qwen", "alice"), 20);
        publish(&ns, &ChannelName::model(0, "mistral", "alice"), 40);

        let usage = PerModelUsage::new(ns, 0, "alice");
        assert_eq!(usage.mode(), UsageMode::PerModel);
        assert_eq!(usage.total_used_bytes(&models(&["llama", "qwen"])), 30);
        assert_eq!(usage.total_used_bytes(&models(&["mistral", "missing"])), 40);
        assert_eq!(usage.open_channels(), 3);
    }

    #[test]
    fn test_warning_rearmed_after_segment_appears() {
        let dir = TempDir::new().unwrap();
        let ns = ShmNamespace::new(dir.path());
        let usage = PerModelUsage::new(ns.clone(), 0, "alice");

        usage.used_bytes("llama");
        usage.used_bytes("qwen");
        assert_eq!(usage.reported_missing.len(), 2);

        publish(&ns, &ChannelName::model(0, "llama", "alice"), 1);
        assert_eq!(usage.used_bytes("llama"), 1);
        assert!(!usage.reported_missing.contains("llama"));
        assert!(usage.reported_missing.contains("qwen"));
    }

    #[test]
    fn test_usage_sums_saturate() {
        let dir = TempDir::new().unwrap();
        let ns = ShmNamespace::new(dir.path());
        publish(&ns, &ChannelName::model(0, "a", "alice"), i64::MAX);
        publish(&ns, &ChannelName::model(0, "b", "alice"), i64::MAX);
        publish(&ns, &ChannelName::worker(0, 0, "alice"), i64::MAX);
        publish(&ns, &ChannelName::worker(0, 1, "alice"), i64::MAX);

        let per_model = PerModelUsage::new(ns.clone(), 0, "alice");
        assert_eq!(per_model.total_used_bytes(&models(&["a", "b"])), i64::MAX);

        let pool = WorkerPoolUsage::open(&ns, 0, 2, "alice").unwrap();
        assert_eq!(pool.total_used_bytes(&[]), i64::MAX);
    }

    #[test]
    fn test_concurrent_first_reads_share_one_handle() {
        let dir = TempDir::new().unwrap();
        let ns = ShmNamespace::new(dir.path());
        publish(&ns, &ChannelName::model(0, "llama", "alice"), 77);
        let usage = Arc::new(PerModelUsage::new(ns, 0, "alice"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let usage = usage.clone();
                std::thread::spawn(move || {
                    let channel = usage.channel("llama").unwrap();
                    (channel.read(), Arc::as_ptr(&channel) as usize)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(usage.open_channels(), 1);
        assert!(results.iter().all(|(used, _)| *used == 77));
        assert!(results.windows(2).all(|w| w[0].1 == w[1].1));
    }
}
