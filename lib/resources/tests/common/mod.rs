// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use memmap2::MmapMut;
use tempfile::TempDir;

use mmserve_resources::{
    ChannelName, FixedDeviceMemory, GIB, ModelMemoryUsage, ResourceConfig, ResourceManager,
    ResourceManagerBuilder, ServingMode, ShmNamespace,
};

pub const OWNER: &str = "alice";

/// Writer side of a usage segment, standing in for a worker process.
pub struct SegmentWriter {
    map: MmapMut,
}

impl SegmentWriter {
    pub fn create(path: &Path, value: i64) -> Self {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap();
        file.set_len(8).unwrap();
        let map = unsafe { MmapMut::map_mut(&file).unwrap() };
        let writer = Self { map };
        writer.store(value);
        writer
    }

    pub fn store(&self, value: i64) {
        let counter = unsafe { &*(self.map.as_ptr() as *const AtomicI64) };
        counter.store(value, Ordering::Release);
    }
}

/// Temporary shared memory namespace.
pub struct Shm {
    pub dir: TempDir,
}

impl Shm {
    pub fn new() -> Self {
        mmserve_runtime::logging::init();
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn ns(&self) -> ShmNamespace {
        ShmNamespace::new(self.dir.path())
    }

    pub fn publish_model(&self, device_id: u32, model: &str, value: i64) -> SegmentWriter {
        let path = self.ns().segment_path(&ChannelName::model(device_id, model, OWNER));
        SegmentWriter::create(&path, value)
    }

    pub fn publish_worker(&self, device_id: u32, worker_id: u32, value: i64) -> SegmentWriter {
        let path = self
            .ns()
            .segment_path(&ChannelName::worker(device_id, worker_id, OWNER));
        SegmentWriter::create(&path, value)
    }

    pub fn config(&self) -> ResourceConfig {
        ResourceConfig::builder()
            .owner_tag(OWNER)
            .shm_dir(self.dir.path())
            .build()
            .unwrap()
    }
}

pub fn per_engine(models: &[(&str, f64, f64)]) -> ServingMode {
    ServingMode::PerEngine {
        usage: models
            .iter()
            .map(|(name, weights, pool)| (name.to_string(), ModelMemoryUsage::new(*weights, *pool)))
            .collect::<HashMap<_, _>>(),
    }
}

/// Builder for a manager on an 80 GiB device 0.
pub fn builder(shm: &Shm, mode: ServingMode) -> ResourceManagerBuilder {
    ResourceManager::builder()
        .config(shm.config())
        .mode(mode)
        .device(Arc::new(FixedDeviceMemory::new(0, 80 * GIB)))
}
