// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Read-only view of the live KV cache usage counters published by worker processes.
//!
//! Each worker (or each per-model engine) owns a POSIX shared memory segment holding a
//! single native-endian `i64`: the number of KV cache bytes it currently has mapped. The
//! segment is created and written by the worker; this module only opens and reads it.
//!
//! Segments are addressed by `ipc_{device_id}_{worker_id|model_name}_{owner}` inside the
//! shared memory namespace directory (`/dev/shm` on Linux).

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use memmap2::{Mmap, MmapOptions};

use crate::{ResourceError, Result};

/// Default location of the POSIX shared memory namespace.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Size of the usage counter at the head of every segment.
pub const COUNTER_BYTES: usize = std::mem::size_of::<i64>();

/// What a channel reports on: one pooled worker, or one model's engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelSubject {
    Worker(u32),
    Model(String),
}

impl fmt::Display for ChannelSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelSubject::Worker(worker_id) => write!(f, "{worker_id}"),
            ChannelSubject::Model(model) => f.write_str(model),
        }
    }
}

/// Stable name of a usage segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    device_id: u32,
    subject: ChannelSubject,
    owner: String,
}

impl ChannelName {
    pub fn worker(device_id: u32, worker_id: u32, owner: impl Into<String>) -> Self {
        Self {
            device_id,
            subject: ChannelSubject::Worker(worker_id),
            owner: owner.into(),
        }
    }

    pub fn model(device_id: u32, model: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            device_id,
            subject: ChannelSubject::Model(model.into()),
            owner: owner.into(),
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn subject(&self) -> &ChannelSubject {
        &self.subject
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipc_{}_{}_{}", self.device_id, self.subject, self.owner)
    }
}

/// Directory in which usage segments live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNamespace {
    root: PathBuf,
}

impl Default for ShmNamespace {
    fn default() -> Self {
        Self::new(DEFAULT_SHM_DIR)
    }
}

impl ShmNamespace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segment_path(&self, name: &ChannelName) -> PathBuf {
        self.root.join(name.to_string())
    }

    /// Open the segment for `name`.
    pub fn open(&self, name: &ChannelName) -> Result<UsageChannel> {
        UsageChannel::open(&self.segment_path(name), name.to_string())
    }
}

/// An open, read-only usage counter.
#[derive(Debug)]
pub struct UsageChannel {
    name: String,
    map: Mmap,
}

impl UsageChannel {
    /// Map the counter at the head of the segment at `path`.
    pub fn open(path: &Path, name: String) -> Result<Self> {
        let open_error = |source: std::io::Error| ResourceError::ChannelOpen {
            name: name.clone(),
            source,
        };

        let file = File::open(path).map_err(open_error)?;
        let len = file.metadata().map_err(open_error)?.len();
        if len < COUNTER_BYTES as u64 {
            return Err(open_error(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("segment is {len} bytes, expected at least {COUNTER_BYTES}"),
            )));
        }

        // SAFETY: the segment is only ever written through 8-byte stores by its owning worker,
        // and it is never truncated while the worker is alive.
        let map = unsafe { MmapOptions::new().len(COUNTER_BYTES).map(&file) }.map_err(open_error)?;

        tracing::debug!(channel = %name, "opened usage channel");
        Ok(Self { name, map })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes currently in use, as last published by the worker.
    pub fn read(&self) -> i64 {
        // SAFETY: mappings are page aligned and at least COUNTER_BYTES long.
        let counter = unsafe { &*(self.map.as_ptr() as *const AtomicI64) };
        counter.load(Ordering::Acquire)
    }
}
