// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-model static memory reservations.
//!
//! Every model that may ever be activated reserves a fixed amount of device memory for its
//! weights and for its auxiliary fixed-size pools (e.g. the request-to-token table). The
//! reservation is either measured by a running engine and handed in directly, or, when
//! models share a pool of workers, estimated from the size of the weights on disk plus a
//! constant pool allowance.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{GIB, ResourceError, Result};

/// Weight formats in order of preference. A directory is sized by the first format it
/// contains; `pt` and `pth` are the same format.
const WEIGHT_FORMATS: [&[&str]; 4] = [&["safetensors"], &["gguf"], &["bin"], &["pt", "pth"]];

/// Checkpoint artifacts that share a weight extension but are never loaded onto the device.
const NON_WEIGHT_STEMS: [&str; 4] = ["training_args", "optimizer", "scheduler", "rng_state"];

/// Fixed reservation of one model, in GB (2^30 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelMemoryUsage {
    /// Memory held by the model weights
    pub weights_memory_gb: f64,

    /// Memory held by the model's fixed-size auxiliary pools
    pub pool_memory_gb: f64,
}

impl ModelMemoryUsage {
    pub fn new(weights_memory_gb: f64, pool_memory_gb: f64) -> Self {
        Self {
            weights_memory_gb,
            pool_memory_gb,
        }
    }

    /// Total fixed reservation
    pub fn reserved_gb(&self) -> f64 {
        self.weights_memory_gb + self.pool_memory_gb
    }

    fn validate(&self, model: &str) -> Result<()> {
        for (field, value) in [
            ("weights_memory_gb", self.weights_memory_gb),
            ("pool_memory_gb", self.pool_memory_gb),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ResourceError::InvalidProfile {
                    model: model.to_string(),
                    message: format!("{field} must be a finite, non-negative value, got {value}"),
                });
            }
        }
        Ok(())
    }
}

/// Estimates how much memory a model's weights occupy from its storage path.
pub trait ModelSizeResolver: Send + Sync {
    /// Estimated weights size for the model stored at `path`, in GB.
    fn resolve_model_size_gb(&self, path: &Path) -> Result<f64>;
}

/// Sizes a model by the weight files on disk.
///
/// A file path resolves to the file's own size. A directory resolves to the sum of the
/// weight files directly inside it, symlinks followed. When several formats are present
/// only the preferred one is counted (`.safetensors`, then `.gguf`, then `.bin`, then
/// `.pt`/`.pth`), and optimizer, scheduler and training-argument checkpoints are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightFileSizeResolver;

impl WeightFileSizeResolver {
    /// Index into [`WEIGHT_FORMATS`] of the file's format, if it holds model weights.
    fn weight_format(path: &Path) -> Option<usize> {
        let ext = path.extension()?.to_str()?;
        let stem = path.file_stem()?.to_str()?;
        if NON_WEIGHT_STEMS.iter().any(|s| stem.starts_with(s)) {
            return None;
        }
        WEIGHT_FORMATS.iter().position(|exts| exts.contains(&ext))
    }
}

impl ModelSizeResolver for WeightFileSizeResolver {
    fn resolve_model_size_gb(&self, path: &Path) -> Result<f64> {
        let size_error = |message: String| ResourceError::ModelSize {
            path: path.to_path_buf(),
            message,
        };

        let metadata = std::fs::metadata(path).map_err(|e| size_error(e.to_string()))?;
        if metadata.is_file() {
            return Ok(metadata.len() as f64 / GIB as f64);
        }

        // (bytes, files) per format
        let mut formats = [(0u64, 0usize); WEIGHT_FORMATS.len()];
        for entry in std::fs::read_dir(path).map_err(|e| size_error(e.to_string()))? {
            let entry = entry.map_err(|e| size_error(e.to_string()))?;
            let entry_path = entry.path();
            let Some(format) = Self::weight_format(&entry_path) else {
                continue;
            };
            // follows symlinks, so snapshot directories pointing into a blob store resolve
            let metadata =
                std::fs::metadata(&entry_path).map_err(|e| size_error(e.to_string()))?;
            if metadata.is_file() {
                formats[format].0 += metadata.len();
                formats[format].1 += 1;
            }
        }

        let Some(&(total_bytes, weight_files)) = formats.iter().find(|(_, files)| *files > 0)
        else {
            return Err(size_error("directory contains no weight files".to_string()));
        };

        tracing::debug!(path = %path.display(), weight_files, total_bytes, "sized model weights");
        Ok(total_bytes as f64 / GIB as f64)
    }
}

/// Fixed reservations and KV cell sizes for every model a manager may activate.
#[derive(Debug, Clone, Default)]
pub struct ModelMemoryProfile {
    usage: HashMap<String, ModelMemoryUsage>,
    cell_sizes: HashMap<String, usize>,
}

impl ModelMemoryProfile {
    /// Profile from reservations measured by running engines.
    pub fn per_engine(usage: HashMap<String, ModelMemoryUsage>) -> Result<Self> {
        for (model, entry) in &usage {
            entry.validate(model)?;
        }
        Ok(Self {
            usage,
            cell_sizes: HashMap::new(),
        })
    }

    /// Profile for models served from a shared worker pool.
    ///
    /// Each model reserves `pool_memory_gb` plus the estimated size of its weights. Models
    /// sharing a storage path are sized once.
    pub fn pooled(
        model_paths: &HashMap<String, PathBuf>,
        pool_memory_gb: f64,
        resolver: &dyn ModelSizeResolver,
    ) -> Result<Self> {
        let distinct_paths: BTreeSet<&PathBuf> = model_paths.values().collect();

        let mut path_sizes = HashMap::with_capacity(distinct_paths.len());
        for path in distinct_paths {
            path_sizes.insert(path, resolver.resolve_model_size_gb(path)?);
        }

        let mut usage = HashMap::with_capacity(model_paths.len());
        for (model, path) in model_paths {
            let entry = ModelMemoryUsage::new(path_sizes[path], pool_memory_gb);
            entry.validate(model)?;
            usage.insert(model.clone(), entry);
        }

        Ok(Self {
            usage,
            cell_sizes: HashMap::new(),
        })
    }

    /// Attach per-token KV cell sizes, in bytes.
    pub fn with_cell_sizes(mut self, cell_sizes: HashMap<String, usize>) -> Self {
        self.cell_sizes = cell_sizes;
        self
    }

    pub fn contains(&self, model: &str) -> bool {
        self.usage.contains_key(model)
    }

    pub fn usage(&self, model: &str) -> Result<&ModelMemoryUsage> {
        self.usage
            .get(model)
            .ok_or_else(|| ResourceError::UnknownModel {
                model: model.to_string(),
            })
    }

    pub fn cell_size(&self, model: &str) -> Result<usize> {
        self.cell_sizes
            .get(model)
            .copied()
            .ok_or_else(|| ResourceError::UnknownModel {
                model: model.to_string(),
            })
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.usage.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.usage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
    }
}
