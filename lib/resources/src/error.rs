// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

/// Result type for resource arbitration operations.
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Errors raised while building or driving a [`crate::ResourceManager`].
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to query total memory for device {device_id}: {message}")]
    DeviceQuery { device_id: u32, message: String },

    #[error("no memory profile for model '{model}'")]
    MissingProfile { model: String },

    #[error("unknown model '{model}'")]
    UnknownModel { model: String },

    #[error("model '{model}' is not active")]
    NotActive { model: String },

    #[error("failed to open usage channel '{name}': {source}")]
    ChannelOpen {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve model size for {}: {message}", path.display())]
    ModelSize { path: PathBuf, message: String },

    #[error("invalid memory profile for model '{model}': {message}")]
    InvalidProfile { model: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ResourceError {
    /// True when a channel failed to open because its segment has not been published yet.
    pub fn is_missing_segment(&self) -> bool {
        matches!(
            self,
            ResourceError::ChannelOpen { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

impl From<figment::Error> for ResourceError {
    fn from(err: figment::Error) -> Self {
        ResourceError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ResourceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ResourceError::Config(err.to_string())
    }
}
