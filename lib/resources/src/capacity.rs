// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Static device facts: how much memory a GPU has and how much of it the serving stack
//! is allowed to plan with.

use std::collections::HashMap;

use crate::{GIB, ResourceError, Result};

/// Source of a device's total physical memory.
pub trait DeviceMemoryQuery: Send + Sync {
    /// Total physical memory of `device_id`, in bytes.
    fn total_physical_memory_bytes(&self, device_id: u32) -> Result<u64>;
}

/// Device memory table fixed up front.
///
/// Used when capacity is pinned through configuration, and by simulations and tests that
/// run without a driver.
#[derive(Debug, Clone, Default)]
pub struct FixedDeviceMemory {
    devices: HashMap<u32, u64>,
}

impl FixedDeviceMemory {
    /// A single device with `total_bytes` of memory.
    pub fn new(device_id: u32, total_bytes: u64) -> Self {
        Self::default().with_device(device_id, total_bytes)
    }

    pub fn with_device(mut self, device_id: u32, total_bytes: u64) -> Self {
        self.devices.insert(device_id, total_bytes);
        self
    }
}

impl DeviceMemoryQuery for FixedDeviceMemory {
    fn total_physical_memory_bytes(&self, device_id: u32) -> Result<u64> {
        self.devices
            .get(&device_id)
            .copied()
            .ok_or_else(|| ResourceError::DeviceQuery {
                device_id,
                message: "device not present in fixed memory table".to_string(),
            })
    }
}

/// Queries the CUDA driver for the device's total memory.
#[cfg(feature = "cuda")]
#[derive(Debug, Clone, Copy, Default)]
pub struct CudaDeviceMemory;

#[cfg(feature = "cuda")]
impl DeviceMemoryQuery for CudaDeviceMemory {
    fn total_physical_memory_bytes(&self, device_id: u32) -> Result<u64> {
        let query_error = |e: cudarc::driver::DriverError| ResourceError::DeviceQuery {
            device_id,
            message: e.to_string(),
        };

        let ctx = cudarc::driver::CudaContext::new(device_id as usize).map_err(query_error)?;
        let total = unsafe { cudarc::driver::result::device::total_mem(ctx.cu_device()) }
            .map_err(query_error)?;
        Ok(total as u64)
    }
}

/// Reservation-adjusted capacity of one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuCapacity {
    device_id: u32,
    mem_fraction: f64,
    total_physical_bytes: u64,
}

impl GpuCapacity {
    /// Query the device once and capture its capacity.
    ///
    /// Query failures are fatal: nothing can be budgeted without the device total.
    pub fn query(device: &dyn DeviceMemoryQuery, device_id: u32, mem_fraction: f64) -> Result<Self> {
        let total_physical_bytes = device.total_physical_memory_bytes(device_id)?;
        tracing::debug!(
            device_id,
            total_physical_bytes,
            mem_fraction,
            "queried device memory"
        );
        Ok(Self {
            device_id,
            mem_fraction,
            total_physical_bytes,
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn mem_fraction(&self) -> f64 {
        self.mem_fraction
    }

    pub fn total_physical_bytes(&self) -> u64 {
        self.total_physical_bytes
    }

    /// Memory the serving stack may plan with, in GB (2^30 bytes).
    pub fn total_usable_memory_gb(&self) -> f64 {
        self.total_physical_bytes as f64 / GIB as f64 * self.mem_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_usable_memory_applies_fraction() {
        let device = FixedDeviceMemory::new(0, 80 * GIB);
        let capacity = GpuCapacity::query(&device, 0, 0.9).unwrap();
        assert_eq!(capacity.total_physical_bytes(), 80 * GIB);
        assert_relative_eq!(capacity.total_usable_memory_gb(), 72.0, epsilon = 1e-9);
    }

    #[test]
    fn test_full_fraction_is_whole_device() {
        let device = FixedDeviceMemory::new(3, 24 * GIB);
        let capacity = GpuCapacity::query(&device, 3, 1.0).unwrap();
        assert_eq!(capacity.device_id(), 3);
        assert_eq!(capacity.total_usable_memory_gb(), 24.0);
    }

    #[test]
    fn test_unknown_device_is_query_error() {
        let device = FixedDeviceMemory::new(0, 80 * GIB).with_device(1, 40 * GIB);
        let err = GpuCapacity::query(&device, 7, 0.9).unwrap_err();
        assert!(matches!(err, ResourceError::DeviceQuery { device_id: 7, .. }));
    }
}
