// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the mmserve crates: centralized environment variable names,
//! boolean environment parsing, and `tracing` subscriber setup.

pub mod config;
pub mod logging;
