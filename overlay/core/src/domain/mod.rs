// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod analysis;
pub mod events;
pub mod file;
pub mod index;
pub mod job;
pub mod mount_config;
pub mod path_sanitizer;
pub mod storage;
pub mod vault;
pub mod views;
