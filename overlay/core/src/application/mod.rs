// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod analysis_pipeline;
pub mod context;
pub mod event_logger;
pub mod license;
pub mod mount_gateway;
pub mod overlay_engine;
pub mod version_store;
pub mod view_resolver;
