// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod analyzers;
pub mod event_bus;
pub mod image_convert;
pub mod license_client;
pub mod nfs;
pub mod sled_index;
pub mod storage;
pub mod vault_codec;
pub mod web_fetch;
