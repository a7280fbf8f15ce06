// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Eidetic CLI

pub mod config;
pub mod mount;

pub use self::config::ConfigCommand;
pub use self::mount::MountArgs;
