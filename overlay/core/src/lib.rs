// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Eidetic Core
//!
//! Filesystem overlay engine. Every call issued against the mount goes
//! through [`application::overlay_engine::OverlayEngine`], which layers
//! copy-on-write versioning, a transparently encrypted vault subtree,
//! read-time "magic" views and asynchronous content analysis on top of a
//! plain source directory.
//!
//! ## Layout
//!
//! - [`domain`] - value types, persistence traits, path rules, configuration
//! - [`application`] - version store, view resolver, analysis pipeline, engine
//! - [`infrastructure`] - sled index, blob store, vault codec, NFSv3 transport

pub mod application;
pub mod domain;
pub mod infrastructure;
