// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Storage Infrastructure
//!
//! - [`LocalBlobStore`] - content-addressed version objects under `<source>/.eidetic/objects`
//! - [`SourceTree`] - discovery import and write-through mirror of the plain source directory

pub mod local;
pub mod source_tree;

pub use local::LocalBlobStore;
pub use source_tree::{SourceEntry, SourceTree};
