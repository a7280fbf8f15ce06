// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! NFS Server Infrastructure
//!
//! User-space NFSv3 transport for the overlay, built on the nfsserve crate.
//!
//! ## Architecture
//! ```text
//! NFS client (mount -t nfs -o nfsvers=3,tcp,nolock,port=N)
//!   → OverlayNfsAdapter (implements nfsserve::vfs::NFSFileSystem)
//!   → OverlayEngine
//! ```
//!
//! The adapter is stateless apart from its fileid ↔ path table. Every call
//! is forwarded to the engine, which owns versioning, the vault and views.
//! No NLM lock manager is provided, so clients must mount with `nolock`.

pub mod server;

pub use server::{NfsServer, NfsServerError};
