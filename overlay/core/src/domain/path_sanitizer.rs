// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Path Sanitizer Domain Service
//!
//! Every path entering the engine is reduced to one canonical form before
//! it touches the index: absolute, `/`-separated, no `.` or empty
//! components, no trailing slash. `..` is rejected outright rather than
//! resolved, so a call can never address anything outside the mount.
//!
//! The store directory (`.eidetic`) is reserved at the mount root.

use thiserror::Error;

/// Name of the per-source store directory, hidden from the mount.
pub const STORE_DIR_NAME: &str = ".eidetic";

#[derive(Debug, Error)]
pub enum PathSanitizerError {
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Reserved path: {0}")]
    Reserved(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),
}

pub struct PathSanitizer {
    max_path_len: usize,
    max_name_len: usize,
}

impl PathSanitizer {
    pub fn new() -> Self {
        Self {
            max_path_len: 4096,
            max_name_len: 255,
        }
    }

    pub fn with_max_length(max_path_len: usize) -> Self {
        Self {
            max_path_len,
            ..Self::new()
        }
    }

    /// Canonicalize a mount path.
    ///
    /// # Examples
    /// ```
    /// use eidetic_core::domain::path_sanitizer::PathSanitizer;
    ///
    /// let sanitizer = PathSanitizer::new();
    /// assert_eq!(sanitizer.normalize("docs//./notes.txt/").unwrap(), "/docs/notes.txt");
    /// assert!(sanitizer.normalize("/docs/../etc/passwd").is_err());
    /// ```
    pub fn normalize(&self, path: &str) -> Result<String, PathSanitizerError> {
        if path.len() > self.max_path_len {
            return Err(PathSanitizerError::PathTooLong(path.to_string()));
        }
        if path.contains('\0') {
            return Err(PathSanitizerError::InvalidPath(path.to_string()));
        }

        let mut parts: Vec<&str> = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    tracing::warn!(path = %path, "Path traversal attempt detected: contains '..' component");
                    return Err(PathSanitizerError::PathTraversal(path.to_string()));
                }
                name if name.len() > self.max_name_len => {
                    return Err(PathSanitizerError::PathTooLong(path.to_string()));
                }
                name => parts.push(name),
            }
        }

        if parts.first() == Some(&STORE_DIR_NAME) {
            return Err(PathSanitizerError::Reserved(path.to_string()));
        }

        Ok(format!("/{}", parts.join("/")))
    }

    /// Validate a single directory-entry name.
    pub fn validate_name(&self, name: &str) -> Result<(), PathSanitizerError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
            return Err(PathSanitizerError::InvalidPath(name.to_string()));
        }
        if name.len() > self.max_name_len {
            return Err(PathSanitizerError::PathTooLong(name.to_string()));
        }
        Ok(())
    }
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parent of a canonical path; the root is its own parent.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last component of a canonical path; empty for the root.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Join a canonical directory path and an entry name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// True when `path` equals `ancestor` or lies beneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}
