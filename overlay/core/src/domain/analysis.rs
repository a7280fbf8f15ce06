// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Analyzer Contract
//!
//! Analyzers turn the plaintext of one committed version into derived
//! metadata. They are pure with respect to the mount: results are written
//! back by the pipeline, never by the analyzer.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::file::{FileId, TagSet, TodoItem, VersionId};
use crate::domain::job::JobKind;

/// Content handed to an analyzer.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub path: String,
    pub file_id: FileId,
    pub version: VersionId,
    pub content: Arc<Vec<u8>>,
}

impl AnalysisInput {
    /// Lower-cased extension of the path, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Null byte within the first KiB.
    pub fn is_binary(&self) -> bool {
        self.content.iter().take(1024).any(|&b| b == 0)
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutput {
    Summary(String),
    Todos(Vec<TodoItem>),
    Tags(TagSet),
    /// Nothing to derive from this content (binary, empty, ...).
    Skipped(String),
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("Unsupported content: {0}")]
    Unsupported(String),

    #[error("Analyzer failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn analyze(&self, input: &AnalysisInput) -> Result<AnalysisOutput, AnalyzerError>;
}

/// One analyzer per job kind.
#[derive(Clone)]
pub struct AnalyzerSet {
    summarize: Arc<dyn Analyzer>,
    extract_todos: Arc<dyn Analyzer>,
    classify: Arc<dyn Analyzer>,
}

impl AnalyzerSet {
    pub fn new(
        summarize: Arc<dyn Analyzer>,
        extract_todos: Arc<dyn Analyzer>,
        classify: Arc<dyn Analyzer>,
    ) -> Self {
        Self {
            summarize,
            extract_todos,
            classify,
        }
    }

    /// The single dispatch point from job kind to handler.
    pub fn analyzer_for(&self, kind: JobKind) -> &Arc<dyn Analyzer> {
        match kind {
            JobKind::Summarize => &self.summarize,
            JobKind::ExtractTodos => &self.extract_todos,
            JobKind::Classify => &self.classify,
        }
    }
}
