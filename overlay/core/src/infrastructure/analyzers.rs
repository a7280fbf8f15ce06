// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Built-in heuristic analyzers.
//!
//! Cheap stand-ins for real models. Anything smarter plugs
//! in through the same `Analyzer` trait.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::domain::analysis::{AnalysisInput, AnalysisOutput, Analyzer, AnalyzerError, AnalyzerSet};
use crate::domain::file::{TagSet, TodoItem};
use crate::domain::job::JobKind;

const SUMMARY_PREFIX_CHARS: usize = 100;
const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];

pub fn builtin_analyzers() -> AnalyzerSet {
    AnalyzerSet::new(
        Arc::new(HeuristicSummarizer),
        Arc::new(TodoExtractor),
        Arc::new(KeywordClassifier),
    )
}

fn text_of(input: &AnalysisInput) -> Result<&str, AnalysisOutput> {
    if input.content.is_empty() {
        return Err(AnalysisOutput::Skipped("empty content".to_string()));
    }
    if input.is_binary() {
        return Err(AnalysisOutput::Skipped("binary content".to_string()));
    }
    input
        .text()
        .ok_or_else(|| AnalysisOutput::Skipped("content is not UTF-8".to_string()))
}

/// First and last sentence for longer text, otherwise a short prefix.
pub struct HeuristicSummarizer;

impl HeuristicSummarizer {
    fn sentences(text: &str) -> Vec<&str> {
        let mut sentences = Vec::new();
        let mut start = 0;
        let mut chars = text.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if matches!(c, '.' | '!' | '?') {
                let boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
                if boundary {
                    let end = i + c.len_utf8();
                    let sentence = text[start..end].trim();
                    if !sentence.is_empty() {
                        sentences.push(sentence);
                    }
                    start = end;
                }
            }
        }
        let tail = text[start..].trim();
        if !tail.is_empty() {
            sentences.push(tail);
        }
        sentences
    }

    pub fn summarize(text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let sentences = Self::sentences(text);
        if sentences.len() > 3 {
            let first = sentences[0];
            let last = sentences[sentences.len() - 1];
            return Some(format!("{} … {}", first, last));
        }
        let prefix: String = text.chars().take(SUMMARY_PREFIX_CHARS).collect();
        Some(prefix.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

#[async_trait]
impl Analyzer for HeuristicSummarizer {
    fn kind(&self) -> JobKind {
        JobKind::Summarize
    }

    async fn analyze(&self, input: &AnalysisInput) -> Result<AnalysisOutput, AnalyzerError> {
        let text = match text_of(input) {
            Ok(text) => text,
            Err(skipped) => return Ok(skipped),
        };
        Ok(match Self::summarize(text) {
            Some(summary) => AnalysisOutput::Summary(summary),
            None => AnalysisOutput::Skipped("blank content".to_string()),
        })
    }
}

/// TODO / FIXME markers with 1-based line numbers.
pub struct TodoExtractor;

fn todo_marker() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER
        .get_or_init(|| Regex::new(r"\b(TODO|FIXME)\b[:\s-]*(.*)$").ok())
        .as_ref()
}

impl TodoExtractor {
    pub fn extract(path: &str, text: &str) -> Vec<TodoItem> {
        let Some(marker) = todo_marker() else {
            return Vec::new();
        };
        let discovered_at = Utc::now();
        text.lines()
            .enumerate()
            .filter_map(|(i, line)| {
                let captures = marker.captures(line)?;
                let rest = captures.get(2).map_or("", |m| m.as_str()).trim();
                let text = if rest.is_empty() {
                    captures.get(1).map_or("", |m| m.as_str()).to_string()
                } else {
                    rest.to_string()
                };
                Some(TodoItem {
                    path: path.to_string(),
                    line: (i + 1) as u32,
                    text,
                    discovered_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Analyzer for TodoExtractor {
    fn kind(&self) -> JobKind {
        JobKind::ExtractTodos
    }

    async fn analyze(&self, input: &AnalysisInput) -> Result<AnalysisOutput, AnalyzerError> {
        // Binary or empty content still supersedes the previous version's list.
        let todos = match text_of(input) {
            Ok(text) => Self::extract(&input.path, text),
            Err(_) => Vec::new(),
        };
        Ok(AnalysisOutput::Todos(todos))
    }
}

/// Keyword and extension based tagging.
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn classify(name: &str, text: &str) -> TagSet {
        let mut tags = TagSet::new();
        let lower = text.to_lowercase();

        if ["function", "def ", "impl ", "class "]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            tags.insert("code".to_string());
        }
        if ["total:", "amount:", "invoice"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            tags.insert("finance".to_string());
        }
        if lower.contains("select * from") || lower.contains("insert into") {
            tags.insert("sql".to_string());
        }
        if lower.contains("dear ") && lower.contains("sincerely") {
            tags.insert("letter".to_string());
        }
        if name.to_lowercase().contains("invoice") {
            tags.insert("invoice".to_string());
        }
        tags
    }
}

#[async_trait]
impl Analyzer for KeywordClassifier {
    fn kind(&self) -> JobKind {
        JobKind::Classify
    }

    async fn analyze(&self, input: &AnalysisInput) -> Result<AnalysisOutput, AnalyzerError> {
        let name = input.path.rsplit('/').next().unwrap_or_default();

        if let Some(ext) = input.extension() {
            if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                let mut tags = TagSet::new();
                tags.insert("image".to_string());
                return Ok(AnalysisOutput::Tags(tags));
            }
        }

        // Unreadable content still replaces the previous version's tags.
        let tags = match text_of(input) {
            Ok(text) => Self::classify(name, text),
            Err(_) => TagSet::new(),
        };
        Ok(AnalysisOutput::Tags(tags))
    }
}
