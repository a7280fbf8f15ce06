// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! View Resolver
//!
//! Decides what a read or a directory listing of a mount path returns.
//! Resolution order for a path:
//!
//! 1. synthetic views (`/.magic/...`, `<dir>/.context`, `<file>@v<N>`)
//! 2. stored records (vaulted ones are decrypted by the version store;
//!    plain `.url` records holding an http(s) link are fetched)
//! 3. conversion views (`photo.jpg` served from a stored `photo.png`)
//!
//! Converted and fetched bytes are kept in a short-lived LRU cache keyed by
//! (path, version) so a `getattr` followed by `read` does the work once.
//! Every other view is computed per call.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::context::MountContext;
use crate::application::license::LicenseStatus;
use crate::application::version_store::{VersionStore, VersionStoreError};
use crate::domain::events::OverlayEvent;
use crate::domain::file::{FileId, FileKind, FileRecord, Version, VersionId};
use crate::domain::index::IndexError;
use crate::domain::path_sanitizer::{file_name, is_within, join, parent_of};
use crate::domain::views::{FormatConverter, LinkFetcher};

/// Name of the magic directory at the mount root.
pub const MAGIC_DIR: &str = ".magic";
/// Per-directory context bundle.
pub const CONTEXT_FILE: &str = ".context";
const UPGRADE_FILE: &str = "UPGRADE.txt";
const DIRECTORY_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("View of {path} is unavailable: {reason}")]
    Unavailable { path: String, reason: String },

    #[error(transparent)]
    Store(#[from] VersionStoreError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Paths that exist only as computed views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticPath {
    MagicRoot,
    Stats,
    Todos,
    TagsRoot,
    TagDir(String),
    TagEntry { tag: String, name: String },
    RecentRoot,
    RecentEntry(String),
    ApiRoot,
    ApiFeed(String),
    Context { dir: String },
    VersionView { path: String, version: VersionId },
}

impl SyntheticPath {
    /// Classify a canonical mount path.
    pub fn parse(path: &str) -> Option<Self> {
        if let Some(rest) = path.strip_prefix("/.magic") {
            return Self::parse_magic(rest);
        }

        let name = file_name(path);
        if name == CONTEXT_FILE {
            return Some(SyntheticPath::Context {
                dir: parent_of(path).to_string(),
            });
        }

        let (stem, digits) = name.rsplit_once("@v")?;
        if stem.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let version = digits.parse::<u64>().ok().filter(|v| *v > 0)?;
        Some(SyntheticPath::VersionView {
            path: join(parent_of(path), stem),
            version: VersionId(version),
        })
    }

    fn parse_magic(rest: &str) -> Option<Self> {
        if rest.is_empty() {
            return Some(SyntheticPath::MagicRoot);
        }
        let rest = rest.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            ["stats.md"] => Some(SyntheticPath::Stats),
            ["todos.md"] => Some(SyntheticPath::Todos),
            ["tags"] => Some(SyntheticPath::TagsRoot),
            ["tags", tag] => Some(SyntheticPath::TagDir(tag.to_string())),
            ["tags", tag, name] => Some(SyntheticPath::TagEntry {
                tag: tag.to_string(),
                name: name.to_string(),
            }),
            ["recent"] => Some(SyntheticPath::RecentRoot),
            ["recent", name] => Some(SyntheticPath::RecentEntry(name.to_string())),
            ["api"] => Some(SyntheticPath::ApiRoot),
            ["api", feed] => Some(SyntheticPath::ApiFeed(feed.to_string())),
            // anything else under /.magic is reserved but does not exist
            _ => None,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(
            self,
            SyntheticPath::MagicRoot | SyntheticPath::TagsRoot | SyntheticPath::TagDir(_) | SyntheticPath::RecentRoot | SyntheticPath::ApiRoot
        )
    }
}

/// True for every path the resolver owns, including unknown names under
/// `/.magic`. Mutations of these paths are refused.
pub fn is_reserved_view_path(path: &str) -> bool {
    path == "/.magic" || path.starts_with("/.magic/") || SyntheticPath::parse(path).is_some()
}

/// Attributes of whatever a path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewAttr {
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    /// Views and historical versions cannot be written.
    pub read_only: bool,
    pub vaulted: bool,
    pub file_id: Option<FileId>,
    pub version: Option<VersionId>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

impl DirEntry {
    fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FileKind::Directory,
        }
    }

    fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FileKind::Regular,
        }
    }
}

/// What a path turned out to be.
enum Target {
    Synthetic(SyntheticPath),
    Stored { record: FileRecord, version: Option<Version> },
    Converted { source: FileRecord, version: Version, from: String, to: String },
}

struct CachedView {
    bytes: Arc<Vec<u8>>,
    stored_at: Instant,
}

pub struct ViewResolver {
    ctx: Arc<MountContext>,
    store: Arc<VersionStore>,
    fetcher: Arc<dyn LinkFetcher>,
    converter: Arc<dyn FormatConverter>,
    cache: Mutex<LruCache<(String, Option<VersionId>), CachedView>>,
}

impl ViewResolver {
    pub fn new(
        ctx: Arc<MountContext>,
        store: Arc<VersionStore>,
        fetcher: Arc<dyn LinkFetcher>,
        converter: Arc<dyn FormatConverter>,
    ) -> Self {
        let entries = NonZeroUsize::new(ctx.spec().views.cache_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            ctx,
            store,
            fetcher,
            converter,
            cache: Mutex::new(LruCache::new(entries)),
        }
    }

    /// Attributes of `path`.
    pub async fn attr(&self, path: &str) -> Result<ViewAttr, ViewError> {
        let target = self.target(path).await?;
        if let Target::Synthetic(SyntheticPath::TagDir(tag)) = &target {
            if self.tagged(tag).await?.is_empty() {
                return Err(ViewError::NotFound(path.to_string()));
            }
        }

        match target {
            Target::Synthetic(synthetic) if synthetic.is_dir() => Ok(self.virtual_attr(path, FileKind::Directory, DIRECTORY_SIZE)),
            Target::Synthetic(synthetic) => {
                if let SyntheticPath::VersionView { path: base, version } = &synthetic {
                    let (record, found) = self.store.resolve(base, Some(*version)).await?;
                    let mut attr = stored_attr(path, &record, found.as_ref());
                    attr.read_only = true;
                    return Ok(attr);
                }
                let bytes = self.synthetic_bytes(path, &synthetic).await?;
                Ok(self.virtual_attr(path, FileKind::Regular, bytes.len() as u64))
            }
            Target::Stored { record, version } => {
                let mut attr = stored_attr(path, &record, version.as_ref());
                if let Some(version) = version.as_ref().filter(|_| is_link_candidate(&record)) {
                    // A link that cannot be fetched still lists with its stored size.
                    match self.web_link(path, version).await {
                        Ok(Some(bytes)) => attr.size = bytes.len() as u64,
                        Ok(None) => {}
                        Err(e) => debug!(path = %path, error = %e, "Web link size unavailable"),
                    }
                }
                Ok(attr)
            }
            Target::Converted { source, version, from, to } => {
                let bytes = self.converted(path, &source.path, &version, &from, &to).await?;
                let mut attr = stored_attr(path, &source, Some(&version));
                attr.size = bytes.len() as u64;
                attr.read_only = true;
                Ok(attr)
            }
        }
    }

    /// Full content a read of `path` observes.
    pub async fn read(&self, path: &str) -> Result<Arc<Vec<u8>>, ViewError> {
        match self.target(path).await? {
            Target::Synthetic(synthetic) if synthetic.is_dir() => Err(ViewError::IsADirectory(path.to_string())),
            Target::Synthetic(synthetic) => self.synthetic_bytes(path, &synthetic).await,
            Target::Stored { record, .. } if record.is_dir() => Err(ViewError::IsADirectory(path.to_string())),
            Target::Stored { version: None, .. } => Ok(Arc::new(Vec::new())),
            Target::Stored {
                record,
                version: Some(version),
            } => {
                if is_link_candidate(&record) {
                    if let Some(bytes) = self.web_link(path, &version).await? {
                        return Ok(bytes);
                    }
                }
                Ok(Arc::new(self.store.load(path, &version).await?))
            }
            Target::Converted {
                source,
                version,
                from,
                to,
            } => self.converted(path, &source.path, &version, &from, &to).await,
        }
    }

    /// Entries of the directory at `path`, without `.` and `..`.
    pub async fn list(&self, path: &str) -> Result<Vec<DirEntry>, ViewError> {
        match self.target(path).await? {
            Target::Synthetic(synthetic) => self.list_synthetic(path, &synthetic).await,
            Target::Stored { record, .. } if record.is_dir() => {
                let mut entries = vec![DirEntry::file(CONTEXT_FILE)];
                if path == "/" {
                    entries.push(DirEntry::dir(MAGIC_DIR));
                }
                let mut children = self.ctx.index().list_children(path).await?;
                children.sort_by(|a, b| a.path.cmp(&b.path));
                entries.extend(
                    children
                        .iter()
                        .filter(|child| !is_reserved_view_path(&child.path))
                        .map(|child| DirEntry {
                            name: child.name().to_string(),
                            kind: child.kind,
                        }),
                );
                Ok(entries)
            }
            _ => Err(ViewError::NotADirectory(path.to_string())),
        }
    }

    async fn target(&self, path: &str) -> Result<Target, ViewError> {
        let record = self.ctx.index().get_record(path).await?.filter(FileRecord::is_live);

        if let Some(synthetic) = SyntheticPath::parse(path) {
            // a real file named like `notes@v2` wins over the version view
            let shadowed = matches!(synthetic, SyntheticPath::VersionView { .. }) && record.is_some();
            if !shadowed {
                return Ok(Target::Synthetic(synthetic));
            }
        } else if path.starts_with("/.magic/") {
            return Err(ViewError::NotFound(path.to_string()));
        }

        if let Some(record) = record {
            let version = match record.current_version {
                Some(id) => self.ctx.index().get_version(record.file_id, id).await?,
                None => None,
            };
            return Ok(Target::Stored { record, version });
        }

        match self.conversion_source(path).await? {
            Some((source, version, from, to)) => Ok(Target::Converted { source, version, from, to }),
            None => Err(ViewError::NotFound(path.to_string())),
        }
    }

    /// Stored sibling a conversion rule can serve `path` from.
    async fn conversion_source(&self, path: &str) -> Result<Option<(FileRecord, Version, String, String)>, ViewError> {
        let name = file_name(path);
        let Some((stem, ext)) = name.rsplit_once('.').filter(|(stem, _)| !stem.is_empty()) else {
            return Ok(None);
        };
        if self.ctx.vault_policy().contains(path) {
            return Ok(None);
        }

        for rule in &self.ctx.spec().views.conversions {
            if !rule.to.eq_ignore_ascii_case(ext) {
                continue;
            }
            let candidate = join(parent_of(path), &format!("{}.{}", stem, rule.from));
            let Some(source) = self.ctx.index().get_record(&candidate).await?.filter(FileRecord::is_live) else {
                continue;
            };
            let Some(current) = source.current_version.filter(|_| !source.is_dir()) else {
                continue;
            };
            if let Some(version) = self.ctx.index().get_version(source.file_id, current).await? {
                return Ok(Some((source, version, rule.from.to_ascii_lowercase(), ext.to_ascii_lowercase())));
            }
        }
        Ok(None)
    }

    fn virtual_attr(&self, path: &str, kind: FileKind, size: u64) -> ViewAttr {
        let now = Utc::now();
        ViewAttr {
            path: path.to_string(),
            kind,
            size,
            read_only: true,
            vaulted: false,
            file_id: None,
            version: None,
            created_at: now,
            modified_at: now,
        }
    }

    fn unavailable(&self, path: &str, reason: impl Into<String>) -> ViewError {
        let reason = reason.into();
        warn!(path = %path, reason = %reason, "View unavailable");
        self.ctx.events().publish(OverlayEvent::ViewUnavailable {
            path: path.to_string(),
            reason: reason.clone(),
            at: Utc::now(),
        });
        ViewError::Unavailable {
            path: path.to_string(),
            reason,
        }
    }

    fn cached(&self, key: &(String, Option<VersionId>)) -> Option<Arc<Vec<u8>>> {
        let ttl = self.ctx.spec().views.cache_ttl;
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() < ttl => Some(entry.bytes.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn remember(&self, key: (String, Option<VersionId>), bytes: Arc<Vec<u8>>) {
        self.cache.lock().put(
            key,
            CachedView {
                bytes,
                stored_at: Instant::now(),
            },
        );
    }

    /// Fetched body of a `.url` record, `None` when its content is not a link.
    async fn web_link(&self, path: &str, version: &Version) -> Result<Option<Arc<Vec<u8>>>, ViewError> {
        let key = (path.to_string(), Some(version.id));
        if let Some(bytes) = self.cached(&key) {
            return Ok(Some(bytes));
        }

        let stored = self.store.load(path, version).await?;
        let Some(url) = link_target(&stored) else {
            return Ok(None);
        };

        let bytes = Arc::new(self.fetch(path, url).await?);
        self.remember(key, bytes.clone());
        Ok(Some(bytes))
    }

    async fn fetch(&self, path: &str, url: &str) -> Result<Vec<u8>, ViewError> {
        let timeout = self.ctx.spec().views.web_fetch_timeout;
        match tokio::time::timeout(timeout, self.fetcher.fetch(url)).await {
            Ok(Ok(bytes)) => {
                debug!(path = %path, url = %url, bytes = bytes.len(), "Fetched web view");
                Ok(bytes)
            }
            Ok(Err(e)) => Err(self.unavailable(path, e.to_string())),
            Err(_) => Err(self.unavailable(path, format!("fetch of {} timed out after {:?}", url, timeout))),
        }
    }

    async fn converted(
        &self,
        path: &str,
        source_path: &str,
        version: &Version,
        from: &str,
        to: &str,
    ) -> Result<Arc<Vec<u8>>, ViewError> {
        let key = (path.to_string(), Some(version.id));
        if let Some(bytes) = self.cached(&key) {
            return Ok(bytes);
        }

        let stored = self.store.load(source_path, version).await?;
        let converter = self.converter.clone();
        let (from_ext, to_ext) = (from.to_string(), to.to_string());
        let converted = tokio::task::spawn_blocking(move || converter.convert(&stored, &from_ext, &to_ext))
            .await
            .map_err(|e| self.unavailable(path, e.to_string()))?
            .map_err(|e| self.unavailable(path, e.to_string()))?;

        let bytes = Arc::new(converted);
        self.remember(key, bytes.clone());
        Ok(bytes)
    }

    async fn synthetic_bytes(&self, path: &str, synthetic: &SyntheticPath) -> Result<Arc<Vec<u8>>, ViewError> {
        let bytes = match synthetic {
            SyntheticPath::Stats => self.render_stats().await?.into_bytes(),
            SyntheticPath::Todos => self.render_todos().await?.into_bytes(),
            SyntheticPath::Context { dir } => self.render_context(path, dir).await?.into_bytes(),
            SyntheticPath::TagEntry { tag, name } => {
                let record = self.named_entry(self.tagged(tag).await?, name, path)?;
                self.store.read(&record.path, None).await?
            }
            SyntheticPath::RecentEntry(name) => {
                let record = self.named_entry(self.recent().await?, name, path)?;
                self.store.read(&record.path, None).await?
            }
            SyntheticPath::ApiFeed(name) => return self.api_feed(path, name).await,
            SyntheticPath::VersionView { path: base, version } => self.store.read(base, Some(*version)).await?,
            _ => return Err(ViewError::IsADirectory(path.to_string())),
        };
        Ok(Arc::new(bytes))
    }

    async fn list_synthetic(&self, path: &str, synthetic: &SyntheticPath) -> Result<Vec<DirEntry>, ViewError> {
        match synthetic {
            SyntheticPath::MagicRoot => Ok(vec![
                DirEntry::file("stats.md"),
                DirEntry::file("todos.md"),
                DirEntry::dir("tags"),
                DirEntry::dir("recent"),
                DirEntry::dir("api"),
            ]),
            SyntheticPath::TagsRoot => {
                let stats = self.ctx.index().stats().await?;
                Ok(stats.tags.keys().map(DirEntry::dir).collect())
            }
            SyntheticPath::TagDir(tag) => {
                let entries = self.tagged(tag).await?;
                if entries.is_empty() {
                    return Err(ViewError::NotFound(path.to_string()));
                }
                Ok(entries.into_keys().map(DirEntry::file).collect())
            }
            SyntheticPath::RecentRoot => Ok(self.recent().await?.into_keys().map(DirEntry::file).collect()),
            SyntheticPath::ApiRoot => {
                if self.ctx.license().is_licensed() {
                    Ok(self.ctx.spec().views.api_feeds.iter().map(|feed| DirEntry::file(&feed.name)).collect())
                } else {
                    Ok(vec![DirEntry::file(UPGRADE_FILE)])
                }
            }
            _ => Err(ViewError::NotADirectory(path.to_string())),
        }
    }

    fn named_entry(&self, entries: BTreeMap<String, FileRecord>, name: &str, path: &str) -> Result<FileRecord, ViewError> {
        entries
            .into_iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, record)| record)
            .ok_or_else(|| ViewError::NotFound(path.to_string()))
    }

    /// Live files carrying `tag`, by unique entry name.
    async fn tagged(&self, tag: &str) -> Result<BTreeMap<String, FileRecord>, ViewError> {
        let mut records: Vec<FileRecord> = self
            .ctx
            .index()
            .list_live_records()
            .await?
            .into_iter()
            .filter(|record| !record.is_dir() && record.tags.contains(tag))
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(unique_names(records))
    }

    /// Most recently modified plain files.
    async fn recent(&self) -> Result<BTreeMap<String, FileRecord>, ViewError> {
        let mut records: Vec<FileRecord> = self
            .ctx
            .index()
            .list_live_records()
            .await?
            .into_iter()
            .filter(|record| !record.is_dir() && !record.vaulted && record.current_version.is_some())
            .collect();
        records.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then_with(|| a.path.cmp(&b.path)));
        records.truncate(self.ctx.spec().views.recent_limit);
        Ok(unique_names(records))
    }

    async fn api_feed(&self, path: &str, name: &str) -> Result<Arc<Vec<u8>>, ViewError> {
        if !self.ctx.license().is_licensed() {
            if name == UPGRADE_FILE {
                return Ok(Arc::new(upgrade_notice().into_bytes()));
            }
            return Err(ViewError::NotFound(path.to_string()));
        }
        let Some(feed) = self.ctx.spec().views.api_feeds.iter().find(|feed| feed.name == name) else {
            return Err(ViewError::NotFound(path.to_string()));
        };

        let key = (path.to_string(), None);
        if let Some(bytes) = self.cached(&key) {
            return Ok(bytes);
        }
        let bytes = Arc::new(self.fetch(path, &feed.url).await?);
        self.remember(key, bytes.clone());
        Ok(bytes)
    }

    async fn render_stats(&self) -> Result<String, ViewError> {
        let stats = self.ctx.index().stats().await?;
        let mut out = String::new();
        let _ = writeln!(out, "# Eidetic Stats\n");
        let _ = writeln!(out, "## Files");
        let _ = writeln!(out, "- **Files**: {}", stats.files);
        let _ = writeln!(out, "- **Directories**: {}", stats.directories);
        let _ = writeln!(out, "- **Deleted**: {}", stats.tombstoned);
        let _ = writeln!(out, "- **Versions**: {}", stats.versions);
        let _ = writeln!(out, "- **Stored bytes**: {}", stats.stored_bytes);
        let _ = writeln!(out, "- **Vaulted files**: {} ({} bytes)", stats.vaulted_files, stats.vault_bytes);

        let _ = writeln!(out, "\n## Analysis");
        let _ = writeln!(out, "- **Pending jobs**: {}", stats.jobs_pending);
        let _ = writeln!(out, "- **Running jobs**: {}", stats.jobs_running);
        let _ = writeln!(out, "- **Done jobs**: {}", stats.jobs_done);
        let _ = writeln!(out, "- **Failed jobs**: {}", stats.jobs_failed);

        let _ = writeln!(out, "\n## Tags Distribution");
        if stats.tags.is_empty() {
            let _ = writeln!(out, "_No tags found yet._");
        } else {
            for (tag, count) in &stats.tags {
                let _ = writeln!(out, "- **#{}**: {} files", tag, count);
            }
        }

        let _ = writeln!(out, "\n## License");
        match self.ctx.license() {
            LicenseStatus::Licensed { key_hint } => {
                let _ = writeln!(out, "- Licensed ({})", key_hint);
            }
            LicenseStatus::Free { reason } => {
                let _ = writeln!(out, "- Free mode ({})", reason);
            }
        }
        let _ = writeln!(out, "\n> *Generated by Eidetic Intelligent Filesystem*");
        Ok(out)
    }

    async fn render_todos(&self) -> Result<String, ViewError> {
        let mut records = self.ctx.index().list_live_records().await?;
        records.sort_by(|a, b| a.path.cmp(&b.path));

        let mut out = String::from("# TODOs\n\n");
        let mut found = 0usize;
        for record in records.iter().filter(|r| !r.is_dir()) {
            let Some(current) = record.current_version else {
                continue;
            };
            let todos = self.ctx.index().todos(record.file_id, current).await?.unwrap_or_default();
            if todos.is_empty() {
                continue;
            }
            let _ = writeln!(out, "## {}", record.path);
            for todo in &todos {
                let _ = writeln!(out, "- [ ] L{}: {}", todo.line, todo.text);
            }
            out.push('\n');
            found += todos.len();
        }
        if found == 0 {
            out.push_str("_No TODOs found._\n");
        }
        Ok(out)
    }

    async fn render_context(&self, path: &str, dir: &str) -> Result<String, ViewError> {
        match self.ctx.index().get_record(dir).await?.filter(FileRecord::is_live) {
            Some(record) if record.is_dir() => {}
            Some(_) => return Err(ViewError::NotADirectory(dir.to_string())),
            None => return Err(ViewError::NotFound(path.to_string())),
        }

        let views = &self.ctx.spec().views;
        let allowed: HashSet<String> = views.context_extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        let mut files: Vec<FileRecord> = self
            .ctx
            .index()
            .list_live_records()
            .await?
            .into_iter()
            .filter(|r| !r.is_dir() && !r.vaulted && r.path != dir && is_within(&r.path, dir))
            .filter(|r| extension_of(&r.path).is_some_and(|ext| allowed.contains(&ext)))
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let title = if dir == "/" { "/" } else { file_name(dir) };
        let mut out = format!(
            "# Context for {}\n\n> Generated by Eidetic. Includes every tracked text file under {}.\n\n",
            title, dir
        );
        let header_len = out.len();

        for record in files {
            let content = match self.store.read(&record.path, None).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %record.path, error = %e, "Leaving file out of context bundle");
                    continue;
                }
            };
            let Ok(text) = String::from_utf8(content) else {
                continue;
            };
            if out.len() - header_len + text.len() > views.context_max_bytes {
                let _ = writeln!(out, "> Truncated at {} bytes.", views.context_max_bytes);
                break;
            }
            let relative = record.path[dir.len()..].trim_start_matches('/');
            let ext = extension_of(&record.path).unwrap_or_default();
            let _ = write!(out, "## {}\n```{}\n{}\n```\n\n", relative, ext, text.trim_end_matches('\n'));
        }
        Ok(out)
    }
}

fn stored_attr(path: &str, record: &FileRecord, version: Option<&Version>) -> ViewAttr {
    ViewAttr {
        path: path.to_string(),
        kind: record.kind,
        size: if record.is_dir() {
            DIRECTORY_SIZE
        } else {
            version.map_or(0, |v| v.length)
        },
        read_only: false,
        vaulted: record.vaulted,
        file_id: Some(record.file_id),
        version: version.map(|v| v.id),
        created_at: record.created_at,
        modified_at: version.map_or(record.modified_at, |v| v.created_at.max(record.modified_at)),
    }
}

/// Plain `.url` files are resolved through the fetcher. Vaulted ones are
/// served as stored.
fn is_link_candidate(record: &FileRecord) -> bool {
    !record.is_dir() && !record.vaulted && extension_of(&record.path).as_deref() == Some("url")
}

/// The URL a `.url` file points at, when its whole content is one link.
fn link_target(content: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(content).ok()?.trim();
    if text.contains(char::is_whitespace) {
        return None;
    }
    (text.starts_with("http://") || text.starts_with("https://")).then_some(text)
}

fn extension_of(path: &str) -> Option<String> {
    let (stem, ext) = file_name(path).rsplit_once('.')?;
    (!stem.is_empty()).then(|| ext.to_ascii_lowercase())
}

/// Key records by file name; later duplicates get their file id prefixed.
fn unique_names(records: Vec<FileRecord>) -> BTreeMap<String, FileRecord> {
    let mut entries = BTreeMap::new();
    for record in records {
        let name = record.name().to_string();
        let name = if entries.contains_key(&name) {
            format!("{}-{}", record.file_id, name)
        } else {
            name
        };
        entries.insert(name, record);
    }
    entries
}

fn upgrade_notice() -> String {
    "Live API feeds are part of Eidetic Pro.\n\n\
     Set a license key in the environment variable named by spec.license.key_env\n\
     and restart the mount to enable /.magic/api.\n"
        .to_string()
}
