// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! NFS Server Implementation
//!
//! Provides a user-space NFSv3 server using the nfsserve crate as transport
//! for the [`OverlayEngine`].
//!
//! ## Component Responsibilities
//! - **OverlayNfsAdapter**: implements `nfsserve::vfs::NFSFileSystem`
//!   - Maps NFSv3 RPCs (LOOKUP, GETATTR, READ, WRITE, READDIR, CREATE, ...)
//!     onto engine operations
//!   - Owns the fileid3 ↔ path table; ids are stable for the lifetime of the
//!     server and follow renames
//!   - Translates engine errors into `nfsstat3`
//!   - WRITE replies carry the buffered size; the engine turns a burst of
//!     WRITEs into one version
//! - **NfsServer**: manages the TCP listener task
//!   - Spawns `NFSTcpListener::handle_forever` on tokio
//!   - Stops by aborting the task
//!   - Health check via `AbortHandle::is_finished()`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nfsserve::nfs::{
    fattr3, fileid3, filename3, ftype3, nfspath3, nfsstat3, nfsstring, nfstime3, sattr3, set_size3, specdata3,
};
use nfsserve::tcp::{NFSTcp, NFSTcpListener};
use nfsserve::vfs::{self, NFSFileSystem};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::application::overlay_engine::{OverlayEngine, OverlayError};
use crate::application::view_resolver::ViewAttr;
use crate::domain::file::FileKind;
use crate::domain::path_sanitizer::join;

/// fileid of the mount root.
const ROOT_FILEID: fileid3 = 1;

/// NFS server errors
#[derive(Debug, Error)]
pub enum NfsServerError {
    #[error("Failed to bind to {address}: {error}")]
    BindFailed { address: String, error: String },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<OverlayError> for nfsstat3 {
    fn from(err: OverlayError) -> Self {
        match err {
            OverlayError::NotFound(_) => nfsstat3::NFS3ERR_NOENT,
            OverlayError::AlreadyExists(_) => nfsstat3::NFS3ERR_EXIST,
            OverlayError::NotADirectory(_) => nfsstat3::NFS3ERR_NOTDIR,
            OverlayError::IsADirectory(_) => nfsstat3::NFS3ERR_ISDIR,
            OverlayError::DirectoryNotEmpty(_) => nfsstat3::NFS3ERR_NOTEMPTY,
            OverlayError::PermissionDenied(_) => nfsstat3::NFS3ERR_ACCES,
            OverlayError::InvalidPath(_) => nfsstat3::NFS3ERR_INVAL,
            OverlayError::ShuttingDown => nfsstat3::NFS3ERR_JUKEBOX,
            OverlayError::Corruption(_)
            | OverlayError::IntegrityFailure(_)
            | OverlayError::Unavailable(_)
            | OverlayError::StoreTransactionFailure(_)
            | OverlayError::Io(_) => nfsstat3::NFS3ERR_IO,
        }
    }
}

/// Bidirectional fileid3 ↔ mount path table.
///
/// NFSv3 clients address files by id only, so every path the server hands
/// out gets an id here. Ids are never reused.
pub struct FileIdTable {
    next_fileid: AtomicU64,
    by_id: RwLock<HashMap<fileid3, String>>,
    by_path: RwLock<HashMap<String, fileid3>>,
}

impl FileIdTable {
    pub fn new() -> Self {
        let mut by_id = HashMap::new();
        let mut by_path = HashMap::new();
        by_id.insert(ROOT_FILEID, "/".to_string());
        by_path.insert("/".to_string(), ROOT_FILEID);
        Self {
            next_fileid: AtomicU64::new(ROOT_FILEID + 1),
            by_id: RwLock::new(by_id),
            by_path: RwLock::new(by_path),
        }
    }

    /// Id for `path`, allocating one on first sight.
    pub fn id_for(&self, path: &str) -> fileid3 {
        if let Some(id) = self.by_path.read().get(path) {
            return *id;
        }
        let mut by_path = self.by_path.write();
        if let Some(id) = by_path.get(path) {
            return *id;
        }
        let id = self.next_fileid.fetch_add(1, Ordering::Relaxed);
        by_path.insert(path.to_string(), id);
        self.by_id.write().insert(id, path.to_string());
        id
    }

    pub fn path_of(&self, id: fileid3) -> Option<String> {
        self.by_id.read().get(&id).cloned()
    }

    /// Forget `path` and everything below it.
    pub fn forget(&self, path: &str) {
        let prefix = format!("{}/", path);
        let mut by_path = self.by_path.write();
        let mut by_id = self.by_id.write();
        by_path.retain(|p, id| {
            let gone = p == path || p.starts_with(&prefix);
            if gone {
                by_id.remove(id);
            }
            !gone
        });
    }

    /// Move `from` and its descendants to `to`, keeping their ids.
    pub fn rename(&self, from: &str, to: &str) {
        self.forget(to);
        let prefix = format!("{}/", from);
        let mut by_path = self.by_path.write();
        let mut by_id = self.by_id.write();
        let moved: Vec<(String, fileid3)> = by_path
            .iter()
            .filter(|(p, _)| p.as_str() == from || p.starts_with(&prefix))
            .map(|(p, id)| (p.clone(), *id))
            .collect();
        for (old, id) in moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            by_path.remove(&old);
            by_path.insert(new.clone(), id);
            by_id.insert(id, new);
        }
    }
}

impl Default for FileIdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter between the nfsserve VFS interface and the overlay engine.
pub struct OverlayNfsAdapter {
    engine: Arc<OverlayEngine>,
    ids: FileIdTable,
    uid: u32,
    gid: u32,
}

impl OverlayNfsAdapter {
    pub fn new(engine: Arc<OverlayEngine>) -> Self {
        let nfs = &engine.context().spec().nfs;
        let (uid, gid) = (nfs.uid, nfs.gid);
        Self {
            engine,
            ids: FileIdTable::new(),
            uid,
            gid,
        }
    }

    fn path(&self, id: fileid3) -> Result<String, nfsstat3> {
        self.ids.path_of(id).ok_or(nfsstat3::NFS3ERR_STALE)
    }

    fn child(&self, dirid: fileid3, name: &filename3) -> Result<(String, String), nfsstat3> {
        let parent = self.path(dirid)?;
        let name = std::str::from_utf8(name).map_err(|_| nfsstat3::NFS3ERR_INVAL)?;
        let path = join(&parent, name);
        Ok((parent, path))
    }

    fn fattr(&self, attr: &ViewAttr) -> fattr3 {
        let fileid = self.ids.id_for(&attr.path);
        let dir = attr.kind == FileKind::Directory;
        let mode = match (dir, attr.read_only) {
            (true, false) => 0o755,
            (true, true) => 0o555,
            (false, false) => 0o644,
            (false, true) => 0o444,
        };
        fattr3 {
            ftype: if dir { ftype3::NF3DIR } else { ftype3::NF3REG },
            mode,
            nlink: if dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            size: attr.size,
            used: attr.size,
            rdev: specdata3 {
                specdata1: 0,
                specdata2: 0,
            },
            fsid: 0,
            fileid,
            atime: nfs_time(attr.modified_at),
            mtime: nfs_time(attr.modified_at),
            ctime: nfs_time(attr.created_at),
        }
    }

    async fn attr_of(&self, path: &str) -> Result<fattr3, nfsstat3> {
        let attr = self.engine.getattr(path).await?;
        Ok(self.fattr(&attr))
    }
}

fn nfs_time(at: DateTime<Utc>) -> nfstime3 {
    nfstime3 {
        seconds: at.timestamp().clamp(0, u32::MAX as i64) as u32,
        nseconds: at.timestamp_subsec_nanos(),
    }
}

#[async_trait::async_trait]
impl NFSFileSystem for OverlayNfsAdapter {
    fn root_dir(&self) -> fileid3 {
        ROOT_FILEID
    }

    fn capabilities(&self) -> vfs::VFSCapabilities {
        vfs::VFSCapabilities::ReadWrite
    }

    async fn lookup(&self, dirid: fileid3, filename: &filename3) -> Result<fileid3, nfsstat3> {
        debug!("NFS LOOKUP: dirid={}, filename={:?}", dirid, filename);
        let parent = self.path(dirid)?;
        let name = std::str::from_utf8(filename).map_err(|_| nfsstat3::NFS3ERR_INVAL)?;
        match name {
            "." => return Ok(dirid),
            ".." => {
                let up = crate::domain::path_sanitizer::parent_of(&parent).to_string();
                return Ok(self.ids.id_for(&up));
            }
            _ => {}
        }
        let attr = self.engine.lookup(&parent, name).await?;
        Ok(self.ids.id_for(&attr.path))
    }

    async fn getattr(&self, id: fileid3) -> Result<fattr3, nfsstat3> {
        debug!("NFS GETATTR: id={}", id);
        let path = self.path(id)?;
        self.attr_of(&path).await
    }

    async fn setattr(&self, id: fileid3, setattr: sattr3) -> Result<fattr3, nfsstat3> {
        debug!("NFS SETATTR: id={}", id);
        let path = self.path(id)?;
        // mode, owner and times are fixed by the mount; only size is honoured
        if let set_size3::size(size) = setattr.size {
            let attr = self.engine.truncate(&path, size).await?;
            return Ok(self.fattr(&attr));
        }
        self.attr_of(&path).await
    }

    async fn read(&self, id: fileid3, offset: u64, count: u32) -> Result<(Vec<u8>, bool), nfsstat3> {
        debug!("NFS READ: id={}, offset={}, count={}", id, offset, count);
        let path = self.path(id)?;
        Ok(self.engine.read(&path, offset, count).await?)
    }

    async fn write(&self, id: fileid3, offset: u64, data: &[u8]) -> Result<fattr3, nfsstat3> {
        debug!("NFS WRITE: id={}, offset={}, len={}", id, offset, data.len());
        let path = self.path(id)?;
        self.engine.write(&path, offset, data).await?;
        self.attr_of(&path).await
    }

    async fn create(&self, dirid: fileid3, filename: &filename3, attr: sattr3) -> Result<(fileid3, fattr3), nfsstat3> {
        debug!("NFS CREATE: dirid={}, filename={:?}", dirid, filename);
        let (_, path) = self.child(dirid, filename)?;
        let created = match self.engine.create(&path).await {
            Ok(created) => created,
            // UNCHECKED create of an existing file keeps its content
            Err(OverlayError::AlreadyExists(_)) => self.engine.getattr(&path).await?,
            Err(e) => return Err(e.into()),
        };
        let created = match attr.size {
            set_size3::size(size) if size != created.size => self.engine.truncate(&path, size).await?,
            _ => created,
        };
        Ok((self.ids.id_for(&created.path), self.fattr(&created)))
    }

    async fn create_exclusive(&self, dirid: fileid3, filename: &filename3) -> Result<fileid3, nfsstat3> {
        debug!("NFS CREATE_EXCLUSIVE: dirid={}, filename={:?}", dirid, filename);
        let (_, path) = self.child(dirid, filename)?;
        let created = self.engine.create(&path).await?;
        Ok(self.ids.id_for(&created.path))
    }

    async fn mkdir(&self, dirid: fileid3, dirname: &filename3) -> Result<(fileid3, fattr3), nfsstat3> {
        debug!("NFS MKDIR: dirid={}, dirname={:?}", dirid, dirname);
        let (_, path) = self.child(dirid, dirname)?;
        let created = self.engine.mkdir(&path).await?;
        Ok((self.ids.id_for(&created.path), self.fattr(&created)))
    }

    async fn remove(&self, dirid: fileid3, filename: &filename3) -> Result<(), nfsstat3> {
        debug!("NFS REMOVE: dirid={}, filename={:?}", dirid, filename);
        let (_, path) = self.child(dirid, filename)?;
        // nfsserve routes both REMOVE and RMDIR here
        match self.engine.unlink(&path).await {
            Err(OverlayError::IsADirectory(_)) => self.engine.rmdir(&path).await?,
            other => other?,
        }
        self.ids.forget(&path);
        Ok(())
    }

    async fn rename(
        &self,
        from_dirid: fileid3,
        from_filename: &filename3,
        to_dirid: fileid3,
        to_filename: &filename3,
    ) -> Result<(), nfsstat3> {
        debug!(
            "NFS RENAME: from_dirid={}, from_filename={:?}, to_dirid={}, to_filename={:?}",
            from_dirid, from_filename, to_dirid, to_filename
        );
        let (_, from) = self.child(from_dirid, from_filename)?;
        let (_, to) = self.child(to_dirid, to_filename)?;
        let renamed = self.engine.rename(&from, &to).await?;
        self.ids.rename(&from, &renamed.path);
        Ok(())
    }

    async fn readdir(
        &self,
        dirid: fileid3,
        start_after: fileid3,
        max_entries: usize,
    ) -> Result<vfs::ReadDirResult, nfsstat3> {
        debug!("NFS READDIR: dirid={}, start_after={}, max={}", dirid, start_after, max_entries);
        let dir = self.path(dirid)?;
        let listing = self.engine.readdir(&dir).await?;

        let names: Vec<String> = listing.into_iter().map(|e| e.name).collect();
        let start = if start_after == 0 {
            0
        } else {
            let resumed = names
                .iter()
                .position(|name| self.ids.path_of(start_after).as_deref() == Some(join(&dir, name).as_str()));
            match resumed {
                Some(idx) => idx + 1,
                None => return Err(nfsstat3::NFS3ERR_BAD_COOKIE),
            }
        };

        let mut entries = Vec::new();
        for name in names.iter().skip(start) {
            if entries.len() >= max_entries {
                break;
            }
            let path = join(&dir, name);
            let attr = match self.engine.getattr(&path).await {
                Ok(attr) => attr,
                // entry vanished between listing and stat
                Err(OverlayError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(vfs::DirEntry {
                fileid: self.ids.id_for(&attr.path),
                name: nfsstring::from(name.as_bytes()),
                attr: self.fattr(&attr),
            });
        }

        let end = start + entries.len() >= names.len();
        Ok(vfs::ReadDirResult { entries, end })
    }

    async fn symlink(
        &self,
        dirid: fileid3,
        linkname: &filename3,
        _symlink: &nfspath3,
        _attr: &sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        debug!("NFS SYMLINK: dirid={}, linkname={:?}", dirid, linkname);
        Err(nfsstat3::NFS3ERR_NOTSUPP)
    }

    async fn readlink(&self, id: fileid3) -> Result<nfspath3, nfsstat3> {
        debug!("NFS READLINK: id={}", id);
        Err(nfsstat3::NFS3ERR_NOTSUPP)
    }
}

/// NFS server managing the nfsserve listener task.
pub struct NfsServer {
    engine: Arc<OverlayEngine>,
    bind_address: String,
    bind_port: u16,
    server_handle: Arc<Mutex<Option<AbortHandle>>>,
}

impl NfsServer {
    pub fn new(engine: Arc<OverlayEngine>, bind_address: impl Into<String>, bind_port: u16) -> Self {
        Self {
            engine,
            bind_address: bind_address.into(),
            bind_port,
            server_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Bind the listener and serve it on a background task.
    pub async fn start(&self) -> Result<(), NfsServerError> {
        let address = format!("{}:{}", self.bind_address, self.bind_port);
        info!("Starting NFS server on {}", address);

        let adapter = OverlayNfsAdapter::new(self.engine.clone());
        let nfs_listener = NFSTcpListener::bind(&address, adapter)
            .await
            .map_err(|e| NfsServerError::BindFailed {
                address: address.clone(),
                error: e.to_string(),
            })?;

        let handle = tokio::spawn(async move {
            info!("NFS server task started");
            if let Err(e) = nfs_listener.handle_forever().await {
                error!("NFS server error: {}", e);
            }
            info!("NFS server task stopped");
        });

        *self.server_handle.lock() = Some(handle.abort_handle());
        info!(
            "NFS server listening; mount with: mount -t nfs -o nfsvers=3,tcp,nolock,port={},mountport={} {}:/ <mountpoint>",
            self.bind_port, self.bind_port, self.bind_address
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), NfsServerError> {
        info!("Stopping NFS server");
        if let Some(handle) = self.server_handle.lock().take() {
            handle.abort();
            info!("NFS server stopped");
        } else {
            warn!("NFS server was not running");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.server_handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn bind_port(&self) -> u16 {
        self.bind_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context::MountContext;
    use crate::application::license::LicenseStatus;
    use crate::domain::events::NullEventPublisher;
    use crate::domain::mount_config::MountSpec;
    use crate::infrastructure::analyzers::builtin_analyzers;
    use crate::infrastructure::image_convert::ImageFormatConverter;
    use crate::infrastructure::web_fetch::HttpLinkFetcher;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn adapter(dir: &TempDir) -> OverlayNfsAdapter {
        let ctx = MountContext::open(
            MountSpec::for_source(dir.path()),
            None,
            LicenseStatus::free("test"),
            Arc::new(NullEventPublisher),
        )
        .await
        .unwrap();
        let engine = OverlayEngine::start(
            Arc::new(ctx),
            builtin_analyzers(),
            Arc::new(HttpLinkFetcher::new(Duration::from_secs(1)).unwrap()),
            Arc::new(ImageFormatConverter::new()),
        )
        .await
        .unwrap();
        OverlayNfsAdapter::new(engine)
    }

    fn name(s: &str) -> filename3 {
        nfsstring::from(s.as_bytes())
    }

    #[test]
    fn test_file_id_table_follows_renames() {
        let table = FileIdTable::new();
        assert_eq!(table.id_for("/"), ROOT_FILEID);
        let dir = table.id_for("/docs");
        let file = table.id_for("/docs/a.txt");
        assert_eq!(table.id_for("/docs/a.txt"), file);

        table.rename("/docs", "/notes");
        assert_eq!(table.path_of(dir).as_deref(), Some("/notes"));
        assert_eq!(table.path_of(file).as_deref(), Some("/notes/a.txt"));
        assert_eq!(table.id_for("/notes/a.txt"), file);

        table.forget("/notes");
        assert!(table.path_of(file).is_none());
        assert!(table.id_for("/notes") > file);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            nfsstat3::from(OverlayError::NotFound("/x".into())) as u32,
            nfsstat3::NFS3ERR_NOENT as u32
        );
        assert_eq!(
            nfsstat3::from(OverlayError::PermissionDenied("/.magic/stats.md".into())) as u32,
            nfsstat3::NFS3ERR_ACCES as u32
        );
        assert_eq!(
            nfsstat3::from(OverlayError::IntegrityFailure("tag".into())) as u32,
            nfsstat3::NFS3ERR_IO as u32
        );
    }

    #[tokio::test]
    async fn test_create_write_read_through_adapter() {
        let dir = TempDir::new().unwrap();
        let fs = adapter(&dir).await;

        let (id, attr) = fs.create(ROOT_FILEID, &name("notes.txt"), sattr3::default()).await.unwrap();
        assert_eq!(attr.size, 0);
        let attr = fs.write(id, 0, b"hello").await.unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(attr.mode, 0o644);

        let (bytes, eof) = fs.read(id, 0, 1024).await.unwrap();
        assert_eq!(bytes, b"hello");
        assert!(eof);
        assert_eq!(fs.lookup(ROOT_FILEID, &name("notes.txt")).await.unwrap(), id);

        let listing = fs.readdir(ROOT_FILEID, 0, 100).await.unwrap();
        assert!(listing.end);
        let names: Vec<String> = listing
            .entries
            .iter()
            .map(|e| String::from_utf8_lossy(&e.name).to_string())
            .collect();
        assert!(names.contains(&".magic".to_string()));
        assert!(names.contains(&"notes.txt".to_string()));
    }

    #[tokio::test]
    async fn test_rename_keeps_fileid() {
        let dir = TempDir::new().unwrap();
        let fs = adapter(&dir).await;

        let (id, _) = fs.create(ROOT_FILEID, &name("a.txt"), sattr3::default()).await.unwrap();
        fs.write(id, 0, b"abc").await.unwrap();
        fs.rename(ROOT_FILEID, &name("a.txt"), ROOT_FILEID, &name("b.txt")).await.unwrap();

        assert_eq!(fs.lookup(ROOT_FILEID, &name("b.txt")).await.unwrap(), id);
        let missing = fs.lookup(ROOT_FILEID, &name("a.txt")).await.unwrap_err();
        assert_eq!(missing as u32, nfsstat3::NFS3ERR_NOENT as u32);
        assert_eq!(fs.read(id, 0, 10).await.unwrap().0, b"abc");
    }

    #[tokio::test]
    async fn test_streamed_write_becomes_one_version() {
        let dir = TempDir::new().unwrap();
        let fs = adapter(&dir).await;

        let (id, _) = fs.create(ROOT_FILEID, &name("stream.log"), sattr3::default()).await.unwrap();
        for i in 0..16u64 {
            let attr = fs.write(id, i * 10, b"0123456789").await.unwrap();
            assert_eq!(attr.size, (i + 1) * 10);
        }
        assert_eq!(fs.getattr(id).await.unwrap().size, 160);

        let history = fs.engine.history("/stream.log").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].length, 160);
    }

    #[tokio::test]
    async fn test_views_are_read_only_over_nfs() {
        let dir = TempDir::new().unwrap();
        let fs = adapter(&dir).await;

        let magic = fs.lookup(ROOT_FILEID, &name(".magic")).await.unwrap();
        let stats = fs.lookup(magic, &name("stats.md")).await.unwrap();
        let attr = fs.getattr(stats).await.unwrap();
        assert_eq!(attr.mode, 0o444);

        let refused = fs.write(stats, 0, b"x").await.unwrap_err();
        assert_eq!(refused as u32, nfsstat3::NFS3ERR_ACCES as u32);
    }

    #[tokio::test]
    async fn test_setattr_size_truncates() {
        let dir = TempDir::new().unwrap();
        let fs = adapter(&dir).await;

        let (id, _) = fs.create(ROOT_FILEID, &name("t.txt"), sattr3::default()).await.unwrap();
        fs.write(id, 0, b"0123456789").await.unwrap();
        let request = sattr3 {
            size: set_size3::size(4),
            ..sattr3::default()
        };
        let attr = fs.setattr(id, request).await.unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(fs.read(id, 0, 100).await.unwrap().0, b"0123");
    }

    #[tokio::test]
    async fn test_remove_handles_directories() {
        let dir = TempDir::new().unwrap();
        let fs = adapter(&dir).await;

        fs.mkdir(ROOT_FILEID, &name("empty")).await.unwrap();
        fs.remove(ROOT_FILEID, &name("empty")).await.unwrap();
        let gone = fs.lookup(ROOT_FILEID, &name("empty")).await.unwrap_err();
        assert_eq!(gone as u32, nfsstat3::NFS3ERR_NOENT as u32);
    }
}
