//! Core bridge operations: lookup, revalidation, open/create, I/O entry
//! points and the mutating operations, all expressed as awaited round trips
//! against the [`ShareTransport`] collaborator.
//!
//! The namespace is a local mirror only: inode numbers, parent/child links
//! and path reconstruction. The host stays authoritative for attributes and
//! existence; everything local is a cache with explicit staleness tracking.

pub mod inode;

use crate::cache;
use crate::dirlist::{DirBuffer, EntryKind};
use crate::error::{PathHint, SfError, SfResult};
use crate::handles::{HandleRef, RemoteHandle};
use crate::nls::{NameCodec, PATH_MAX, Utf8Codec};
use crate::transport::{
    Connection, CreateFlags, CreateOutcome, CreateParams, ObjInfo, RemoveFlags, RenameFlags,
    RootId, ShareTransport,
};
use dashmap::DashMap;
use inode::InodeShadow;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ROOT_INO: u64 = 1;

/// Cached name resolution verdict. Negative entries remember a host miss so
/// repeated lookups of absent names stay local until the TTL expires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dentry {
    Positive(u64),
    Negative,
}

/// Mount-time knobs. The defaults mirror a short-TTL dentry cache; coherence
/// with other writers of the share comes from revalidation, not from push.
pub struct MountOptions {
    pub root: RootId,
    pub dentry_ttl: Duration,
    pub dentry_capacity: u64,
    pub codec: Box<dyn NameCodec>,
}

impl MountOptions {
    pub fn new(root: RootId) -> Self {
        Self {
            root,
            dentry_ttl: Duration::from_secs(1),
            dentry_capacity: 16 * 1024,
            codec: Box::new(Utf8Codec),
        }
    }
}

/// Local open translated to the remote create/open flag matrix. Exclusive
/// create is not expressed here: the dispatcher creates first and then opens,
/// so an exclusivity bit at open time is ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub mode: u32,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    fn create_flags(&self) -> CreateFlags {
        let mut flags = CreateFlags::empty();
        if self.read {
            flags |= CreateFlags::ACCESS_READ;
        }
        if self.write {
            flags |= CreateFlags::ACCESS_WRITE;
        }
        if self.append {
            flags |= CreateFlags::ACCESS_WRITE | CreateFlags::ACCESS_APPEND;
        }
        if self.create {
            flags |= CreateFlags::CREATE_IF_NEW;
        } else {
            flags |= CreateFlags::FAIL_IF_NEW;
        }
        if self.truncate {
            flags |= CreateFlags::OVERWRITE_IF_EXISTS;
        } else {
            flags |= CreateFlags::OPEN_IF_EXISTS;
        }
        flags
    }
}

/// One directory enumeration session: the whole listing snapshot plus the
/// resume cursor. The snapshot never refreshes mid-session.
pub struct DirSession {
    pub ino: u64,
    buffer: DirBuffer,
    pub pos: i64,
}

impl DirSession {
    pub fn total_entries(&self) -> u64 {
        self.buffer.total_entries()
    }
}

struct Node {
    name: String,
    parent: Option<u64>,
    children: HashMap<String, u64>,
}

impl Node {
    fn new(name: String, parent: Option<u64>) -> Self {
        Self {
            name,
            parent,
            children: HashMap::new(),
        }
    }
}

pub struct SharedFolderFs<T: ShareTransport> {
    transport: T,
    conn: Connection,
    codec: Box<dyn NameCodec>,
    nodes: Mutex<HashMap<u64, Node>>,
    shadows: DashMap<u64, Arc<InodeShadow>>,
    dcache: moka::future::Cache<String, Dentry>,
    next_ino: AtomicU64,
}

impl<T: ShareTransport> SharedFolderFs<T> {
    /// Establish the bridge over an already-connected transport. The share
    /// root must stat as a directory or the mount is refused.
    pub async fn mount(transport: T, opts: MountOptions) -> SfResult<Self> {
        let conn = Connection { root: opts.root };
        let info = transport
            .stat(conn.root, "/")
            .await?
            .ok_or(SfError::NotConnected)?;
        let root_shadow = InodeShadow::new(ROOT_INO, info);
        if !root_shadow.is_dir() {
            return Err(SfError::NotADirectory {
                path: PathHint::some("/"),
            });
        }

        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::new("/".into(), None));
        let shadows = DashMap::new();
        shadows.insert(ROOT_INO, Arc::new(root_shadow));

        let dcache = moka::future::Cache::builder()
            .max_capacity(opts.dentry_capacity)
            .time_to_live(opts.dentry_ttl)
            .build();

        Ok(Self {
            transport,
            conn,
            codec: opts.codec,
            nodes: Mutex::new(nodes),
            shadows,
            dcache,
            next_ino: AtomicU64::new(ROOT_INO + 1),
        })
    }

    pub fn root(&self) -> RootId {
        self.conn.root
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn shadow(&self, ino: u64) -> SfResult<Arc<InodeShadow>> {
        self.shadows
            .get(&ino)
            .map(|e| e.value().clone())
            .ok_or(SfError::NotFound {
                path: PathHint::none(),
            })
    }

    /// Reconstruct the host path of a linked inode.
    pub fn path_of(&self, ino: u64) -> SfResult<String> {
        if ino == ROOT_INO {
            return Ok("/".into());
        }
        let nodes = self.nodes.lock().unwrap();
        let mut parts = Vec::new();
        let mut cur = ino;
        while cur != ROOT_INO {
            let node = nodes.get(&cur).ok_or(SfError::NotFound {
                path: PathHint::none(),
            })?;
            parts.push(node.name.clone());
            cur = node.parent.ok_or(SfError::NotFound {
                path: PathHint::none(),
            })?;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    fn child_path(parent_path: &str, name: &str) -> String {
        if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        }
    }

    pub fn parent_of(&self, ino: u64) -> Option<u64> {
        self.nodes.lock().unwrap().get(&ino).and_then(|n| n.parent)
    }

    fn child_ino(&self, parent: u64, name: &str) -> Option<u64> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(&parent).and_then(|n| n.children.get(name)).copied()
    }

    fn dir_shadow(&self, ino: u64) -> SfResult<Arc<InodeShadow>> {
        let shadow = self.shadow(ino)?;
        if !shadow.is_dir() {
            return Err(SfError::NotADirectory {
                path: PathHint::none(),
            });
        }
        Ok(shadow)
    }

    /// Link (or relink) a child and install its shadow. The host attributes
    /// replace whatever was cached.
    fn instantiate(&self, parent: u64, name: &str, info: ObjInfo) -> Arc<InodeShadow> {
        let mut nodes = self.nodes.lock().unwrap();
        let existing = nodes
            .get(&parent)
            .and_then(|n| n.children.get(name))
            .copied();
        if let Some(ino) = existing
            && let Some(shadow) = self.shadows.get(&ino).map(|e| e.value().clone())
        {
            drop(nodes);
            shadow.store_info(info);
            return shadow;
        }

        let ino = existing.unwrap_or_else(|| self.next_ino.fetch_add(1, Ordering::SeqCst));
        let shadow = Arc::new(InodeShadow::new(ino, info));
        nodes.insert(ino, Node::new(name.to_owned(), Some(parent)));
        if let Some(p) = nodes.get_mut(&parent) {
            p.children.insert(name.to_owned(), ino);
        }
        self.shadows.insert(ino, shadow.clone());
        shadow
    }

    /// Drop the namespace link of one child. The shadow survives while open
    /// handles still reference it and is reaped on their final release.
    fn unlink_local(&self, parent: u64, name: &str) {
        let ino = {
            let mut nodes = self.nodes.lock().unwrap();
            let Some(ino) = nodes.get_mut(&parent).and_then(|n| n.children.remove(name)) else {
                return;
            };
            nodes.remove(&ino);
            ino
        };
        self.reap_shadow(ino);
    }

    fn reap_shadow(&self, ino: u64) {
        let unlinked = !self.nodes.lock().unwrap().contains_key(&ino);
        if !unlinked {
            return;
        }
        if let Some(shadow) = self.shadows.get(&ino).map(|e| e.value().clone())
            && shadow.handles.is_empty()
        {
            self.shadows.remove(&ino);
        }
    }

    /// Pull fresh attributes from the host and clear the stale mark, unless a
    /// newer mutation raced the re-stat.
    async fn refresh(&self, shadow: &InodeShadow) -> SfResult<()> {
        let path = self.path_of(shadow.ino)?;
        let token = shadow.freshness.begin_refresh();
        match self.transport.stat(self.conn.root, &path).await? {
            Some(info) => {
                shadow.store_info(info);
                shadow.freshness.finish_refresh(token);
                Ok(())
            }
            None => Err(SfError::not_found(path)),
        }
    }

    // ---- lookup and revalidation ----

    /// Resolve `name` under `parent` against the host. `Ok(None)` is a valid
    /// negative result, cached as such, never an error.
    ///
    /// A live dentry answers without a round trip until its TTL expires;
    /// [`revalidate`](Self::revalidate) is the call that forces a host check.
    pub async fn lookup(&self, parent: u64, name: &str) -> SfResult<Option<Arc<InodeShadow>>> {
        self.codec.encode_name(name)?;
        let parent_shadow = self.dir_shadow(parent)?;
        let path = Self::child_path(&self.path_of(parent_shadow.ino)?, name);

        match self.dcache.get(&path).await {
            Some(Dentry::Negative) => return Ok(None),
            Some(Dentry::Positive(ino)) => {
                // A reaped shadow falls through to a fresh resolution.
                if let Some(shadow) = self.shadows.get(&ino).map(|e| e.value().clone()) {
                    return Ok(Some(shadow));
                }
            }
            None => {}
        }

        match self.transport.stat(self.conn.root, &path).await? {
            None => {
                self.unlink_local(parent, name);
                self.dcache.insert(path, Dentry::Negative).await;
                Ok(None)
            }
            Some(info) => {
                let shadow = self.instantiate(parent, name, info);
                self.dcache
                    .insert(path, Dentry::Positive(shadow.ino))
                    .await;
                Ok(Some(shadow))
            }
        }
    }

    /// Attributes of a linked inode, re-statting first when a locally-known
    /// mutation marked the shadow stale. Concurrent readers are not blocked
    /// by the refresh; they may briefly observe the previous attributes.
    pub async fn getattr(&self, ino: u64) -> SfResult<ObjInfo> {
        let shadow = self.shadow(ino)?;
        if shadow.freshness.needs_refresh() {
            self.refresh(&shadow).await?;
        }
        Ok(shadow.info())
    }

    /// Check a cached resolution against the host. `blocking == false` means
    /// the caller cannot wait on a round trip; the answer is a must-retry
    /// signal, never a guess.
    ///
    /// Returns whether the cached entry is still valid; an invalid entry is
    /// dropped before returning.
    pub async fn revalidate(&self, parent: u64, name: &str, blocking: bool) -> SfResult<bool> {
        if !blocking {
            return Err(SfError::WouldBlock);
        }
        let path = Self::child_path(&self.path_of(parent)?, name);
        let cached = self.dcache.get(&path).await;
        let stat = self.transport.stat(self.conn.root, &path).await?;

        match (cached, stat) {
            (Some(Dentry::Negative), None) => Ok(true),
            (Some(Dentry::Negative), Some(_)) => {
                self.dcache.invalidate(&path).await;
                Ok(false)
            }
            (Some(Dentry::Positive(ino)), Some(info)) => {
                if let Ok(shadow) = self.shadow(ino) {
                    let token = shadow.freshness.begin_refresh();
                    shadow.store_info(info);
                    shadow.freshness.finish_refresh(token);
                }
                Ok(true)
            }
            (Some(Dentry::Positive(_)), None) => {
                self.dcache.invalidate(&path).await;
                self.unlink_local(parent, name);
                Ok(false)
            }
            // Nothing cached to vouch for; the caller re-resolves.
            (None, _) => Ok(false),
        }
    }

    // ---- mutations ----

    pub async fn create(&self, parent: u64, name: &str, mode: u32) -> SfResult<Arc<InodeShadow>> {
        self.create_object(parent, name, mode, CreateFlags::empty())
            .await
    }

    pub async fn mkdir(&self, parent: u64, name: &str, mode: u32) -> SfResult<Arc<InodeShadow>> {
        self.create_object(parent, name, mode, CreateFlags::DIRECTORY)
            .await
    }

    async fn create_object(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        extra: CreateFlags,
    ) -> SfResult<Arc<InodeShadow>> {
        self.codec.encode_name(name)?;
        let parent_shadow = self.dir_shadow(parent)?;
        let path = Self::child_path(&self.path_of(parent)?, name);

        let params = CreateParams {
            flags: extra
                | CreateFlags::CREATE_IF_NEW
                | CreateFlags::FAIL_IF_EXISTS
                | CreateFlags::ACCESS_READWRITE,
            mode,
        };
        let reply = self.transport.create(self.conn.root, &path, &params).await?;
        // The creation handle is transient; callers that want the file open
        // issue their own open afterwards.
        if let Some(raw) = reply.handle {
            self.transport.close(self.conn.root, raw).await?;
        }
        match reply.outcome {
            CreateOutcome::Created => {}
            CreateOutcome::Existed => return Err(SfError::already_exists(path)),
            _ => {
                return Err(SfError::PermissionDenied {
                    path: path.into(),
                });
            }
        }

        let info = reply.info.ok_or(SfError::InvalidData)?;
        let shadow = self.instantiate(parent, name, info);
        // The host may have granted different attributes than requested.
        shadow.freshness.mark_stale();
        parent_shadow.freshness.mark_stale();
        self.dcache.invalidate(&path).await;
        Ok(shadow)
    }

    pub async fn unlink(&self, parent: u64, name: &str) -> SfResult<()> {
        self.remove_object(parent, name, false).await
    }

    pub async fn rmdir(&self, parent: u64, name: &str) -> SfResult<()> {
        self.remove_object(parent, name, true).await
    }

    async fn remove_object(&self, parent: u64, name: &str, dir: bool) -> SfResult<()> {
        self.codec.encode_name(name)?;
        let parent_shadow = self.dir_shadow(parent)?;
        let path = Self::child_path(&self.path_of(parent)?, name);

        let flags = if dir {
            RemoveFlags::DIR
        } else if self.victim_is_symlink(parent, name, &path).await? {
            RemoveFlags::FILE | RemoveFlags::SYMLINK
        } else {
            RemoveFlags::FILE
        };
        self.transport.remove(self.conn.root, &path, flags).await?;

        self.unlink_local(parent, name);
        self.dcache.insert(path, Dentry::Negative).await;
        parent_shadow.freshness.mark_stale();
        Ok(())
    }

    async fn victim_is_symlink(&self, parent: u64, name: &str, path: &str) -> SfResult<bool> {
        if let Some(ino) = self.child_ino(parent, name)
            && let Ok(shadow) = self.shadow(ino)
        {
            return Ok(shadow.is_symlink());
        }
        match self.transport.stat(self.conn.root, path).await? {
            Some(info) => Ok(crate::dirlist::kind_for_mode(info.mode) == EntryKind::Symlink),
            None => Err(SfError::not_found(path)),
        }
    }

    /// Rename within this mount. Semantic flag bits and renames targeting a
    /// different connection are rejected locally before any round trip; the
    /// host never sees them.
    pub async fn rename(
        &self,
        old_parent: u64,
        old_name: &str,
        new_parent: u64,
        new_name: &str,
        flags: u32,
        dest_root: RootId,
    ) -> SfResult<()> {
        if flags != 0 {
            return Err(SfError::InvalidInput);
        }
        if dest_root != self.conn.root {
            return Err(SfError::CrossesDevices);
        }
        self.codec.encode_name(old_name)?;
        self.codec.encode_name(new_name)?;
        let old_parent_shadow = self.dir_shadow(old_parent)?;
        let new_parent_shadow = self.dir_shadow(new_parent)?;
        let old_path = Self::child_path(&self.path_of(old_parent)?, old_name);
        let new_path = Self::child_path(&self.path_of(new_parent)?, new_name);

        let moving_dir = match self.child_ino(old_parent, old_name) {
            Some(ino) => self.shadow(ino)?.is_dir(),
            None => match self.transport.stat(self.conn.root, &old_path).await? {
                Some(info) => crate::dirlist::kind_for_mode(info.mode) == EntryKind::Dir,
                None => return Err(SfError::not_found(old_path)),
            },
        };
        // Directories carry no replace semantics on the wire; the host
        // decides. Plain files ask for POSIX replace behavior.
        let rflags = if moving_dir {
            RenameFlags::empty()
        } else {
            RenameFlags::FILE | RenameFlags::REPLACE_IF_EXISTS
        };

        self.transport
            .rename(self.conn.root, &old_path, &new_path, rflags)
            .await?;

        self.relink(old_parent, old_name, new_parent, new_name);
        old_parent_shadow.freshness.mark_stale();
        new_parent_shadow.freshness.mark_stale();
        self.dcache.invalidate(&old_path).await;
        self.dcache.invalidate(&new_path).await;
        Ok(())
    }

    fn relink(&self, old_parent: u64, old_name: &str, new_parent: u64, new_name: &str) {
        let replaced = {
            let mut nodes = self.nodes.lock().unwrap();
            let Some(ino) = nodes
                .get_mut(&old_parent)
                .and_then(|n| n.children.remove(old_name))
            else {
                return;
            };
            let replaced = nodes
                .get_mut(&new_parent)
                .and_then(|n| n.children.insert(new_name.to_owned(), ino));
            if let Some(node) = nodes.get_mut(&ino) {
                node.name = new_name.to_owned();
                node.parent = Some(new_parent);
            }
            if let Some(old) = replaced {
                nodes.remove(&old);
            }
            replaced
        };
        if let Some(old) = replaced {
            self.reap_shadow(old);
        }
    }

    pub async fn symlink(
        &self,
        parent: u64,
        name: &str,
        target: &str,
    ) -> SfResult<Arc<InodeShadow>> {
        self.codec.encode_name(name)?;
        if target.len() > PATH_MAX {
            return Err(SfError::NameTooLong);
        }
        let parent_shadow = self.dir_shadow(parent)?;
        let path = Self::child_path(&self.path_of(parent)?, name);

        let info = match self.transport.symlink(self.conn.root, &path, target).await {
            // A store without symlink support answers read-only; to the
            // caller that is a permission problem, not a read-only mount.
            Err(SfError::ReadOnlyFilesystem { .. }) => {
                return Err(SfError::PermissionDenied {
                    path: path.into(),
                });
            }
            other => other?,
        };

        let shadow = self.instantiate(parent, name, info);
        shadow.freshness.mark_stale();
        parent_shadow.freshness.mark_stale();
        self.dcache.invalidate(&path).await;
        Ok(shadow)
    }

    pub async fn read_link(&self, ino: u64) -> SfResult<String> {
        let path = self.path_of(ino)?;
        self.transport
            .read_link(self.conn.root, &path, PATH_MAX as u32)
            .await
    }

    // ---- file open and I/O ----

    /// Open a linked regular file. A reply without a handle means the host
    /// refused the flag combination; the outcome tells which way.
    pub async fn open(&self, ino: u64, opts: &OpenOptions) -> SfResult<HandleRef> {
        let shadow = self.shadow(ino)?;
        let path = self.path_of(ino)?;
        let params = CreateParams {
            flags: opts.create_flags(),
            mode: opts.mode,
        };
        let reply = self.transport.create(self.conn.root, &path, &params).await?;
        let Some(raw) = reply.handle else {
            return Err(match reply.outcome {
                CreateOutcome::Existed => SfError::already_exists(path),
                _ => SfError::not_found(path),
            });
        };
        if let Some(info) = reply.info {
            shadow.store_info(info);
        }
        // The open itself may have changed the object (truncation, created
        // anew); force the next getattr to ask the host.
        shadow.freshness.mark_stale();
        Ok(shadow.handles.register(RemoteHandle {
            raw,
            root: self.conn.root,
            access: params.flags.access(),
        }))
    }

    /// Cached read. The visible range is clamped to the tracked size, which
    /// is refreshed first if the shadow is stale.
    pub async fn read(
        &self,
        ino: u64,
        handle: &RemoteHandle,
        offset: u64,
        len: usize,
    ) -> SfResult<Vec<u8>> {
        let shadow = self.shadow(ino)?;
        if shadow.freshness.needs_refresh() {
            self.refresh(&shadow).await?;
        }
        shadow
            .pages
            .read_cached(
                &self.transport,
                self.conn.root,
                handle.raw,
                offset,
                len,
                shadow.size(),
            )
            .await
    }

    /// Cache-bypassing read, one round trip.
    pub async fn read_direct(
        &self,
        handle: &RemoteHandle,
        offset: u64,
        len: u32,
    ) -> SfResult<Vec<u8>> {
        cache::read_direct(&self.transport, self.conn.root, handle.raw, offset, len).await
    }

    /// Buffered write committed through to the host. Append handles write at
    /// the current end of file regardless of `offset`.
    pub async fn write(
        &self,
        ino: u64,
        handle: &RemoteHandle,
        offset: u64,
        data: &[u8],
    ) -> SfResult<usize> {
        let shadow = self.shadow(ino)?;
        let offset = if handle.append() { shadow.size() } else { offset };
        let n = shadow
            .pages
            .write_through(
                &self.transport,
                self.conn.root,
                handle.raw,
                offset,
                data,
                shadow.size_cell(),
            )
            .await?;
        if n > 0 {
            shadow.freshness.mark_stale();
        }
        Ok(n)
    }

    /// Cache-bypassing write; overlapping clean pages are invalidated so
    /// mapped readers refetch.
    pub async fn write_direct(
        &self,
        ino: u64,
        handle: &RemoteHandle,
        offset: u64,
        data: &[u8],
    ) -> SfResult<u32> {
        let shadow = self.shadow(ino)?;
        let offset = if handle.append() { shadow.size() } else { offset };
        let n = shadow
            .pages
            .write_direct(
                &self.transport,
                self.conn.root,
                handle.raw,
                offset,
                data,
                shadow.size_cell(),
            )
            .await?;
        shadow.freshness.mark_stale();
        Ok(n)
    }

    /// Flush dirty pages, then drop this open's handle reference. The flush
    /// happens while the handle is still registered so writeback can borrow
    /// it; a flush failure is reported after the handle is released.
    pub async fn release(&self, ino: u64, handle: HandleRef) -> SfResult<()> {
        let shadow = self.shadow(ino)?;
        let flushed = shadow
            .pages
            .flush_all(
                &self.transport,
                self.conn.root,
                &shadow.handles,
                shadow.size(),
            )
            .await;
        shadow.handles.release(handle, &self.transport).await?;
        self.reap_shadow(ino);
        flushed
    }

    /// Flush without closing, the fsync analog.
    pub async fn flush(&self, ino: u64) -> SfResult<()> {
        let shadow = self.shadow(ino)?;
        shadow
            .pages
            .flush_all(
                &self.transport,
                self.conn.root,
                &shadow.handles,
                shadow.size(),
            )
            .await
    }

    // ---- directory enumeration ----

    /// Open a directory and fetch its listing snapshot. The remote handle is
    /// transient: closed as soon as the chunks are in memory.
    pub async fn open_dir(&self, ino: u64) -> SfResult<DirSession> {
        let shadow = self.dir_shadow(ino)?;
        let path = self.path_of(ino)?;
        let params = CreateParams {
            flags: CreateFlags::DIRECTORY
                | CreateFlags::OPEN_IF_EXISTS
                | CreateFlags::FAIL_IF_NEW
                | CreateFlags::ACCESS_READ,
            mode: 0,
        };
        let reply = self.transport.create(self.conn.root, &path, &params).await?;
        let raw = match (reply.outcome, reply.handle) {
            (CreateOutcome::Existed, Some(raw)) => raw,
            _ => return Err(SfError::not_found(path)),
        };
        if let Some(info) = reply.info {
            shadow.store_info(info);
        }

        let chunks = self.transport.list_dir_all(self.conn.root, raw).await;
        self.transport.close(self.conn.root, raw).await?;
        Ok(DirSession {
            ino,
            buffer: DirBuffer::new(chunks?),
            pos: 0,
        })
    }

    /// Feed listing entries to `emit` from the session cursor onwards. The
    /// cursor stays on a declined entry so the next call resumes there.
    pub fn read_dir<F>(&self, session: &mut DirSession, emit: F) -> SfResult<()>
    where
        F: FnMut(&str, u64, EntryKind) -> bool,
    {
        session
            .buffer
            .iterate(&mut session.pos, self.codec.as_ref(), emit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHost;

    async fn mounted(host: MemoryHost) -> SharedFolderFs<MemoryHost> {
        SharedFolderFs::mount(host, MountOptions::new(RootId(0)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lookup_positive_and_negative() {
        let host = MemoryHost::new();
        host.seed_file("/hello.txt", b"hi");
        let fs = mounted(host).await;

        let shadow = fs.lookup(ROOT_INO, "hello.txt").await.unwrap().unwrap();
        assert!(shadow.is_file());
        assert_eq!(shadow.info().size, 2);

        assert!(fs.lookup(ROOT_INO, "absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_conflict_instantiates_nothing() {
        let host = MemoryHost::new();
        host.seed_file("/taken", b"");
        let fs = mounted(host).await;

        let err = fs.create(ROOT_INO, "taken", 0o644).await;
        assert!(matches!(err, Err(SfError::AlreadyExists { .. })));
        assert!(fs.child_ino(ROOT_INO, "taken").is_none());
        // The refused attempt left no handle open on the host.
        assert_eq!(fs.transport().open_handle_count(), 0);
    }

    #[tokio::test]
    async fn test_create_closes_transient_handle_and_marks_parent_stale() {
        let host = MemoryHost::new();
        let fs = mounted(host).await;

        let shadow = fs.create(ROOT_INO, "new.txt", 0o644).await.unwrap();
        assert!(shadow.freshness.needs_refresh());
        assert_eq!(fs.transport().open_handle_count(), 0);
        assert!(fs.shadow(ROOT_INO).unwrap().freshness.needs_refresh());
    }

    #[tokio::test]
    async fn test_mkdir_and_enumerate() {
        let host = MemoryHost::new();
        let fs = mounted(host).await;

        fs.mkdir(ROOT_INO, "d", 0o755).await.unwrap();
        let dir = fs.lookup(ROOT_INO, "d").await.unwrap().unwrap();
        fs.create(dir.ino, "x", 0o644).await.unwrap();
        fs.create(dir.ino, "y", 0o644).await.unwrap();
        fs.mkdir(dir.ino, "sub", 0o755).await.unwrap();

        let mut session = fs.open_dir(dir.ino).await.unwrap();
        assert_eq!(session.total_entries(), 3);
        let mut seen = Vec::new();
        fs.read_dir(&mut session, |name, ino, kind| {
            seen.push((name.to_owned(), ino, kind));
            true
        })
        .unwrap();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, "sub");
        assert_eq!(seen[0].2, EntryKind::Dir);
        assert_eq!(seen[1].2, EntryKind::File);
        // The directory handle used for the listing is already closed.
        assert_eq!(fs.transport().open_handle_count(), 0);
    }

    #[tokio::test]
    async fn test_unlink_symlink_carries_symlink_flag() {
        let host = MemoryHost::new();
        host.seed_symlink("/link", "/target");
        let fs = mounted(host).await;
        fs.lookup(ROOT_INO, "link").await.unwrap().unwrap();

        // The host refuses a symlink removal without the symlink flag, so
        // success proves the flag was sent.
        fs.unlink(ROOT_INO, "link").await.unwrap();
        assert!(fs.lookup(ROOT_INO, "link").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_flag_selection() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"data");
        host.seed_dir("/d");
        let fs = mounted(host).await;
        fs.lookup(ROOT_INO, "f").await.unwrap().unwrap();
        fs.lookup(ROOT_INO, "d").await.unwrap().unwrap();

        fs.rename(ROOT_INO, "f", ROOT_INO, "f2", 0, RootId(0))
            .await
            .unwrap();
        fs.rename(ROOT_INO, "d", ROOT_INO, "d2", 0, RootId(0))
            .await
            .unwrap();

        let flags = fs.transport().rename_flags_seen();
        assert_eq!(flags[0], RenameFlags::FILE | RenameFlags::REPLACE_IF_EXISTS);
        assert_eq!(flags[1], RenameFlags::empty());

        // Namespace followed the move.
        assert!(fs.lookup(ROOT_INO, "f2").await.unwrap().is_some());
        assert!(fs.lookup(ROOT_INO, "f").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_rejections_happen_before_any_rpc() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"");
        let fs = mounted(host).await;
        fs.lookup(ROOT_INO, "f").await.unwrap().unwrap();

        let err = fs.rename(ROOT_INO, "f", ROOT_INO, "g", 1, RootId(0)).await;
        assert!(matches!(err, Err(SfError::InvalidInput)));
        let err = fs.rename(ROOT_INO, "f", ROOT_INO, "g", 0, RootId(9)).await;
        assert!(matches!(err, Err(SfError::CrossesDevices)));
        assert!(fs.transport().rename_flags_seen().is_empty());
    }

    #[tokio::test]
    async fn test_symlink_unsupported_maps_to_permission_denied() {
        let host = MemoryHost::new();
        host.set_symlink_unsupported(true);
        let fs = mounted(host).await;

        let err = fs.symlink(ROOT_INO, "l", "/t").await;
        assert!(matches!(err, Err(SfError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn test_symlink_and_readlink() {
        let host = MemoryHost::new();
        let fs = mounted(host).await;

        let shadow = fs.symlink(ROOT_INO, "l", "/somewhere").await.unwrap();
        assert!(shadow.is_symlink());
        assert_eq!(fs.read_link(shadow.ino).await.unwrap(), "/somewhere");
    }

    #[tokio::test]
    async fn test_open_truncate_clears_remote_content() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"old bytes");
        let fs = mounted(host).await;
        let shadow = fs.lookup(ROOT_INO, "f").await.unwrap().unwrap();

        let opts = OpenOptions {
            read: true,
            write: true,
            truncate: true,
            ..Default::default()
        };
        let h = fs.open(shadow.ino, &opts).await.unwrap();
        assert_eq!(fs.transport().file_data("/f").unwrap(), b"");
        assert_eq!(fs.getattr(shadow.ino).await.unwrap().size, 0);
        fs.release(shadow.ino, h).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_without_create_is_not_found() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"");
        let fs = mounted(host).await;
        let shadow = fs.lookup(ROOT_INO, "f").await.unwrap().unwrap();
        let ino = shadow.ino;
        // Another writer removes the file behind our back.
        fs.transport().drop_node("/f");

        let err = fs.open(ino, &OpenOptions::read_only()).await;
        assert!(matches!(err, Err(SfError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_append_handle_writes_at_eof() {
        let host = MemoryHost::new();
        host.seed_file("/log", b"start");
        let fs = mounted(host).await;
        let shadow = fs.lookup(ROOT_INO, "log").await.unwrap().unwrap();

        let opts = OpenOptions {
            read: true,
            append: true,
            ..Default::default()
        };
        let h = fs.open(shadow.ino, &opts).await.unwrap();
        // Offset 0 is ignored for an append handle.
        let n = fs.write(shadow.ino, &h, 0, b"+more").await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(fs.transport().file_data("/log").unwrap(), b"start+more");
        fs.release(shadow.ino, h).await.unwrap();
    }

    #[tokio::test]
    async fn test_getattr_refreshes_after_write() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"");
        let fs = mounted(host).await;
        let shadow = fs.lookup(ROOT_INO, "f").await.unwrap().unwrap();

        let h = fs.open(shadow.ino, &OpenOptions::read_write()).await.unwrap();
        fs.write(shadow.ino, &h, 0, b"123456").await.unwrap();
        assert!(shadow.freshness.needs_refresh());

        let info = fs.getattr(shadow.ino).await.unwrap();
        assert_eq!(info.size, 6);
        assert!(!shadow.freshness.needs_refresh());
        fs.release(shadow.ino, h).await.unwrap();
    }

    #[tokio::test]
    async fn test_revalidate_negative_and_positive() {
        let host = MemoryHost::new();
        let fs = mounted(host).await;

        assert!(fs.lookup(ROOT_INO, "ghost").await.unwrap().is_none());
        // Still absent: the negative entry stands.
        assert!(fs.revalidate(ROOT_INO, "ghost", true).await.unwrap());

        // Someone creates it on the host; the negative entry must fall.
        fs.transport().seed_file("/ghost", b"boo");
        assert!(!fs.revalidate(ROOT_INO, "ghost", true).await.unwrap());
        assert!(fs.lookup(ROOT_INO, "ghost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lookup_serves_cached_verdict_within_ttl() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"x");
        let fs = mounted(host).await;

        let first = fs.lookup(ROOT_INO, "f").await.unwrap().unwrap();
        // The file vanishes on the host; the live dentry still answers.
        fs.transport().drop_node("/f");
        let second = fs.lookup(ROOT_INO, "f").await.unwrap().unwrap();
        assert_eq!(second.ino, first.ino);

        // A negative entry is just as sticky until revalidation drops it.
        assert!(fs.lookup(ROOT_INO, "ghost").await.unwrap().is_none());
        fs.transport().seed_file("/ghost", b"boo");
        assert!(fs.lookup(ROOT_INO, "ghost").await.unwrap().is_none());
        assert!(!fs.revalidate(ROOT_INO, "ghost", true).await.unwrap());
        assert!(fs.lookup(ROOT_INO, "ghost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_revalidate_nonblocking_refuses() {
        let host = MemoryHost::new();
        let fs = mounted(host).await;
        let err = fs.revalidate(ROOT_INO, "x", false).await;
        assert!(matches!(err, Err(SfError::WouldBlock)));
    }
}
