//! In-memory shared-folder host, the mock transport for tests and local
//! development. Implements the full [`ShareTransport`] contract including the
//! create/open outcome codes and the packed listing wire format, plus a few
//! fault-injection knobs the coherence tests use.

use super::{
    CreateFlags, CreateOutcome, CreateParams, CreateReply, DirChunk, MAX_RW_COUNT, ObjInfo,
    RawHandle, RemoveFlags, RenameFlags, RootId, ShareTransport, encode_dir_record, mode_for,
};
use crate::error::{PathHint, SfError, SfResult};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::SystemTime;

use super::{OBJ_TYPE_DIRECTORY, OBJ_TYPE_FILE, OBJ_TYPE_SYMLINK, TYPE_MASK, TYPE_SHIFT};

#[derive(Clone)]
struct HostNode {
    mode: u32,
    data: Vec<u8>,
    target: Option<String>,
    mtime: SystemTime,
}

impl HostNode {
    fn dir(perm: u32) -> Self {
        Self {
            mode: mode_for(OBJ_TYPE_DIRECTORY, perm),
            data: Vec::new(),
            target: None,
            mtime: SystemTime::now(),
        }
    }

    fn file(perm: u32) -> Self {
        Self {
            mode: mode_for(OBJ_TYPE_FILE, perm),
            data: Vec::new(),
            target: None,
            mtime: SystemTime::now(),
        }
    }

    fn symlink(target: String) -> Self {
        Self {
            mode: mode_for(OBJ_TYPE_SYMLINK, 0o777),
            data: Vec::new(),
            target: Some(target),
            mtime: SystemTime::now(),
        }
    }

    fn type_code(&self) -> u32 {
        (self.mode & TYPE_MASK) >> TYPE_SHIFT
    }

    fn is_dir(&self) -> bool {
        self.type_code() == OBJ_TYPE_DIRECTORY
    }

    fn is_symlink(&self) -> bool {
        self.type_code() == OBJ_TYPE_SYMLINK
    }

    fn info(&self) -> ObjInfo {
        let size = match &self.target {
            Some(t) => t.len() as u64,
            None => self.data.len() as u64,
        };
        ObjInfo {
            mode: self.mode,
            size,
            mtime: self.mtime,
        }
    }
}

struct OpenHandle {
    path: String,
    access: CreateFlags,
    dir: bool,
}

#[derive(Default)]
struct HostState {
    nodes: BTreeMap<String, HostNode>,
    handles: HashMap<RawHandle, OpenHandle>,
    next_handle: RawHandle,
    closed: Vec<RawHandle>,
    rename_calls: Vec<RenameFlags>,
    write_calls: u64,
    fail_reads: bool,
    fail_next_writes: u32,
    symlink_unsupported: bool,
}

/// In-memory host service. One instance is one shared-folder namespace; the
/// `RootId` passed on each call is accepted as-is.
pub struct MemoryHost {
    state: Mutex<HostState>,
    /// Listing records per chunk; small by default so multi-chunk walks are
    /// exercised even by tiny directories.
    chunk_entries: usize,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        let mut state = HostState {
            next_handle: 1,
            ..Default::default()
        };
        state.nodes.insert("/".into(), HostNode::dir(0o755));
        Self {
            state: Mutex::new(state),
            chunk_entries: 2,
        }
    }

    pub fn with_chunk_entries(mut self, entries: usize) -> Self {
        assert!(entries > 0);
        self.chunk_entries = entries;
        self
    }

    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) => "/",
            Some(n) => &path[..n],
            None => "/",
        }
    }

    // ---- seeding helpers for tests ----

    pub fn seed_dir(&self, path: &str) {
        let mut st = self.state.lock().unwrap();
        st.nodes.insert(path.to_owned(), HostNode::dir(0o755));
    }

    pub fn seed_file(&self, path: &str, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        let mut node = HostNode::file(0o644);
        node.data = data.to_vec();
        st.nodes.insert(path.to_owned(), node);
    }

    pub fn seed_symlink(&self, path: &str, target: &str) {
        let mut st = self.state.lock().unwrap();
        st.nodes
            .insert(path.to_owned(), HostNode::symlink(target.to_owned()));
    }

    // ---- fault injection and inspection ----

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    /// Fail the next `n` write RPCs with a transport error.
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().unwrap().fail_next_writes = n;
    }

    pub fn set_symlink_unsupported(&self, unsupported: bool) {
        self.state.lock().unwrap().symlink_unsupported = unsupported;
    }

    pub fn closed_handles(&self) -> Vec<RawHandle> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn open_handle_count(&self) -> usize {
        self.state.lock().unwrap().handles.len()
    }

    pub fn rename_flags_seen(&self) -> Vec<RenameFlags> {
        self.state.lock().unwrap().rename_calls.clone()
    }

    pub fn write_calls(&self) -> u64 {
        self.state.lock().unwrap().write_calls
    }

    /// Drop a node behind the bridge's back, as another client would.
    pub fn drop_node(&self, path: &str) {
        self.state.lock().unwrap().nodes.remove(path);
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        st.nodes.get(path).map(|n| n.data.clone())
    }

    fn children_of(st: &HostState, path: &str) -> Vec<(String, ObjInfo)> {
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        let mut out = Vec::new();
        for (p, node) in st.nodes.range(prefix.clone()..) {
            if !p.starts_with(&prefix) {
                break;
            }
            let rest = &p[prefix.len()..];
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            out.push((rest.to_owned(), node.info()));
        }
        out
    }
}

#[async_trait]
impl ShareTransport for MemoryHost {
    async fn stat(&self, _root: RootId, path: &str) -> SfResult<Option<ObjInfo>> {
        let st = self.state.lock().unwrap();
        Ok(st.nodes.get(path).map(|n| n.info()))
    }

    async fn create(
        &self,
        _root: RootId,
        path: &str,
        params: &CreateParams,
    ) -> SfResult<CreateReply> {
        let mut st = self.state.lock().unwrap();
        let flags = params.flags;

        if let Some(node) = st.nodes.get(path).cloned() {
            if flags.contains(CreateFlags::FAIL_IF_EXISTS) {
                return Ok(CreateReply {
                    handle: None,
                    outcome: CreateOutcome::Existed,
                    info: Some(node.info()),
                });
            }
            if flags.contains(CreateFlags::DIRECTORY) && !node.is_dir() {
                return Err(SfError::NotADirectory {
                    path: PathHint::some(path),
                });
            }
            if !flags.contains(CreateFlags::DIRECTORY) && node.is_dir() {
                return Err(SfError::IsADirectory {
                    path: PathHint::some(path),
                });
            }
            if flags.contains(CreateFlags::OVERWRITE_IF_EXISTS) {
                let node = st.nodes.get_mut(path).unwrap();
                node.data.clear();
                node.mtime = SystemTime::now();
            }
            let info = st.nodes.get(path).unwrap().info();
            let handle = st.next_handle;
            st.next_handle += 1;
            st.handles.insert(
                handle,
                OpenHandle {
                    path: path.to_owned(),
                    access: flags.access(),
                    dir: flags.contains(CreateFlags::DIRECTORY),
                },
            );
            return Ok(CreateReply {
                handle: Some(handle),
                outcome: CreateOutcome::Existed,
                info: Some(info),
            });
        }

        if !flags.contains(CreateFlags::CREATE_IF_NEW) {
            return Ok(CreateReply {
                handle: None,
                outcome: CreateOutcome::NotFound,
                info: None,
            });
        }

        let parent = Self::parent_of(path);
        match st.nodes.get(parent) {
            Some(p) if p.is_dir() => {}
            _ => {
                return Err(SfError::not_found(parent));
            }
        }

        let perm = params.mode & 0o7777;
        let node = if flags.contains(CreateFlags::DIRECTORY) {
            HostNode::dir(perm)
        } else {
            HostNode::file(perm)
        };
        let info = node.info();
        st.nodes.insert(path.to_owned(), node);
        let handle = st.next_handle;
        st.next_handle += 1;
        st.handles.insert(
            handle,
            OpenHandle {
                path: path.to_owned(),
                access: flags.access(),
                dir: flags.contains(CreateFlags::DIRECTORY),
            },
        );
        Ok(CreateReply {
            handle: Some(handle),
            outcome: CreateOutcome::Created,
            info: Some(info),
        })
    }

    async fn close(&self, _root: RootId, handle: RawHandle) -> SfResult<()> {
        let mut st = self.state.lock().unwrap();
        if st.handles.remove(&handle).is_none() {
            return Err(SfError::BadHandle);
        }
        st.closed.push(handle);
        Ok(())
    }

    async fn read(
        &self,
        _root: RootId,
        handle: RawHandle,
        offset: u64,
        len: u32,
    ) -> SfResult<Vec<u8>> {
        let st = self.state.lock().unwrap();
        if st.fail_reads {
            return Err(SfError::Other);
        }
        let open = st.handles.get(&handle).ok_or(SfError::BadHandle)?;
        let node = st
            .nodes
            .get(&open.path)
            .ok_or_else(|| SfError::not_found(open.path.as_str()))?;
        let len = len.min(MAX_RW_COUNT) as usize;
        let off = offset as usize;
        if off >= node.data.len() {
            return Ok(Vec::new());
        }
        let end = (off + len).min(node.data.len());
        Ok(node.data[off..end].to_vec())
    }

    async fn write(
        &self,
        _root: RootId,
        handle: RawHandle,
        offset: u64,
        data: &[u8],
    ) -> SfResult<u32> {
        let mut st = self.state.lock().unwrap();
        if st.fail_next_writes > 0 {
            st.fail_next_writes -= 1;
            return Err(SfError::Other);
        }
        st.write_calls += 1;
        let open = st.handles.get(&handle).ok_or(SfError::BadHandle)?;
        if !open.access.contains(CreateFlags::ACCESS_WRITE) {
            return Err(SfError::PermissionDenied {
                path: PathHint::some(open.path.as_str()),
            });
        }
        let path = open.path.clone();
        let node = st
            .nodes
            .get_mut(&path)
            .ok_or_else(|| SfError::not_found(path.as_str()))?;
        let take = (data.len() as u32).min(MAX_RW_COUNT) as usize;
        let off = offset as usize;
        if node.data.len() < off + take {
            node.data.resize(off + take, 0);
        }
        node.data[off..off + take].copy_from_slice(&data[..take]);
        node.mtime = SystemTime::now();
        Ok(take as u32)
    }

    async fn remove(&self, _root: RootId, path: &str, flags: RemoveFlags) -> SfResult<()> {
        let mut st = self.state.lock().unwrap();
        let node = st.nodes.get(path).ok_or_else(|| SfError::not_found(path))?;
        if flags.contains(RemoveFlags::DIR) {
            if !node.is_dir() {
                return Err(SfError::NotADirectory {
                    path: PathHint::some(path),
                });
            }
            if !Self::children_of(&st, path).is_empty() {
                return Err(SfError::DirectoryNotEmpty {
                    path: PathHint::some(path),
                });
            }
        } else {
            if node.is_dir() {
                return Err(SfError::IsADirectory {
                    path: PathHint::some(path),
                });
            }
            if node.is_symlink() && !flags.contains(RemoveFlags::SYMLINK) {
                return Err(SfError::InvalidInput);
            }
        }
        st.nodes.remove(path);
        Ok(())
    }

    async fn rename(
        &self,
        _root: RootId,
        old_path: &str,
        new_path: &str,
        flags: RenameFlags,
    ) -> SfResult<()> {
        let mut st = self.state.lock().unwrap();
        st.rename_calls.push(flags);
        let source = st
            .nodes
            .get(old_path)
            .cloned()
            .ok_or_else(|| SfError::not_found(old_path))?;

        if let Some(target) = st.nodes.get(new_path) {
            let replace_file =
                flags.contains(RenameFlags::REPLACE_IF_EXISTS) && !target.is_dir() && !source.is_dir();
            let replace_dir = source.is_dir()
                && target.is_dir()
                && Self::children_of(&st, new_path).is_empty();
            if !(replace_file || replace_dir) {
                return Err(SfError::already_exists(new_path));
            }
            st.nodes.remove(new_path);
        }

        if source.is_dir() {
            let prefix = format!("{old_path}/");
            let moved: Vec<(String, HostNode)> = st
                .nodes
                .range(prefix.clone()..)
                .take_while(|(p, _)| p.starts_with(&prefix))
                .map(|(p, n)| (p.clone(), n.clone()))
                .collect();
            for (p, n) in moved {
                st.nodes.remove(&p);
                let suffix = &p[old_path.len()..];
                st.nodes.insert(format!("{new_path}{suffix}"), n);
            }
        }
        st.nodes.remove(old_path);
        st.nodes.insert(new_path.to_owned(), source);
        Ok(())
    }

    async fn symlink(&self, _root: RootId, path: &str, target: &str) -> SfResult<ObjInfo> {
        let mut st = self.state.lock().unwrap();
        if st.symlink_unsupported {
            return Err(SfError::ReadOnlyFilesystem {
                path: PathHint::some(path),
            });
        }
        if st.nodes.contains_key(path) {
            return Err(SfError::already_exists(path));
        }
        let parent = Self::parent_of(path);
        match st.nodes.get(parent) {
            Some(p) if p.is_dir() => {}
            _ => return Err(SfError::not_found(parent)),
        }
        let node = HostNode::symlink(target.to_owned());
        let info = node.info();
        st.nodes.insert(path.to_owned(), node);
        Ok(info)
    }

    async fn read_link(&self, _root: RootId, path: &str, max_len: u32) -> SfResult<String> {
        let st = self.state.lock().unwrap();
        let node = st.nodes.get(path).ok_or_else(|| SfError::not_found(path))?;
        let target = node.target.as_ref().ok_or(SfError::InvalidInput)?;
        if target.len() > max_len as usize {
            return Err(SfError::NameTooLong);
        }
        Ok(target.clone())
    }

    async fn list_dir_all(&self, _root: RootId, handle: RawHandle) -> SfResult<Vec<DirChunk>> {
        let st = self.state.lock().unwrap();
        let open = st.handles.get(&handle).ok_or(SfError::BadHandle)?;
        if !open.dir {
            return Err(SfError::NotADirectory {
                path: PathHint::some(open.path.as_str()),
            });
        }
        let children = Self::children_of(&st, &open.path);
        let mut chunks = Vec::new();
        for group in children.chunks(self.chunk_entries) {
            let mut buf = BytesMut::new();
            for (name, info) in group {
                // NUL-terminated on the wire, hence name_size = len + 1.
                encode_dir_record(&mut buf, info, name.as_bytes(), name.len() as u16 + 1);
            }
            chunks.push(DirChunk {
                entries: group.len() as u32,
                buf: buf.freeze(),
            });
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> RootId {
        RootId(0)
    }

    #[tokio::test]
    async fn test_create_open_outcomes() {
        let host = MemoryHost::new();
        let params = CreateParams {
            flags: CreateFlags::CREATE_IF_NEW
                | CreateFlags::FAIL_IF_EXISTS
                | CreateFlags::ACCESS_READWRITE,
            mode: mode_for(OBJ_TYPE_FILE, 0o644),
        };
        let reply = host.create(root(), "/a.txt", &params).await.unwrap();
        assert_eq!(reply.outcome, CreateOutcome::Created);
        assert!(reply.handle.is_some());

        // Exclusive create again: existed outcome, no handle.
        let reply = host.create(root(), "/a.txt", &params).await.unwrap();
        assert_eq!(reply.outcome, CreateOutcome::Existed);
        assert!(reply.handle.is_none());

        // Plain open of something missing: not-found outcome, no handle.
        let open = CreateParams {
            flags: CreateFlags::FAIL_IF_NEW | CreateFlags::ACCESS_READ,
            mode: 0,
        };
        let reply = host.create(root(), "/nope", &open).await.unwrap();
        assert_eq!(reply.outcome, CreateOutcome::NotFound);
        assert!(reply.handle.is_none());
    }

    #[tokio::test]
    async fn test_read_write_roundtrip_and_eof() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"");
        let open = CreateParams {
            flags: CreateFlags::FAIL_IF_NEW | CreateFlags::ACCESS_READWRITE,
            mode: 0,
        };
        let h = host
            .create(root(), "/f", &open)
            .await
            .unwrap()
            .handle
            .unwrap();
        assert_eq!(host.write(root(), h, 3, b"xyz").await.unwrap(), 3);
        // Hole is zero-filled, reads past EOF are empty.
        assert_eq!(host.read(root(), h, 0, 16).await.unwrap(), b"\0\0\0xyz");
        assert!(host.read(root(), h, 6, 16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_is_chunked_and_sorted() {
        let host = MemoryHost::new();
        host.seed_dir("/d");
        host.seed_file("/d/b", b"1");
        host.seed_file("/d/a", b"22");
        host.seed_file("/d/c", b"333");
        let open = CreateParams {
            flags: CreateFlags::DIRECTORY
                | CreateFlags::OPEN_IF_EXISTS
                | CreateFlags::FAIL_IF_NEW
                | CreateFlags::ACCESS_READ,
            mode: 0,
        };
        let h = host
            .create(root(), "/d", &open)
            .await
            .unwrap()
            .handle
            .unwrap();
        let chunks = host.list_dir_all(root(), h).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].entries, 2);
        assert_eq!(chunks[1].entries, 1);
    }

    #[tokio::test]
    async fn test_remove_semantics() {
        let host = MemoryHost::new();
        host.seed_dir("/d");
        host.seed_file("/d/f", b"x");
        let err = host.remove(root(), "/d", RemoveFlags::DIR).await;
        assert!(matches!(err, Err(SfError::DirectoryNotEmpty { .. })));
        host.remove(root(), "/d/f", RemoveFlags::FILE).await.unwrap();
        host.remove(root(), "/d", RemoveFlags::DIR).await.unwrap();
    }
}
