//! Shared-folder RPC collaborator interface.
//!
//! Everything the bridge knows about the host store goes through
//! [`ShareTransport`]: open/create, close, bounded reads and writes, removal,
//! rename, symlinks and the one-shot directory listing snapshot. The trait is
//! the seam; the crate ships an in-memory host ([`memory::MemoryHost`]) for
//! tests and local development.

pub mod memory;

use crate::error::SfResult;
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::SystemTime;

/// Opaque token for one open instance of a remote object.
pub type RawHandle = u64;

/// "No handle" marker used by the create call to signal a refused open.
pub const HANDLE_NIL: RawHandle = u64::MAX;

/// Hard cap on a single remote read or write. Larger requests are served
/// short and the caller issues another round trip.
pub const MAX_RW_COUNT: u32 = 16 * 1024 * 1024;

/// Identifier of the shared-folder namespace ("root") this mount talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootId(pub u32);

/// Per-mount connection context, immutable after mount, passed explicitly
/// into every operation that issues an RPC.
#[derive(Clone, Copy, Debug)]
pub struct Connection {
    pub root: RootId,
}

bitflags! {
    /// Create/open request flags, the union of action, kind and access bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        const DIRECTORY            = 1 << 0;
        /// Missing object: create it.
        const CREATE_IF_NEW        = 1 << 1;
        /// Missing object: fail with a not-found outcome.
        const FAIL_IF_NEW          = 1 << 2;
        /// Existing object: open it.
        const OPEN_IF_EXISTS       = 1 << 3;
        /// Existing object: fail with an existed outcome.
        const FAIL_IF_EXISTS       = 1 << 4;
        /// Existing object: truncate and open.
        const OVERWRITE_IF_EXISTS  = 1 << 5;
        const ACCESS_READ          = 1 << 8;
        const ACCESS_WRITE         = 1 << 9;
        const ACCESS_APPEND        = 1 << 10;
    }
}

impl CreateFlags {
    pub const ACCESS_READWRITE: CreateFlags =
        CreateFlags::ACCESS_READ.union(CreateFlags::ACCESS_WRITE);

    /// Access bits only, the part a registered handle remembers.
    pub fn access(self) -> CreateFlags {
        self & (CreateFlags::ACCESS_READ | CreateFlags::ACCESS_WRITE | CreateFlags::ACCESS_APPEND)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RemoveFlags: u32 {
        const FILE    = 1 << 0;
        const DIR     = 1 << 1;
        const SYMLINK = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RenameFlags: u32 {
        /// The object being renamed is a plain file.
        const FILE              = 1 << 0;
        const REPLACE_IF_EXISTS = 1 << 1;
    }
}

/// Remote object type codes carried in the mode word, bits 12..16.
pub const TYPE_SHIFT: u32 = 12;
pub const TYPE_MASK: u32 = 0xF000;

pub const OBJ_TYPE_FIFO: u32 = 1;
pub const OBJ_TYPE_CHAR_DEV: u32 = 2;
pub const OBJ_TYPE_DIRECTORY: u32 = 3;
pub const OBJ_TYPE_BLOCK_DEV: u32 = 4;
pub const OBJ_TYPE_FILE: u32 = 5;
pub const OBJ_TYPE_SYMLINK: u32 = 6;
pub const OBJ_TYPE_SOCKET: u32 = 7;
pub const OBJ_TYPE_WHITEOUT: u32 = 8;

/// Build a mode word from a type code and permission bits.
pub fn mode_for(type_code: u32, perm: u32) -> u32 {
    (type_code << TYPE_SHIFT) | (perm & 0o7777)
}

/// Remote attributes as the host reports them.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjInfo {
    pub mode: u32,
    pub size: u64,
    pub mtime: SystemTime,
}

impl ObjInfo {
    pub fn new(type_code: u32, perm: u32, size: u64) -> Self {
        Self {
            mode: mode_for(type_code, perm),
            size,
            mtime: SystemTime::now(),
        }
    }

    pub fn type_code(&self) -> u32 {
        (self.mode & TYPE_MASK) >> TYPE_SHIFT
    }

    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }
}

/// Host verdict on a create/open request, distinct from transport errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Existed,
    NotFound,
}

#[derive(Clone, Debug)]
pub struct CreateParams {
    pub flags: CreateFlags,
    pub mode: u32,
}

#[derive(Clone, Debug)]
pub struct CreateReply {
    /// `None` when the host refused to open (check `outcome` for why).
    pub handle: Option<RawHandle>,
    pub outcome: CreateOutcome,
    /// Attributes of the resulting object; the host is authoritative and may
    /// have granted something different from what was requested.
    pub info: Option<ObjInfo>,
}

/// One chunk of a directory listing snapshot: a packed run of
/// variable-length records plus the number of records it holds.
#[derive(Clone, Debug)]
pub struct DirChunk {
    pub entries: u32,
    pub buf: Bytes,
}

/// Directory record header: `size: u64 | mode: u32 | name_len: u16 |
/// name_size: u16`, little endian, immediately followed by `name_size` name
/// bytes. No padding between records; each record's stride is
/// `RECORD_HEADER_LEN + name_size` and must be computed per record.
pub const RECORD_HEADER_LEN: usize = 16;

/// Append one listing record to `out` in the wire layout above.
/// `name_size` may exceed the name length to carry NUL padding.
pub fn encode_dir_record(out: &mut BytesMut, info: &ObjInfo, name: &[u8], name_size: u16) {
    debug_assert!(name.len() <= name_size as usize);
    out.put_u64_le(info.size);
    out.put_u32_le(info.mode);
    out.put_u16_le(name.len() as u16);
    out.put_u16_le(name_size);
    out.put_slice(name);
    out.put_bytes(0, name_size as usize - name.len());
}

/// RPC surface of the shared-folder host service. Every call is one blocking
/// round trip on the calling task; cancellation and timeouts, if any, live in
/// the implementation, not here.
#[async_trait]
pub trait ShareTransport: Send + Sync {
    /// Stat by path. `Ok(None)` means the path does not exist, which is not
    /// an error at this layer.
    async fn stat(&self, root: RootId, path: &str) -> SfResult<Option<ObjInfo>>;

    /// Combined create/open. The outcome code reports what the host actually
    /// did; transport errors are reserved for the call itself failing.
    async fn create(&self, root: RootId, path: &str, params: &CreateParams)
    -> SfResult<CreateReply>;

    /// Release a handle on the host side.
    async fn close(&self, root: RootId, handle: RawHandle) -> SfResult<()>;

    /// Read up to `len` bytes; fewer may come back, zero bytes means EOF.
    async fn read(&self, root: RootId, handle: RawHandle, offset: u64, len: u32)
    -> SfResult<Vec<u8>>;

    /// Write `data` at `offset`; returns the number of bytes accepted.
    async fn write(&self, root: RootId, handle: RawHandle, offset: u64, data: &[u8])
    -> SfResult<u32>;

    async fn remove(&self, root: RootId, path: &str, flags: RemoveFlags) -> SfResult<()>;

    async fn rename(
        &self,
        root: RootId,
        old_path: &str,
        new_path: &str,
        flags: RenameFlags,
    ) -> SfResult<()>;

    async fn symlink(&self, root: RootId, path: &str, target: &str) -> SfResult<ObjInfo>;

    async fn read_link(&self, root: RootId, path: &str, max_len: u32) -> SfResult<String>;

    /// Fetch the complete listing of an open directory in one snapshot.
    async fn list_dir_all(&self, root: RootId, handle: RawHandle) -> SfResult<Vec<DirChunk>>;
}
