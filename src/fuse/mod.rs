//! FUSE dispatcher glue.
//!
//! Implements the rfuse3 `Filesystem` trait on top of [`SharedFolderFs`],
//! translating kernel requests into bridge operations and `SfError` values
//! into errnos. File handles returned to the kernel index a table of
//! registered remote handles; directory handles index listing sessions whose
//! snapshot lives for the whole enumeration.
//!
//! Mount setup itself is the embedder's business; this module only provides
//! the request handler.

use crate::dirlist::EntryKind;
use crate::error::SfError;
use crate::fs::{DirSession, OpenOptions, SharedFolderFs};
use crate::handles::HandleRef;
use crate::nls::NAME_MAX;
use crate::transport::{ObjInfo, ShareTransport};
use bytes::Bytes;
use dashmap::DashMap;
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{self, Stream};

const TTL: Duration = Duration::from_secs(1);

struct OpenFile {
    ino: u64,
    handle: HandleRef,
}

pub struct SharefsFuse<T: ShareTransport> {
    fs: Arc<SharedFolderFs<T>>,
    files: DashMap<u64, OpenFile>,
    dirs: DashMap<u64, Arc<tokio::sync::Mutex<DirSession>>>,
    next_fh: AtomicU64,
}

impl<T: ShareTransport> SharefsFuse<T> {
    pub fn new(fs: Arc<SharedFolderFs<T>>) -> Self {
        Self {
            fs,
            files: DashMap::new(),
            dirs: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn inner(&self) -> &Arc<SharedFolderFs<T>> {
        &self.fs
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    fn name_of(name: &OsStr) -> FuseResult<&str> {
        name.to_str().ok_or_else(|| libc::EINVAL.into())
    }

    async fn entry_reply(&self, ino: u64, req: &Request) -> FuseResult<ReplyEntry> {
        let info = self.fs.getattr(ino).await.map_err(errno)?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: file_attr(ino, &info, req),
            generation: 0,
        })
    }

    /// Materialize the session's entries for offset-addressed replies,
    /// with the "." and ".." lines the kernel expects synthesized in front.
    async fn collect_dir(&self, dir_ino: u64, fh: u64) -> FuseResult<Vec<DirectoryEntry>> {
        let Some(session) = self.dirs.get(&fh).map(|e| e.value().clone()) else {
            return Err(libc::EBADF.into());
        };
        let mut session = session.lock().await;
        session.pos = 0;

        let parent_ino = self.fs.parent_of(dir_ino).unwrap_or(crate::fs::ROOT_INO);
        let mut all = vec![
            DirectoryEntry {
                inode: dir_ino,
                kind: FuseFileType::Directory,
                name: OsString::from("."),
                offset: 1,
            },
            DirectoryEntry {
                inode: parent_ino,
                kind: FuseFileType::Directory,
                name: OsString::from(".."),
                offset: 2,
            },
        ];
        let mut next_offset = 3i64;
        self.fs
            .read_dir(&mut session, |name, ino, kind| {
                all.push(DirectoryEntry {
                    inode: ino,
                    kind: fuse_kind(kind),
                    name: OsString::from(name),
                    offset: next_offset,
                });
                next_offset += 1;
                true
            })
            .map_err(errno)?;
        Ok(all)
    }
}

impl<T> Filesystem for SharefsFuse<T>
where
    T: ShareTransport + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let name = Self::name_of(name)?;
        let shadow = self
            .fs
            .lookup(parent, name)
            .await
            .map_err(errno)?
            .ok_or_else(|| rfuse3::Errno::from(libc::ENOENT))?;
        self.entry_reply(shadow.ino, &req).await
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let info = self.fs.getattr(ino).await.map_err(errno)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: file_attr(ino, &info, &req),
        })
    }

    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        if let Some(size) = set_attr.size {
            // The transport has no size-setting call; truncation to zero is
            // expressed through the overwrite open flag.
            if size != 0 {
                return Err(libc::EOPNOTSUPP.into());
            }
            let opts = OpenOptions {
                write: true,
                truncate: true,
                ..Default::default()
            };
            let handle = self.fs.open(ino, &opts).await.map_err(errno)?;
            self.fs.release(ino, handle).await.map_err(errno)?;
        }
        let info = self.fs.getattr(ino).await.map_err(errno)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: file_attr(ino, &info, &req),
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let shadow = self.fs.shadow(ino).map_err(errno)?;
        if shadow.is_dir() {
            return Err(libc::EISDIR.into());
        }
        let opts = open_options(flags);
        let handle = self.fs.open(ino, &opts).await.map_err(errno)?;
        let fh = self.alloc_fh();
        self.files.insert(fh, OpenFile { ino, handle });
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let handle = {
            let Some(open) = self.files.get(&fh) else {
                return Err(libc::EBADF.into());
            };
            open.handle.share()
        };
        let data = self
            .fs
            .read(ino, &handle, offset, size as usize)
            .await
            .map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let handle = {
            let Some(open) = self.files.get(&fh) else {
                return Err(libc::EBADF.into());
            };
            open.handle.share()
        };
        let n = self
            .fs
            .write(ino, &handle, offset, data)
            .await
            .map_err(errno)?;
        if n == 0 && !data.is_empty() {
            return Err(libc::EIO.into());
        }
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn flush(&self, _req: Request, ino: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        self.fs.flush(ino).await.map_err(errno)
    }

    async fn fsync(&self, _req: Request, ino: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        self.fs.flush(ino).await.map_err(errno)
    }

    async fn release(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        let Some((_, open)) = self.files.remove(&fh) else {
            return Err(libc::EBADF.into());
        };
        // The fh table is authoritative for which inode this open belongs to.
        self.fs.release(open.ino, open.handle).await.map_err(errno)
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let name = Self::name_of(name)?;
        let shadow = self.fs.create(parent, name, mode).await.map_err(errno)?;

        let mut opts = open_options(flags);
        opts.create = false;
        opts.truncate = false;
        let handle = self.fs.open(shadow.ino, &opts).await.map_err(errno)?;
        let fh = self.alloc_fh();
        self.files.insert(
            fh,
            OpenFile {
                ino: shadow.ino,
                handle,
            },
        );

        let info = self.fs.getattr(shadow.ino).await.map_err(errno)?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr: file_attr(shadow.ino, &info, &req),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let name = Self::name_of(name)?;
        let shadow = self.fs.mkdir(parent, name, mode).await.map_err(errno)?;
        self.entry_reply(shadow.ino, &req).await
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let name = Self::name_of(name)?;
        self.fs.unlink(parent, name).await.map_err(errno)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let name = Self::name_of(name)?;
        self.fs.rmdir(parent, name).await.map_err(errno)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let name = Self::name_of(name)?;
        let new_name = Self::name_of(new_name)?;
        self.fs
            .rename(parent, name, new_parent, new_name, 0, self.fs.root())
            .await
            .map_err(errno)
    }

    async fn symlink(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let name = Self::name_of(name)?;
        let target = link.to_str().ok_or_else(|| rfuse3::Errno::from(libc::EINVAL))?;
        let shadow = self.fs.symlink(parent, name, target).await.map_err(errno)?;
        self.entry_reply(shadow.ino, &req).await
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let target = self.fs.read_link(ino).await.map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(target.into_bytes()),
        })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let session = self.fs.open_dir(ino).await.map_err(errno)?;
        let fh = self.alloc_fh();
        self.dirs
            .insert(fh, Arc::new(tokio::sync::Mutex::new(session)));
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn releasedir(&self, _req: Request, _ino: u64, fh: u64, _flags: u32) -> FuseResult<()> {
        if self.dirs.remove(&fh).is_none() {
            return Err(libc::EBADF.into());
        }
        Ok(())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let all = self.collect_dir(ino, fh).await?;
        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let plain = self.collect_dir(ino, fh).await?;

        let mut all = Vec::with_capacity(plain.len());
        for entry in plain {
            let attr = if entry.name == "." || entry.name == ".." {
                let info = self.fs.getattr(entry.inode).await.map_err(errno)?;
                file_attr(entry.inode, &info, &req)
            } else {
                // Resolve each child against the host so the kernel gets
                // real attributes, not listing-record leftovers.
                let name = entry.name.to_string_lossy();
                match self.fs.lookup(ino, name.as_ref()).await {
                    Ok(Some(shadow)) => {
                        let info = self.fs.getattr(shadow.ino).await.map_err(errno)?;
                        file_attr(shadow.ino, &info, &req)
                    }
                    // Raced with a remove; skip the entry.
                    _ => continue,
                }
            };
            all.push(DirectoryEntryPlus {
                inode: attr.ino,
                generation: 0,
                kind: attr.kind,
                name: entry.name,
                offset: entry.offset,
                attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = offset as usize;
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: NAME_MAX as u32,
            frsize: 4096,
        })
    }

    async fn forget(&self, _req: Request, _ino: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

// =============== helpers ===============

fn errno(e: SfError) -> rfuse3::Errno {
    e.errno().into()
}

/// Translate kernel open flags into the remote create/open matrix. O_EXCL is
/// deliberately absent: the kernel resolves exclusivity through create().
fn open_options(flags: u32) -> OpenOptions {
    let f = flags as i32;
    let mut opts = OpenOptions {
        mode: 0o644,
        ..Default::default()
    };
    match f & libc::O_ACCMODE {
        libc::O_WRONLY => opts.write = true,
        libc::O_RDWR => {
            opts.read = true;
            opts.write = true;
        }
        _ => opts.read = true,
    }
    if f & libc::O_APPEND != 0 {
        opts.append = true;
    }
    if f & libc::O_CREAT != 0 {
        opts.create = true;
    }
    if f & libc::O_TRUNC != 0 {
        opts.truncate = true;
    }
    opts
}

fn fuse_kind(kind: EntryKind) -> FuseFileType {
    match kind {
        EntryKind::Fifo => FuseFileType::NamedPipe,
        EntryKind::CharDev => FuseFileType::CharDevice,
        EntryKind::Dir => FuseFileType::Directory,
        EntryKind::BlockDev => FuseFileType::BlockDevice,
        EntryKind::Symlink => FuseFileType::Symlink,
        EntryKind::Socket => FuseFileType::Socket,
        EntryKind::File | EntryKind::Whiteout | EntryKind::Unknown => FuseFileType::RegularFile,
    }
}

fn file_attr(ino: u64, info: &ObjInfo, req: &Request) -> FileAttr {
    let mtime = Timestamp::from(info.mtime);
    FileAttr {
        ino,
        size: info.size,
        blocks: info.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind: fuse_kind(crate::dirlist::kind_for_mode(info.mode)),
        perm: info.perm(),
        nlink: 1,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MountOptions, ROOT_INO, SharedFolderFs};
    use crate::transport::RootId;
    use crate::transport::memory::MemoryHost;

    fn req() -> Request {
        Request {
            unique: 1,
            uid: 1000,
            gid: 1000,
            pid: 1,
        }
    }

    #[tokio::test]
    async fn test_release_closes_the_recorded_open_not_the_argument() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"data");
        let fs = Arc::new(
            SharedFolderFs::mount(host, MountOptions::new(RootId(0)))
                .await
                .unwrap(),
        );
        let fuse = SharefsFuse::new(fs.clone());
        let shadow = fs.lookup(ROOT_INO, "f").await.unwrap().unwrap();

        let open = fuse
            .open(req(), shadow.ino, libc::O_RDONLY as u32)
            .await
            .unwrap();
        assert_eq!(fs.transport().open_handle_count(), 1);

        // A forget/rename race can hand release a different inode number;
        // the handle still belongs to the file it was opened on.
        fuse.release(req(), shadow.ino + 100, open.fh, 0, 0, false)
            .await
            .unwrap();
        assert_eq!(fs.transport().open_handle_count(), 0);
    }

    #[test]
    fn test_open_flag_translation() {
        let opts = open_options(libc::O_RDONLY as u32);
        assert!(opts.read && !opts.write && !opts.append);

        let opts = open_options((libc::O_WRONLY | libc::O_APPEND) as u32);
        assert!(!opts.read && opts.write && opts.append);

        let opts = open_options((libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC) as u32);
        assert!(opts.read && opts.write && opts.create && opts.truncate);

        // O_EXCL changes nothing at open time.
        let with_excl = open_options((libc::O_RDWR | libc::O_CREAT | libc::O_EXCL) as u32);
        let without = open_options((libc::O_RDWR | libc::O_CREAT) as u32);
        assert_eq!(with_excl.create, without.create);
        assert_eq!(with_excl.truncate, without.truncate);
    }
}
