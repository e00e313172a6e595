//! Page cache and coherence engine.
//!
//! Each file shadow owns one [`PageCache`]. Pages are fixed 4 KiB buffers
//! behind per-page `tokio::sync::Mutex`es; the page mutex is the only lock a
//! page has, taken before any look at content or validity and released on
//! every exit path. Locking the pages that overlap a direct write is also how
//! a direct write waits out in-flight writeback of the same range.
//!
//! Direct I/O bypasses page content entirely; cached reads fill pages one
//! remote round trip per page; mapped writes dirty pages locally and rely on
//! [`PageCache::writepage`] to push them out with a borrowed writable handle.

use crate::error::{SfError, SfResult};
use crate::handles::HandleSet;
use crate::transport::{MAX_RW_COUNT, RawHandle, RootId, ShareTransport};
use bytes::BytesMut;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

pub const PAGE_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Content unknown; the next cached access refetches.
    Invalid,
    Uptodate,
    /// Locally modified, not yet pushed to the host.
    Dirty,
    /// A writeback attempt failed; still dirty, retried by the next flush.
    DirtyError,
    /// The last fill attempt failed; refetched on the next access.
    Error,
}

pub struct Page {
    buf: BytesMut,
    state: PageState,
}

impl Page {
    fn new() -> Self {
        Self {
            buf: BytesMut::zeroed(PAGE_SIZE),
            state: PageState::Invalid,
        }
    }

    fn needs_fill(&self) -> bool {
        matches!(self.state, PageState::Invalid | PageState::Error)
    }

    fn is_dirty(&self) -> bool {
        matches!(self.state, PageState::Dirty | PageState::DirtyError)
    }
}

/// One page-sized remote read; a short result means EOF and the tail is
/// zero-filled, matching what a mapped reader must see past end of file.
async fn fill_page<T>(
    page: &mut Page,
    transport: &T,
    root: RootId,
    handle: RawHandle,
    index: u64,
) -> SfResult<()>
where
    T: ShareTransport + ?Sized,
{
    let offset = index * PAGE_SIZE as u64;
    match transport.read(root, handle, offset, PAGE_SIZE as u32).await {
        Ok(data) => {
            let n = data.len().min(PAGE_SIZE);
            page.buf[..n].copy_from_slice(&data[..n]);
            page.buf[n..].fill(0);
            page.state = PageState::Uptodate;
            Ok(())
        }
        Err(e) => {
            page.state = PageState::Error;
            Err(e)
        }
    }
}

/// Cache-bypassing read: one remote round trip, capped at [`MAX_RW_COUNT`].
/// A short result is returned as-is; the caller advances its offset.
pub async fn read_direct<T>(
    transport: &T,
    root: RootId,
    handle: RawHandle,
    offset: u64,
    len: u32,
) -> SfResult<Vec<u8>>
where
    T: ShareTransport + ?Sized,
{
    transport
        .read(root, handle, offset, len.min(MAX_RW_COUNT))
        .await
}

#[derive(Default)]
pub struct PageCache {
    pages: DashMap<u64, Arc<Mutex<Page>>>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, index: u64) -> Arc<Mutex<Page>> {
        self.pages
            .entry(index)
            .or_insert_with(|| Arc::new(Mutex::new(Page::new())))
            .clone()
    }

    /// Cached read through the page map. `file_size` clamps the visible range;
    /// pages past it are never fetched.
    pub async fn read_cached<T>(
        &self,
        transport: &T,
        root: RootId,
        handle: RawHandle,
        offset: u64,
        len: usize,
        file_size: u64,
    ) -> SfResult<Vec<u8>>
    where
        T: ShareTransport + ?Sized,
    {
        if len == 0 || offset >= file_size {
            return Ok(Vec::new());
        }
        let end = file_size.min(offset.saturating_add(len as u64));
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = pos / PAGE_SIZE as u64;
            let page_off = index * PAGE_SIZE as u64;
            let slot = self.slot(index);
            let mut page = slot.lock().await;
            if page.needs_fill() {
                fill_page(&mut page, transport, root, handle, index).await?;
            }
            let start = (pos - page_off) as usize;
            let stop = ((end - page_off).min(PAGE_SIZE as u64)) as usize;
            out.extend_from_slice(&page.buf[start..stop]);
            pos = page_off + stop as u64;
        }
        Ok(out)
    }

    /// Cache-bypassing write. Locks every cached page overlapping the target
    /// range in index order before the remote call, which serializes against
    /// writeback of those pages; on success the clean overlapping pages are
    /// dropped so mapped readers refetch, and the tracked size is extended if
    /// the write passed EOF. The caller marks the shadow stale.
    pub async fn write_direct<T>(
        &self,
        transport: &T,
        root: RootId,
        handle: RawHandle,
        offset: u64,
        data: &[u8],
        size: &AtomicU64,
    ) -> SfResult<u32>
    where
        T: ShareTransport + ?Sized,
    {
        if data.is_empty() {
            return Ok(0);
        }
        let data = &data[..data.len().min(MAX_RW_COUNT as usize)];
        let first = offset / PAGE_SIZE as u64;
        let last = (offset + data.len() as u64 - 1) / PAGE_SIZE as u64;

        let mut locked = Vec::new();
        for index in first..=last {
            if let Some(slot) = self.pages.get(&index).map(|e| e.value().clone()) {
                locked.push((index, slot.clone().lock_owned().await));
            }
        }

        let written = transport.write(root, handle, offset, data).await?;

        for (index, guard) in locked {
            if !guard.is_dirty() {
                self.pages.remove(&index);
            }
            drop(guard);
        }
        size.fetch_max(offset + written as u64, Ordering::SeqCst);
        Ok(written)
    }

    /// Mapped-write analog: copy into the page and mark it dirty, no remote
    /// call. A partial store into an unknown page fills it first so the rest
    /// of the page is not garbage when it is written back.
    pub async fn write_mapped<T>(
        &self,
        transport: &T,
        root: RootId,
        handle: RawHandle,
        offset: u64,
        data: &[u8],
        size: &AtomicU64,
    ) -> SfResult<()>
    where
        T: ShareTransport + ?Sized,
    {
        let mut pos = 0usize;
        while pos < data.len() {
            let abs = offset + pos as u64;
            let index = abs / PAGE_SIZE as u64;
            let page_off = index * PAGE_SIZE as u64;
            let start = (abs - page_off) as usize;
            let take = (PAGE_SIZE - start).min(data.len() - pos);
            let slot = self.slot(index);
            let mut page = slot.lock().await;
            if take < PAGE_SIZE && page.needs_fill() {
                fill_page(&mut page, transport, root, handle, index).await?;
            }
            page.buf[start..start + take].copy_from_slice(&data[pos..pos + take]);
            page.state = PageState::Dirty;
            pos += take;
        }
        size.fetch_max(offset + data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Commit a buffered edit: copy the sub-range into its pages and push each
    /// sub-range through synchronously with the caller's own handle. A page is
    /// marked Uptodate only when the committed piece covered it whole. A
    /// remote failure stops the walk and reports the bytes committed so far,
    /// zero included.
    pub async fn write_through<T>(
        &self,
        transport: &T,
        root: RootId,
        handle: RawHandle,
        offset: u64,
        data: &[u8],
        size: &AtomicU64,
    ) -> SfResult<usize>
    where
        T: ShareTransport + ?Sized,
    {
        let mut committed = 0usize;
        while committed < data.len() {
            let abs = offset + committed as u64;
            let index = abs / PAGE_SIZE as u64;
            let page_off = index * PAGE_SIZE as u64;
            let start = (abs - page_off) as usize;
            let take = (PAGE_SIZE - start).min(data.len() - committed);
            let slot = self.slot(index);
            let mut page = slot.lock().await;
            let was_known = !page.needs_fill();
            page.buf[start..start + take].copy_from_slice(&data[committed..committed + take]);
            match transport
                .write(root, handle, abs, &data[committed..committed + take])
                .await
            {
                Ok(n) => {
                    let n = n as usize;
                    if start == 0 && n == PAGE_SIZE {
                        page.state = PageState::Uptodate;
                    } else if !was_known {
                        // Partially stored into an unknown page; keep it
                        // refetchable rather than serve a half-filled buffer.
                        page.state = PageState::Invalid;
                    }
                    committed += n;
                    size.fetch_max(abs + n as u64, Ordering::SeqCst);
                    if n < take {
                        break;
                    }
                }
                Err(e) => {
                    if !was_known {
                        page.state = PageState::Invalid;
                    }
                    log::warn!("write-through failed at offset {abs}: {e}");
                    break;
                }
            }
        }
        Ok(committed)
    }

    /// Push one dirty page to the host with a handle borrowed from the set.
    /// The write length is clamped to the current end of file; success leaves
    /// the page Uptodate, failure leaves it DirtyError for a later retry.
    pub async fn writepage<T>(
        &self,
        transport: &T,
        root: RootId,
        handles: &HandleSet,
        index: u64,
        file_size: u64,
    ) -> SfResult<()>
    where
        T: ShareTransport + ?Sized,
    {
        let Some(slot) = self.pages.get(&index).map(|e| e.value().clone()) else {
            return Ok(());
        };
        let mut page = slot.lock().await;
        if !page.is_dirty() {
            return Ok(());
        }
        let page_off = index * PAGE_SIZE as u64;
        if page_off >= file_size {
            // Everything in this page sits past EOF; nothing to push.
            page.state = PageState::Uptodate;
            return Ok(());
        }
        let len = ((file_size - page_off).min(PAGE_SIZE as u64)) as usize;

        let Some(href) = handles.find_writable() else {
            page.state = PageState::DirtyError;
            return Err(SfError::BadHandle);
        };
        let result = transport.write(root, href.raw, page_off, &page.buf[..len]).await;
        let outcome = match result {
            Ok(n) if n as usize == len => {
                page.state = PageState::Uptodate;
                Ok(())
            }
            Ok(n) => {
                log::warn!("short writeback of page {index}: {n} of {len} bytes");
                page.state = PageState::DirtyError;
                Err(SfError::Other)
            }
            Err(e) => {
                page.state = PageState::DirtyError;
                Err(e)
            }
        };
        drop(page);
        handles.release(href, transport).await?;
        outcome
    }

    /// Flush every dirty page, retrying DirtyError pages too. All pages are
    /// attempted; the first failure is reported after the sweep.
    pub async fn flush_all<T>(
        &self,
        transport: &T,
        root: RootId,
        handles: &HandleSet,
        file_size: u64,
    ) -> SfResult<()>
    where
        T: ShareTransport + ?Sized,
    {
        let mut indices: Vec<u64> = self.pages.iter().map(|e| *e.key()).collect();
        indices.sort_unstable();
        let mut first_err = None;
        for index in indices {
            if let Err(e) = self
                .writepage(transport, root, handles, index, file_size)
                .await
            {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop every cached page. Used when the shadow is re-instantiated.
    pub fn invalidate_all(&self) {
        self.pages.clear();
    }

    pub async fn page_state(&self, index: u64) -> Option<PageState> {
        let slot = self.pages.get(&index).map(|e| e.value().clone())?;
        let page = slot.lock().await;
        Some(page.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::RemoteHandle;
    use crate::transport::memory::MemoryHost;
    use crate::transport::{CreateFlags, CreateParams};

    const ROOT: RootId = RootId(0);

    async fn open_rw(host: &MemoryHost, path: &str) -> RawHandle {
        let params = CreateParams {
            flags: CreateFlags::CREATE_IF_NEW
                | CreateFlags::OPEN_IF_EXISTS
                | CreateFlags::ACCESS_READWRITE,
            mode: 0o644,
        };
        host.create(ROOT, path, &params)
            .await
            .unwrap()
            .handle
            .unwrap()
    }

    #[tokio::test]
    async fn test_short_page_read_zero_fills() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"abc");
        let h = open_rw(&host, "/f").await;
        let cache = PageCache::new();

        // Caller believes the file is 6 bytes; the host returns 3. The tail
        // comes back as zeroes, not stale garbage.
        let data = cache.read_cached(&host, ROOT, h, 0, 6, 6).await.unwrap();
        assert_eq!(data, b"abc\0\0\0");
        assert_eq!(cache.page_state(0).await, Some(PageState::Uptodate));
    }

    #[tokio::test]
    async fn test_failed_fill_marks_error_and_recovers() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"hello");
        let h = open_rw(&host, "/f").await;
        let cache = PageCache::new();

        host.set_fail_reads(true);
        assert!(cache.read_cached(&host, ROOT, h, 0, 5, 5).await.is_err());
        assert_eq!(cache.page_state(0).await, Some(PageState::Error));

        host.set_fail_reads(false);
        let data = cache.read_cached(&host, ROOT, h, 0, 5, 5).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_direct_write_invalidates_clean_pages_and_extends_size() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"old content");
        let h = open_rw(&host, "/f").await;
        let cache = PageCache::new();
        let size = AtomicU64::new(11);

        // Populate the page, then write past it directly.
        let data = cache.read_cached(&host, ROOT, h, 0, 11, 11).await.unwrap();
        assert_eq!(data, b"old content");

        let written = cache
            .write_direct(&host, ROOT, h, 4, b"stuff and more", &size)
            .await
            .unwrap();
        assert_eq!(written, 14);
        assert_eq!(size.load(Ordering::SeqCst), 18);
        // The clean page was dropped; the next cached read refetches.
        assert_eq!(cache.page_state(0).await, None);
        let data = cache.read_cached(&host, ROOT, h, 0, 18, 18).await.unwrap();
        assert_eq!(data, b"old stuff and more");
    }

    #[tokio::test]
    async fn test_write_through_failure_commits_zero() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"unchanged");
        let h = open_rw(&host, "/f").await;
        let cache = PageCache::new();
        let size = AtomicU64::new(9);

        host.fail_next_writes(1);
        let committed = cache
            .write_through(&host, ROOT, h, 0, b"clobber", &size)
            .await
            .unwrap();
        assert_eq!(committed, 0);
        assert_eq!(size.load(Ordering::SeqCst), 9);
        assert_eq!(host.file_data("/f").unwrap(), b"unchanged");
    }

    #[tokio::test]
    async fn test_write_through_partial_page_stays_refetchable() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"0123456789");
        let h = open_rw(&host, "/f").await;
        let cache = PageCache::new();
        let size = AtomicU64::new(10);

        let committed = cache
            .write_through(&host, ROOT, h, 2, b"XY", &size)
            .await
            .unwrap();
        assert_eq!(committed, 2);
        assert_eq!(host.file_data("/f").unwrap(), b"01XY456789");
        // The edit covered only part of a never-read page, so the page is not
        // served from cache; a read refetches the merged content.
        assert_eq!(cache.page_state(0).await, Some(PageState::Invalid));
        let data = cache.read_cached(&host, ROOT, h, 0, 10, 10).await.unwrap();
        assert_eq!(data, b"01XY456789");
    }

    #[tokio::test]
    async fn test_writeback_error_is_sticky_until_retried() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"aaaa");
        let h = open_rw(&host, "/f").await;
        let cache = PageCache::new();
        let size = AtomicU64::new(4);
        let handles = HandleSet::new();
        let href = handles.register(RemoteHandle {
            raw: h,
            root: ROOT,
            access: CreateFlags::ACCESS_READWRITE,
        });

        cache
            .write_mapped(&host, ROOT, h, 0, b"bbbb", &size)
            .await
            .unwrap();
        assert_eq!(cache.page_state(0).await, Some(PageState::Dirty));

        host.fail_next_writes(1);
        assert!(cache.flush_all(&host, ROOT, &handles, 4).await.is_err());
        assert_eq!(cache.page_state(0).await, Some(PageState::DirtyError));
        assert_eq!(host.file_data("/f").unwrap(), b"aaaa");

        // Retry succeeds and clears the error state.
        cache.flush_all(&host, ROOT, &handles, 4).await.unwrap();
        assert_eq!(cache.page_state(0).await, Some(PageState::Uptodate));
        assert_eq!(host.file_data("/f").unwrap(), b"bbbb");

        handles.release(href, &host).await.unwrap();
    }

    #[tokio::test]
    async fn test_writepage_clamps_to_eof() {
        let host = MemoryHost::new();
        host.seed_file("/f", b"");
        let h = open_rw(&host, "/f").await;
        let cache = PageCache::new();
        let size = AtomicU64::new(0);
        let handles = HandleSet::new();
        let href = handles.register(RemoteHandle {
            raw: h,
            root: ROOT,
            access: CreateFlags::ACCESS_READWRITE,
        });

        cache
            .write_mapped(&host, ROOT, h, 0, b"tail", &size)
            .await
            .unwrap();
        cache.flush_all(&host, ROOT, &handles, 4).await.unwrap();
        // Only the bytes inside EOF went out, not the whole page.
        assert_eq!(host.file_data("/f").unwrap(), b"tail");

        handles.release(href, &host).await.unwrap();
    }
}
