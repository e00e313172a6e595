//! Remote handle lifecycle.
//!
//! Every local open of a file registers one remote handle in the owning
//! inode's [`HandleSet`]. The set is shared by all opens of the same inode
//! and by the writeback path, which owns no handle of its own and borrows a
//! writable one via [`HandleSet::find_writable`]. The last reference to a
//! registered handle triggers the remote close, exactly once.
//!
//! The set's mutex guards registration, scanning and reference bookkeeping
//! only; it is never held across a remote call.

use crate::error::{SfError, SfResult};
use crate::transport::{CreateFlags, RawHandle, RootId, ShareTransport};
use std::sync::{Arc, Mutex};

/// One open instance on the host side.
#[derive(Debug)]
pub struct RemoteHandle {
    pub raw: RawHandle,
    pub root: RootId,
    pub access: CreateFlags,
}

impl RemoteHandle {
    pub fn writable(&self) -> bool {
        self.access.contains(CreateFlags::ACCESS_WRITE)
    }

    pub fn append(&self) -> bool {
        self.access.contains(CreateFlags::ACCESS_APPEND)
    }
}

struct Registered {
    handle: Arc<RemoteHandle>,
    refs: u32,
}

/// A counted reference to a registered handle. Hand it back through
/// [`HandleSet::release`]; dropping it without releasing leaks the remote
/// handle until the inode is evicted.
pub struct HandleRef {
    inner: Arc<RemoteHandle>,
}

impl HandleRef {
    /// Uncounted alias for I/O calls. It does not keep the registration
    /// alive; the owning `HandleRef` must outlive any use of it.
    pub fn share(&self) -> Arc<RemoteHandle> {
        self.inner.clone()
    }
}

impl std::ops::Deref for HandleRef {
    type Target = RemoteHandle;

    fn deref(&self) -> &RemoteHandle {
        &self.inner
    }
}

/// Per-inode set of open remote handles.
#[derive(Default)]
pub struct HandleSet {
    entries: Mutex<Vec<Registered>>,
}

impl HandleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened remote handle with one reference.
    pub fn register(&self, handle: RemoteHandle) -> HandleRef {
        let inner = Arc::new(handle);
        let mut entries = self.entries.lock().unwrap();
        entries.push(Registered {
            handle: inner.clone(),
            refs: 1,
        });
        HandleRef { inner }
    }

    /// Borrow any handle opened with write access, bumping its count.
    ///
    /// A handle whose count already fell to zero has been removed under this
    /// same lock, so it can never be returned after its close was issued.
    pub fn find_writable(&self) -> Option<HandleRef> {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.handle.writable() {
                entry.refs += 1;
                return Some(HandleRef {
                    inner: entry.handle.clone(),
                });
            }
        }
        None
    }

    /// Drop one reference; the 1 -> 0 transition removes the registration and
    /// issues the remote close, after the set lock is gone.
    pub async fn release<T>(&self, href: HandleRef, transport: &T) -> SfResult<()>
    where
        T: ShareTransport + ?Sized,
    {
        let closing = {
            let mut entries = self.entries.lock().unwrap();
            let idx = entries
                .iter()
                .position(|e| Arc::ptr_eq(&e.handle, &href.inner));
            let Some(idx) = idx else {
                log::error!("release of unregistered handle {}", href.raw);
                return Err(SfError::BadHandle);
            };
            entries[idx].refs -= 1;
            if entries[idx].refs == 0 {
                entries.remove(idx);
                true
            } else {
                false
            }
        };

        if closing {
            transport.close(href.root, href.raw).await?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
