//! sharefs: guest-side bridge presenting a remote shared folder as a local
//! directory tree.
//!
//! The bridge translates file-system operations into round trips against a
//! [`transport::ShareTransport`] implementation and reconciles the results
//! with local caches: a page cache per file, an attribute shadow per object
//! and a TTL'd name-resolution cache. The host stays authoritative; every
//! local copy carries explicit staleness tracking.

pub mod cache;
pub mod dirlist;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod handles;
pub mod nls;
pub mod transport;

pub use error::{SfError, SfResult};
pub use fs::{MountOptions, OpenOptions, SharedFolderFs};
pub use fuse::SharefsFuse;
