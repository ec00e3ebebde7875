//! sbx-storage: remote object store behind the `StorageClient` trait
//!
//! The reference implementation wraps an OpenDAL operator (S3, WebDAV, or
//! the in-memory service used by tests).

pub mod client;
pub mod health;
pub mod operator;

pub use client::{
    map_opendal_error, OpendalStorage, RemoteEntry, StorageClient, TransferProgress, UploadMode,
};
pub use health::{check_health, is_healthy};
pub use operator::{build_operator, StorageCredentials};
