//! Hoard daemon: the Storage service on top of [`hoard_net`] and [`hoard_cas`].

mod storage_client;
mod storage_service;

pub use storage_client::StorageClient;
pub use storage_service::{StorageServer, FETCH_NOT_FOUND};
