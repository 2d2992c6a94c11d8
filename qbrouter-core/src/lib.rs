//! Core of qbrouter: keeps a cold-storage mirror of a hot torrent tree and moves torrents from the
//! hot qBittorrent instance to the cold one once their data is replicated.
//!
//! - [`fs_watch`] watches the hot tree recursively, including directories created later.
//! - [`sync`] batches watch events and drives the mirror (rsync) after an initial full pass.
//! - [`client`] is the torrent-client capability set with WebAPI, caching and in-memory backends.
//! - [`migration`] tags replicated torrents and evicts hard-link groups under space pressure.

pub mod cache;
pub mod client;
pub mod error;
pub mod exec;
pub mod fs_watch;
pub mod migration;
pub mod sync;
pub mod wait;

pub use client::{CachedClient, QbittorrentClient, TorrentClient};
pub use error::{Result, RouterError};
pub use migration::{MigrationConfig, MigrationEngine};
pub use sync::{SyncConfig, SyncEngine};
