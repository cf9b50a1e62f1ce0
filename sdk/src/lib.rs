//! Transparent encryption and directory emulation for flat object storage.
//!
//! Open a [`Connection`] over any [`Backend`] to get a hierarchical file
//! system with optional encryption of paths and contents.

pub mod cache;
pub mod connection;
pub mod crypto;
pub mod engine;
pub mod local;
pub mod pipeline;
pub mod plain;
pub mod storage;

pub use {
    crate::{
        cache::{close_all, flush_all},
        connection::{ConnectOptions, Connection, MirrorResults, RemoveOptions},
        local::LocalBackend,
        storage::{Storage, Visitor},
    },
    cloakfs_protocol::{Backend, ByteStream, LogicalPath, Metadata, NotFound, is_not_found},
};
