//! # burrow-fs
//!
//! The burrow filesystem: an in-memory tree of directory, file and symlink
//! nodes mirrored to a versioned metadata store, with file content chunked
//! into a content-addressed blob store. Every kernel-visible mutation is
//! all-or-nothing: if the remote commit fails, the in-memory change is
//! rolled back and the caller sees `EIO`.

pub mod config;
mod fuse;
mod inogen;
pub mod node;

pub use fuse::BurrowFs;
pub use inogen::InodeGenerator;
pub use node::{
    AttrChanges, DirEntry, Errno, Node, NodeAttr, NodeFactory, NodeKey, NODE_KEY_LEN, ROOT_INO,
    ROOT_KEY,
};
