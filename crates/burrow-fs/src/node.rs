//! The transactional node engine.
//!
//! Nodes form an in-memory tree mirrored to the versioned metadata store.
//! Every mutating operation snapshots what it is about to change, mutates,
//! commits the touched records at `version + 1`, and on any commit failure
//! restores the snapshot — so after a failed operation the in-memory tree
//! equals the last committed tree, and the caller sees `EIO`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use burrow_proto::Message;
use burrow_store::{BlobStore, BlockHash, StoreError, VersionedStore, BLOCK_SIZE};

use crate::inogen::InodeGenerator;

pub const NODE_KEY_LEN: usize = 16;
pub type NodeKey = [u8; NODE_KEY_LEN];
pub const ROOT_KEY: NodeKey = [0u8; NODE_KEY_LEN];
pub const ROOT_INO: u64 = 1;

/// Errno as the kernel bridge expects it.
pub type Errno = libc::c_int;

const BS: u64 = BLOCK_SIZE as u64;

pub mod mode {
    pub const TYPE_MASK: u32 = 0o170000;
    pub const DIRECTORY: u32 = 0o040000;
    pub const REGULAR: u32 = 0o100000;
    pub const SYMLINK: u32 = 0o120000;

    pub fn is_dir(mode: u32) -> bool {
        mode & TYPE_MASK == DIRECTORY
    }

    pub fn is_regular(mode: u32) -> bool {
        mode & TYPE_MASK == REGULAR
    }

    pub fn is_symlink(mode: u32) -> bool {
        mode & TYPE_MASK == SYMLINK
    }
}

/// One filesystem object. The key and inode number never change; all
/// mutable state sits behind the per-node mutex. `loaded` is outside the
/// mutex so a broadcast can invalidate a node without taking its lock.
#[derive(Debug)]
pub struct Node {
    pub key: NodeKey,
    pub ino: u64,
    loaded: AtomicBool,
    state: Mutex<NodeState>,
}

impl Node {
    fn stub(key: NodeKey, ino: u64) -> Node {
        Node {
            key,
            ino,
            loaded: AtomicBool::new(false),
            state: Mutex::new(NodeState::default()),
        }
    }
}

#[derive(Default, Debug)]
pub struct NodeState {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub size: u64,
    pub version: u64,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub children: BTreeMap<String, Arc<Node>>,
    pub blocks: Vec<BlockHash>,
    pub target: Vec<u8>,
}

/// Serialized form of a node's metadata record. The version is not part of
/// the record; it belongs to the versioned store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct NodeRecord {
    mode: u32,
    uid: u32,
    gid: u32,
    atime: u64,
    mtime: u64,
    ctime: u64,
    size: u64,
    xattrs: BTreeMap<String, Vec<u8>>,
    children: Vec<(String, NodeKey)>,
    blocks: Vec<BlockHash>,
    target: Vec<u8>,
}

impl NodeRecord {
    fn from_state(st: &NodeState) -> NodeRecord {
        NodeRecord {
            mode: st.mode,
            uid: st.uid,
            gid: st.gid,
            atime: st.atime,
            mtime: st.mtime,
            ctime: st.ctime,
            size: st.size,
            xattrs: st.xattrs.clone(),
            children: st
                .children
                .iter()
                .map(|(name, child)| (name.clone(), child.key))
                .collect(),
            blocks: st.blocks.clone(),
            target: st.target.clone(),
        }
    }
}

/// Attribute view handed to the kernel bridge.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// Requested attribute changes for `setattr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

/// One readdir entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub mode: u32,
}

pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn store_errno(e: &StoreError) -> Errno {
    if e.is_not_found() {
        libc::ENOENT
    } else {
        libc::EIO
    }
}

// Everything an operation may need to put back.
struct AttrSnapshot {
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    atime: u64,
    mtime: u64,
    ctime: u64,
    blocks: Vec<BlockHash>,
}

impl AttrSnapshot {
    fn take(st: &NodeState) -> AttrSnapshot {
        AttrSnapshot {
            mode: st.mode,
            uid: st.uid,
            gid: st.gid,
            size: st.size,
            atime: st.atime,
            mtime: st.mtime,
            ctime: st.ctime,
            blocks: st.blocks.clone(),
        }
    }

    fn restore(self, st: &mut NodeState) {
        st.mode = self.mode;
        st.uid = self.uid;
        st.gid = self.gid;
        st.size = self.size;
        st.atime = self.atime;
        st.mtime = self.mtime;
        st.ctime = self.ctime;
        st.blocks = self.blocks;
    }
}

/// Builds nodes and carries every operation of the kernel interface.
pub struct NodeFactory {
    metadata: Arc<dyn VersionedStore>,
    blobs: BlobStore,
    inodes: InodeGenerator,
    registry: StdMutex<HashMap<NodeKey, Weak<Node>>>,
}

impl NodeFactory {
    pub fn new(metadata: Arc<dyn VersionedStore>, blobs: BlobStore) -> Arc<NodeFactory> {
        Arc::new(NodeFactory {
            metadata,
            blobs,
            inodes: InodeGenerator::start(),
            registry: StdMutex::new(HashMap::new()),
        })
    }

    pub fn stop(&self) {
        self.inodes.stop();
    }

    /// Load the root directory, creating and committing an empty one the
    /// first time a store is used.
    pub async fn bootstrap(&self, uid: u32, gid: u32) -> Result<Arc<Node>, StoreError> {
        let root = Arc::new(Node::stub(ROOT_KEY, ROOT_INO));
        self.register(&root);
        let mut st = root.state.lock().await;
        match self.metadata.get(&ROOT_KEY).await {
            Ok((version, bytes)) => {
                let record = decode_record(&bytes)?;
                self.apply_record(&mut st, record, version).await?;
            }
            Err(e) if e.is_not_found() => {
                let now = now_nanos();
                st.mode = mode::DIRECTORY | 0o755;
                st.uid = uid;
                st.gid = gid;
                st.atime = now;
                st.mtime = now;
                st.ctime = now;
                self.commit(&ROOT_KEY, &mut st).await?;
            }
            Err(e) => return Err(e),
        }
        drop(st);
        root.loaded.store(true, Ordering::Release);
        Ok(root)
    }

    /// Drop a node's loaded state in response to a broadcast, so the next
    /// access re-reads the (already refreshed) local cache.
    pub fn apply_broadcast(&self, m: &Message) {
        let Message::Put { key, .. } = m else { return };
        let Ok(key) = NodeKey::try_from(key.as_slice()) else {
            return;
        };
        let node = self.registry.lock().unwrap().get(&key).and_then(Weak::upgrade);
        if let Some(node) = node {
            debug!(ino = node.ino, "Invalidating node after broadcast");
            node.loaded.store(false, Ordering::Release);
        }
    }

    fn register(&self, node: &Arc<Node>) {
        self.registry
            .lock()
            .unwrap()
            .insert(node.key, Arc::downgrade(node));
    }

    async fn node_for_key(&self, key: NodeKey) -> Result<Arc<Node>, StoreError> {
        if let Some(node) = self.registry.lock().unwrap().get(&key).and_then(Weak::upgrade) {
            return Ok(node);
        }
        let ino = self
            .inodes
            .next()
            .await
            .ok_or_else(|| StoreError::Transport("inode generator stopped".into()))?;
        let node = Arc::new(Node::stub(key, ino));
        let mut registry = self.registry.lock().unwrap();
        if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        registry.insert(key, Arc::downgrade(&node));
        Ok(node)
    }

    /// Fill a stub (or invalidated) node from the metadata store.
    async fn load(&self, node: &Arc<Node>) -> Result<(), StoreError> {
        if node.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut st = node.state.lock().await;
        if node.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let (version, bytes) = self.metadata.get(&node.key).await?;
        let record = decode_record(&bytes)?;
        self.apply_record(&mut st, record, version).await?;
        node.loaded.store(true, Ordering::Release);
        Ok(())
    }

    async fn apply_record(
        &self,
        st: &mut NodeState,
        record: NodeRecord,
        version: u64,
    ) -> Result<(), StoreError> {
        let mut children = BTreeMap::new();
        for (name, key) in record.children {
            children.insert(name, self.node_for_key(key).await?);
        }
        st.mode = record.mode;
        st.uid = record.uid;
        st.gid = record.gid;
        st.atime = record.atime;
        st.mtime = record.mtime;
        st.ctime = record.ctime;
        st.size = record.size;
        st.version = version;
        st.xattrs = record.xattrs;
        st.children = children;
        st.blocks = record.blocks;
        st.target = record.target;
        Ok(())
    }

    /// Serialize and write one node's record at the next version.
    async fn commit(&self, key: &NodeKey, st: &mut NodeState) -> Result<(), StoreError> {
        let record = NodeRecord::from_state(st);
        let bytes = bincode::serialize(&record)
            .map_err(|e| StoreError::Protocol(format!("could not encode node record: {e}")))?;
        self.metadata.put(st.version + 1, key, &bytes).await?;
        st.version += 1;
        Ok(())
    }

    fn attr_of(node: &Node, st: &NodeState) -> NodeAttr {
        NodeAttr {
            ino: node.ino,
            mode: st.mode,
            uid: st.uid,
            gid: st.gid,
            size: st.size,
            atime: st.atime,
            mtime: st.mtime,
            ctime: st.ctime,
        }
    }

    // ---- pure reads ------------------------------------------------------

    pub async fn lookup(&self, parent: &Arc<Node>, name: &str) -> Result<Arc<Node>, Errno> {
        self.load(parent).await.map_err(|e| store_errno(&e))?;
        let child = {
            let st = parent.state.lock().await;
            st.children.get(name).cloned()
        };
        let child = child.ok_or(libc::ENOENT)?;
        match self.load(&child).await {
            Ok(()) => Ok(child),
            // The parent names a child whose record is gone; report absence
            // rather than an i/o error so the tree stays navigable.
            Err(e) if e.is_not_found() => Err(libc::ENOENT),
            Err(e) => Err(store_errno(&e)),
        }
    }

    pub async fn getattr(&self, node: &Arc<Node>) -> Result<NodeAttr, Errno> {
        self.load(node).await.map_err(|e| store_errno(&e))?;
        let st = node.state.lock().await;
        Ok(Self::attr_of(node, &st))
    }

    pub async fn readlink(&self, node: &Arc<Node>) -> Result<Vec<u8>, Errno> {
        self.load(node).await.map_err(|e| store_errno(&e))?;
        let st = node.state.lock().await;
        if !mode::is_symlink(st.mode) {
            return Err(libc::EINVAL);
        }
        Ok(st.target.clone())
    }

    pub async fn readdir(&self, dir: &Arc<Node>) -> Result<Vec<DirEntry>, Errno> {
        self.load(dir).await.map_err(|e| store_errno(&e))?;
        let children: Vec<(String, Arc<Node>)> = {
            let st = dir.state.lock().await;
            if !mode::is_dir(st.mode) {
                return Err(libc::ENOTDIR);
            }
            st.children
                .iter()
                .map(|(name, child)| (name.clone(), child.clone()))
                .collect()
        };
        let mut entries = Vec::with_capacity(children.len());
        for (name, child) in children {
            if let Err(e) = self.load(&child).await {
                warn!(name = %name, error = %e, "Skipping unloadable child");
                continue;
            }
            let st = child.state.lock().await;
            entries.push(DirEntry {
                name,
                ino: child.ino,
                mode: st.mode,
            });
        }
        Ok(entries)
    }

    pub async fn getxattr(&self, node: &Arc<Node>, name: &str) -> Result<Vec<u8>, Errno> {
        self.load(node).await.map_err(|e| store_errno(&e))?;
        let st = node.state.lock().await;
        st.xattrs.get(name).cloned().ok_or(libc::ENODATA)
    }

    pub async fn listxattr(&self, node: &Arc<Node>) -> Result<Vec<String>, Errno> {
        self.load(node).await.map_err(|e| store_errno(&e))?;
        let st = node.state.lock().await;
        Ok(st.xattrs.keys().cloned().collect())
    }

    // ---- mutations -------------------------------------------------------

    async fn create_node(
        &self,
        parent: &Arc<Node>,
        name: &str,
        node_mode: u32,
        uid: u32,
        gid: u32,
        init: impl FnOnce(&mut NodeState),
    ) -> Result<Arc<Node>, Errno> {
        self.load(parent).await.map_err(|e| store_errno(&e))?;
        let mut pst = parent.state.lock().await;
        if !mode::is_dir(pst.mode) {
            return Err(libc::ENOTDIR);
        }
        if pst.children.contains_key(name) {
            return Err(libc::EEXIST);
        }
        let ino = self.inodes.next().await.ok_or(libc::EIO)?;
        let key: NodeKey = rand::random();
        let child = Arc::new(Node::stub(key, ino));
        {
            // Child first: it is invisible until the parent commits.
            let mut cst = child.state.lock().await;
            let now = now_nanos();
            cst.mode = node_mode;
            cst.uid = uid;
            cst.gid = gid;
            cst.atime = now;
            cst.mtime = now;
            cst.ctime = now;
            init(&mut cst);
            if let Err(e) = self.commit(&key, &mut cst).await {
                // Parent untouched; the child never existed.
                return Err(store_errno(&e));
            }
        }
        child.loaded.store(true, Ordering::Release);
        self.register(&child);

        let parent_times = (pst.mtime, pst.ctime);
        pst.children.insert(name.to_owned(), child.clone());
        let now = now_nanos();
        pst.mtime = now;
        pst.ctime = now;
        if let Err(e) = self.commit(&parent.key, &mut pst).await {
            pst.children.remove(name);
            (pst.mtime, pst.ctime) = parent_times;
            self.scrub_orphan(&child).await;
            return Err(store_errno(&e));
        }
        Ok(child)
    }

    /// Best-effort removal of a committed child whose parent link never
    /// made it. The store has no delete, so the record is overwritten with
    /// an empty tombstone; leftovers are tolerated.
    async fn scrub_orphan(&self, child: &Arc<Node>) {
        let st = child.state.lock().await;
        if let Err(e) = self.metadata.put(st.version + 1, &child.key, &[]).await {
            debug!(error = %e, "Could not scrub orphan node record");
        }
    }

    pub async fn mkdir(
        &self,
        parent: &Arc<Node>,
        name: &str,
        perm: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Node>, Errno> {
        self.create_node(parent, name, mode::DIRECTORY | (perm & 0o7777), uid, gid, |_| {})
            .await
    }

    pub async fn create(
        &self,
        parent: &Arc<Node>,
        name: &str,
        perm: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Node>, Errno> {
        self.create_node(parent, name, mode::REGULAR | (perm & 0o7777), uid, gid, |_| {})
            .await
    }

    pub async fn symlink(
        &self,
        parent: &Arc<Node>,
        name: &str,
        target: &[u8],
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Node>, Errno> {
        let target = target.to_vec();
        let size = target.len() as u64;
        self.create_node(parent, name, mode::SYMLINK | 0o777, uid, gid, move |st| {
            st.target = target;
            st.size = size;
        })
        .await
    }

    async fn remove_entry(&self, parent: &Arc<Node>, name: &str) -> Result<(), Errno> {
        let mut pst = parent.state.lock().await;
        let Some(removed) = pst.children.remove(name) else {
            return Err(libc::ENOENT);
        };
        let parent_times = (pst.mtime, pst.ctime);
        let now = now_nanos();
        pst.mtime = now;
        pst.ctime = now;
        if let Err(e) = self.commit(&parent.key, &mut pst).await {
            // Relink exactly what was removed; the name resolves again.
            pst.children.insert(name.to_owned(), removed);
            (pst.mtime, pst.ctime) = parent_times;
            return Err(store_errno(&e));
        }
        Ok(())
    }

    pub async fn unlink(&self, parent: &Arc<Node>, name: &str) -> Result<(), Errno> {
        let child = self.lookup(parent, name).await?;
        {
            let cst = child.state.lock().await;
            if mode::is_dir(cst.mode) {
                return Err(libc::EISDIR);
            }
        }
        self.remove_entry(parent, name).await
    }

    pub async fn rmdir(&self, parent: &Arc<Node>, name: &str) -> Result<(), Errno> {
        let child = self.lookup(parent, name).await?;
        {
            let cst = child.state.lock().await;
            if !mode::is_dir(cst.mode) {
                return Err(libc::ENOTDIR);
            }
            if !cst.children.is_empty() {
                return Err(libc::ENOTEMPTY);
            }
        }
        self.remove_entry(parent, name).await
    }

    pub async fn rename(
        &self,
        src_parent: &Arc<Node>,
        src_name: &str,
        dst_parent: &Arc<Node>,
        dst_name: &str,
    ) -> Result<(), Errno> {
        self.load(src_parent).await.map_err(|e| store_errno(&e))?;
        self.load(dst_parent).await.map_err(|e| store_errno(&e))?;

        if Arc::ptr_eq(src_parent, dst_parent) {
            let mut st = src_parent.state.lock().await;
            let Some(child) = st.children.get(src_name).cloned() else {
                return Err(libc::ENOENT);
            };
            let displaced = st.children.get(dst_name).cloned();
            let times = (st.mtime, st.ctime);
            st.children.remove(src_name);
            st.children.insert(dst_name.to_owned(), child.clone());
            let now = now_nanos();
            st.mtime = now;
            st.ctime = now;
            if let Err(e) = self.commit(&src_parent.key, &mut st).await {
                st.children.remove(dst_name);
                if let Some(displaced) = displaced {
                    st.children.insert(dst_name.to_owned(), displaced);
                }
                st.children.insert(src_name.to_owned(), child);
                (st.mtime, st.ctime) = times;
                return Err(store_errno(&e));
            }
            return Ok(());
        }

        // Two distinct parents: lock in key order to dodge deadlocks.
        let (mut sg, mut dg) = if src_parent.key < dst_parent.key {
            let sg = src_parent.state.lock().await;
            let dg = dst_parent.state.lock().await;
            (sg, dg)
        } else {
            let dg = dst_parent.state.lock().await;
            let sg = src_parent.state.lock().await;
            (sg, dg)
        };
        self.rename_locked(src_parent, &mut sg, src_name, dst_parent, &mut dg, dst_name)
            .await
    }

    async fn rename_locked(
        &self,
        src_parent: &Arc<Node>,
        sg: &mut MutexGuard<'_, NodeState>,
        src_name: &str,
        dst_parent: &Arc<Node>,
        dg: &mut MutexGuard<'_, NodeState>,
        dst_name: &str,
    ) -> Result<(), Errno> {
        if !mode::is_dir(dg.mode) {
            return Err(libc::ENOTDIR);
        }
        let Some(child) = sg.children.remove(src_name) else {
            return Err(libc::ENOENT);
        };
        let displaced = dg.children.insert(dst_name.to_owned(), child.clone());
        let src_times = (sg.mtime, sg.ctime);
        let dst_times = (dg.mtime, dg.ctime);
        let now = now_nanos();
        sg.mtime = now;
        sg.ctime = now;
        dg.mtime = now;
        dg.ctime = now;

        let result = match self.commit(&src_parent.key, sg).await {
            Ok(()) => self.commit(&dst_parent.key, dg).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            sg.children.insert(src_name.to_owned(), child);
            dg.children.remove(dst_name);
            if let Some(displaced) = displaced {
                dg.children.insert(dst_name.to_owned(), displaced);
            }
            (sg.mtime, sg.ctime) = src_times;
            (dg.mtime, dg.ctime) = dst_times;
            return Err(store_errno(&e));
        }
        Ok(())
    }

    pub async fn setattr(
        &self,
        node: &Arc<Node>,
        changes: AttrChanges,
    ) -> Result<NodeAttr, Errno> {
        self.load(node).await.map_err(|e| store_errno(&e))?;
        let mut st = node.state.lock().await;
        let snapshot = AttrSnapshot::take(&st);
        if let Err(e) = self.apply_changes(&mut st, &changes).await {
            snapshot.restore(&mut st);
            return Err(store_errno(&e));
        }
        match self.commit(&node.key, &mut st).await {
            Ok(()) => Ok(Self::attr_of(node, &st)),
            Err(StoreError::StalePut) => {
                // Someone else committed this node; refresh and retry once.
                let refreshed = match self.metadata.get(&node.key).await {
                    Ok((version, bytes)) => match decode_record(&bytes) {
                        Ok(record) => (version, record),
                        Err(e) => {
                            snapshot.restore(&mut st);
                            return Err(store_errno(&e));
                        }
                    },
                    Err(e) => {
                        snapshot.restore(&mut st);
                        return Err(store_errno(&e));
                    }
                };
                let (version, record) = refreshed;
                if self
                    .apply_record(&mut st, record.clone(), version)
                    .await
                    .is_err()
                {
                    snapshot.restore(&mut st);
                    return Err(libc::EIO);
                }
                node.loaded.store(true, Ordering::Release);
                if let Err(e) = self.apply_changes(&mut st, &changes).await {
                    let _ = self.apply_record(&mut st, record, version).await;
                    return Err(store_errno(&e));
                }
                match self.commit(&node.key, &mut st).await {
                    Ok(()) => Ok(Self::attr_of(node, &st)),
                    Err(e) => {
                        // Fall back to the refreshed committed state.
                        let _ = self.apply_record(&mut st, record, version).await;
                        Err(store_errno(&e))
                    }
                }
            }
            Err(e) => {
                snapshot.restore(&mut st);
                Err(store_errno(&e))
            }
        }
    }

    async fn apply_changes(
        &self,
        st: &mut NodeState,
        changes: &AttrChanges,
    ) -> Result<(), StoreError> {
        if let Some(new_size) = changes.size {
            if new_size != st.size {
                st.blocks = resize_blocks(&self.blobs, &st.blocks, st.size, new_size).await?;
                st.size = new_size;
                st.mtime = now_nanos();
            }
        }
        if let Some(m) = changes.mode {
            st.mode = (st.mode & mode::TYPE_MASK) | (m & !mode::TYPE_MASK);
        }
        if let Some(uid) = changes.uid {
            st.uid = uid;
        }
        if let Some(gid) = changes.gid {
            st.gid = gid;
        }
        if let Some(atime) = changes.atime {
            st.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            st.mtime = mtime;
        }
        st.ctime = now_nanos();
        Ok(())
    }

    pub async fn setxattr(
        &self,
        node: &Arc<Node>,
        name: &str,
        value: &[u8],
    ) -> Result<(), Errno> {
        self.load(node).await.map_err(|e| store_errno(&e))?;
        let mut st = node.state.lock().await;
        let prior = st.xattrs.get(name).cloned();
        let ctime = st.ctime;
        st.xattrs.insert(name.to_owned(), value.to_vec());
        st.ctime = now_nanos();
        if let Err(e) = self.commit(&node.key, &mut st).await {
            // Exact restoration: an added key disappears, a replaced key
            // gets its old value back, and the map size is what it was.
            match prior {
                Some(old) => {
                    st.xattrs.insert(name.to_owned(), old);
                }
                None => {
                    st.xattrs.remove(name);
                }
            }
            st.ctime = ctime;
            return Err(store_errno(&e));
        }
        Ok(())
    }

    pub async fn removexattr(&self, node: &Arc<Node>, name: &str) -> Result<(), Errno> {
        self.load(node).await.map_err(|e| store_errno(&e))?;
        let mut st = node.state.lock().await;
        let Some(prior) = st.xattrs.remove(name) else {
            return Err(libc::ENODATA);
        };
        let ctime = st.ctime;
        st.ctime = now_nanos();
        if let Err(e) = self.commit(&node.key, &mut st).await {
            st.xattrs.insert(name.to_owned(), prior);
            st.ctime = ctime;
            return Err(store_errno(&e));
        }
        Ok(())
    }

    pub async fn read(&self, node: &Arc<Node>, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        self.load(node).await.map_err(|e| store_errno(&e))?;
        let st = node.state.lock().await;
        if offset >= st.size || size == 0 {
            return Ok(Vec::new());
        }
        let end = st.size.min(offset + size as u64);
        let mut out = Vec::with_capacity((end - offset) as usize);
        for idx in offset / BS..=(end - 1) / BS {
            let hash = st.blocks.get(idx as usize).ok_or(libc::EIO)?;
            let block = self.blobs.get(hash).await.map_err(|_| libc::EIO)?;
            let block_start = idx * BS;
            let from = offset.max(block_start) - block_start;
            let to = end.min(block_start + block.len() as u64) - block_start;
            if from < to {
                out.extend_from_slice(&block[from as usize..to as usize]);
            }
        }
        Ok(out)
    }

    pub async fn write(&self, node: &Arc<Node>, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        if data.is_empty() {
            return Ok(0);
        }
        self.load(node).await.map_err(|e| store_errno(&e))?;
        let mut st = node.state.lock().await;
        if !mode::is_regular(st.mode) {
            return Err(libc::EINVAL);
        }
        let len = data.len() as u64;
        let old_size = st.size;
        let new_size = old_size.max(offset + len);

        // Every touched block is hashed and stored before the metadata
        // commit references it.
        let mut dirty = BTreeSet::new();
        let first = offset / BS;
        dirty.extend(first..=(offset + len - 1) / BS);
        if new_size > old_size {
            if old_size % BS != 0 && old_size > 0 {
                // Pad the old partial tail out to a full block.
                dirty.insert((old_size - 1) / BS);
            }
            for idx in old_size.div_ceil(BS)..first {
                dirty.insert(idx);
            }
        }
        let mut new_blocks = st.blocks.clone();
        new_blocks.resize(new_size.div_ceil(BS) as usize, [0u8; 32]);
        for idx in dirty {
            let block_start = idx * BS;
            let block_len = BS.min(new_size - block_start) as usize;
            let mut buf = vec![0u8; block_len];
            if (idx as usize) < st.blocks.len() {
                let old = self
                    .blobs
                    .get(&st.blocks[idx as usize])
                    .await
                    .map_err(|_| libc::EIO)?;
                let keep = old.len().min(block_len);
                buf[..keep].copy_from_slice(&old[..keep]);
            }
            let overlay_start = offset.max(block_start);
            let overlay_end = (offset + len).min(block_start + block_len as u64);
            if overlay_start < overlay_end {
                buf[(overlay_start - block_start) as usize..(overlay_end - block_start) as usize]
                    .copy_from_slice(
                        &data[(overlay_start - offset) as usize..(overlay_end - offset) as usize],
                    );
            }
            new_blocks[idx as usize] = self.blobs.put(&buf).await.map_err(|_| libc::EIO)?;
        }

        let snapshot = AttrSnapshot::take(&st);
        st.blocks = new_blocks;
        st.size = new_size;
        let now = now_nanos();
        st.mtime = now;
        st.ctime = now;
        if let Err(e) = self.commit(&node.key, &mut st).await {
            snapshot.restore(&mut st);
            return Err(store_errno(&e));
        }
        Ok(data.len() as u32)
    }
}

fn decode_record(bytes: &[u8]) -> Result<NodeRecord, StoreError> {
    bincode::deserialize(bytes)
        .map_err(|e| StoreError::Protocol(format!("could not decode node record: {e}")))
}

/// Recompute a file's block list for a new size. Shrinking truncates the
/// tail; growing pads with zeros. Block boundaries stay fixed-size.
async fn resize_blocks(
    blobs: &BlobStore,
    blocks: &[BlockHash],
    old_size: u64,
    new_size: u64,
) -> Result<Vec<BlockHash>, StoreError> {
    if new_size == old_size {
        return Ok(blocks.to_vec());
    }
    if new_size == 0 {
        return Ok(Vec::new());
    }
    let new_count = new_size.div_ceil(BS) as usize;
    let mut out: Vec<BlockHash> = blocks.iter().take(new_count).copied().collect();
    if new_size < old_size {
        let tail_len = (new_size - (new_count as u64 - 1) * BS) as usize;
        if tail_len < BS as usize {
            let old_tail = blobs.get(&out[new_count - 1]).await?;
            let keep = old_tail.len().min(tail_len);
            let mut buf = old_tail;
            buf.truncate(keep);
            buf.resize(tail_len, 0);
            out[new_count - 1] = blobs.put(&buf).await?;
        }
        return Ok(out);
    }
    // Growing: pad the old partial tail, then append zero blocks.
    let old_count = blocks.len();
    if old_size % BS != 0 && old_count > 0 {
        let idx = old_count - 1;
        let block_start = idx as u64 * BS;
        let block_len = BS.min(new_size - block_start) as usize;
        let old_tail = blobs.get(&blocks[idx]).await?;
        let mut buf = old_tail;
        buf.resize(block_len, 0);
        out[idx] = blobs.put(&buf).await?;
    }
    for idx in old_count..new_count {
        let block_start = idx as u64 * BS;
        let block_len = BS.min(new_size - block_start) as usize;
        out.push(blobs.put(&vec![0u8; block_len]).await?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_helpers() {
        assert!(mode::is_dir(mode::DIRECTORY | 0o755));
        assert!(mode::is_regular(mode::REGULAR | 0o644));
        assert!(mode::is_symlink(mode::SYMLINK | 0o777));
        assert!(!mode::is_dir(mode::REGULAR | 0o644));
    }

    #[test]
    fn record_round_trip() {
        let record = NodeRecord {
            mode: mode::DIRECTORY | 0o755,
            uid: 1000,
            gid: 1000,
            atime: 1,
            mtime: 2,
            ctime: 3,
            size: 0,
            xattrs: BTreeMap::from([("user.note".to_owned(), b"hi".to_vec())]),
            children: vec![("a".to_owned(), [7u8; NODE_KEY_LEN])],
            blocks: vec![[9u8; 32]],
            target: Vec::new(),
        };
        let bytes = bincode::serialize(&record).unwrap();
        assert_eq!(decode_record(&bytes).unwrap(), record);
    }

    #[test]
    fn tombstones_do_not_decode() {
        assert!(decode_record(&[]).is_err());
    }
}
